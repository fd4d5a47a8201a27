//! View identity and navigation handling
//!
//! A view is one page instance, identified by its URL. Affordances inserted
//! into a page and the flags remembering that belong to the view and are
//! cleared when it changes. Operations, guard entries and pollers are not
//! touched here.

use crate::backend::OperationBackend;
use crate::presentation::{lock_screen, Affordance, SharedScreen};
use crate::status::EntityId;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Delay before re-reading the location after a programmatic navigation.
pub const HISTORY_RECHECK_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewToken(Url);

impl ViewToken {
    pub fn new(url: Url) -> Self {
        Self(url)
    }

    pub fn url(&self) -> &Url {
        &self.0
    }
}

impl std::fmt::Display for ViewToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    App(EntityId),
    Workshop { appid: EntityId, pubfile_id: u64 },
    Other,
}

/// Store and community app pages carry the appid in the path; workshop item
/// pages carry `id` (and `appid`) in the query.
pub fn classify(url: &Url) -> PageKind {
    let host = url.host_str().unwrap_or_default();
    let mut segments = url.path_segments().into_iter().flatten();

    match (host, segments.next(), segments.next()) {
        ("store.steampowered.com" | "steamcommunity.com", Some("app"), Some(id)) => id
            .parse::<u64>()
            .map(|id| PageKind::App(EntityId(id)))
            .unwrap_or(PageKind::Other),
        ("steamcommunity.com", Some("sharedfiles" | "workshop"), Some("filedetails")) => {
            let query = |key: &str| {
                url.query_pairs()
                    .find(|(k, _)| k == key)
                    .and_then(|(_, v)| v.parse::<u64>().ok())
            };
            match (query("id"), query("appid")) {
                (Some(pubfile_id), Some(appid)) => PageKind::Workshop {
                    appid: EntityId(appid),
                    pubfile_id,
                },
                _ => PageKind::Other,
            }
        }
        _ => PageKind::Other,
    }
}

/// View-local insertion flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewFlags {
    pub button_inserted: bool,
    pub restart_inserted: bool,
    pub icon_inserted: bool,
    pub workshop_inserted: bool,
    pub presence_check: Option<EntityId>,
}

/// Current page as the host reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    pub url: Url,
    /// Whether the page's content container has rendered.
    pub container_ready: bool,
}

#[derive(Debug, Default)]
struct ViewState {
    token: Option<ViewToken>,
    flags: ViewFlags,
    missing_logged: bool,
    changes: u64,
}

#[derive(Clone)]
pub struct ViewCoordinator {
    state: Arc<Mutex<ViewState>>,
    screen: SharedScreen,
    backend: Arc<dyn OperationBackend>,
}

impl ViewCoordinator {
    pub fn new(screen: SharedScreen, backend: Arc<dyn OperationBackend>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ViewState::default())),
            screen,
            backend,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn flags(&self) -> ViewFlags {
        self.lock().flags.clone()
    }

    /// Number of view changes seen so far.
    #[cfg(test)]
    pub fn changes(&self) -> u64 {
        self.lock().changes
    }

    /// Compare `url` against the last-seen one and reset the view when it
    /// differs. Every navigation trigger goes through here, so one
    /// transition fires at most once.
    pub fn observe(&self, url: &Url) -> bool {
        let mut state = self.lock();
        if state.token.as_ref().map(ViewToken::url) == Some(url) {
            return false;
        }
        let previous = state.token.replace(ViewToken::new(url.clone()));
        Self::on_view_changed(&mut state, &self.screen);
        info!(
            "View changed: {} -> {}",
            previous.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
            url
        );
        true
    }

    fn on_view_changed(state: &mut ViewState, screen: &SharedScreen) {
        state.flags = ViewFlags::default();
        state.missing_logged = false;
        state.changes += 1;
        lock_screen(screen).clear_affordances();
    }

    /// Insert whatever affordances the current page is missing. Safe to call
    /// on every tick. Returns the presence check it started, if any.
    pub fn discover(&self, container_ready: bool) -> Option<JoinHandle<()>> {
        let mut state = self.lock();
        let token = state.token.clone()?;
        let page = classify(token.url());
        if page == PageKind::Other {
            return None;
        }

        if !container_ready {
            if !state.missing_logged {
                state.missing_logged = true;
                info!("Page container not found on {}, waiting for it", token);
            }
            return None;
        }
        state.missing_logged = false;

        let mut screen = lock_screen(&self.screen);
        match page {
            PageKind::App(appid) => {
                if !state.flags.icon_inserted {
                    screen.insert_affordance(Affordance::Icon);
                    state.flags.icon_inserted = true;
                }
                if !state.flags.restart_inserted {
                    screen.insert_affordance(Affordance::RestartSteam);
                    state.flags.restart_inserted = true;
                }
                if state.flags.button_inserted || state.flags.presence_check == Some(appid) {
                    return None;
                }
                state.flags.presence_check = Some(appid);
                drop(screen);
                drop(state);
                Some(self.spawn_presence_check(token, appid))
            }
            PageKind::Workshop { appid, pubfile_id } => {
                if !state.flags.workshop_inserted {
                    screen.insert_affordance(Affordance::WorkshopDownload { appid, pubfile_id });
                    state.flags.workshop_inserted = true;
                    debug!("Workshop affordance inserted for {}/{}", appid, pubfile_id);
                }
                None
            }
            PageKind::Other => None,
        }
    }

    fn spawn_presence_check(&self, token: ViewToken, appid: EntityId) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let present = coordinator.backend.has_luatools(appid).await;
            coordinator.finish_presence_check(&token, appid, present);
        })
    }

    fn finish_presence_check(
        &self,
        token: &ViewToken,
        appid: EntityId,
        present: Result<bool, crate::backend::BackendError>,
    ) {
        let mut state = self.lock();
        if state.token.as_ref() != Some(token) {
            debug!("Discarding presence result for {} from an old view", appid);
            return;
        }
        state.flags.presence_check = None;
        state.flags.button_inserted = true;

        match present {
            Ok(true) => debug!("LuaTools already present for {}", appid),
            Ok(false) => {
                lock_screen(&self.screen).insert_affordance(Affordance::AddViaLuaTools(appid));
            }
            Err(e) => {
                warn!("Presence check for {} failed: {}", appid, e);
                lock_screen(&self.screen).insert_affordance(Affordance::AddViaLuaTools(appid));
            }
        }
    }
}

/// History events the host emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavEvent {
    Push,
    Replace,
    /// Back or forward.
    Traverse,
}

pub struct NavigationWatcher {
    coordinator: ViewCoordinator,
    location: watch::Receiver<PageSnapshot>,
    events: mpsc::UnboundedReceiver<NavEvent>,
    poll_interval: Duration,
}

impl NavigationWatcher {
    pub fn new(
        coordinator: ViewCoordinator,
        location: watch::Receiver<PageSnapshot>,
        events: mpsc::UnboundedReceiver<NavEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            location,
            events,
            poll_interval,
        }
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    async fn run(mut self, token: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // A programmatic navigation updates the location after the event,
        // so its check is deferred. Later pushes move the deadline.
        let mut recheck: Option<Instant> = None;

        loop {
            let deadline = recheck.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.check(),
                _ = sleep_until(deadline), if recheck.is_some() => {
                    recheck = None;
                    self.check();
                }
                event = self.events.recv() => match event {
                    Some(NavEvent::Push) | Some(NavEvent::Replace) => {
                        recheck = Some(Instant::now() + HISTORY_RECHECK_DELAY);
                    }
                    Some(NavEvent::Traverse) => self.check(),
                    None => break,
                },
            }
        }
        debug!("Navigation watcher stopped");
    }

    fn check(&self) {
        let snapshot = self.location.borrow().clone();
        self.coordinator.observe(&snapshot.url);
        self.coordinator.discover(snapshot.container_ready);
    }
}
