//! Application state and key actions
//!
//! The host stands in for the store client: a short list of pages, a
//! history stack, and the page actions that launch LuaTools operations.
//! Location and history changes go out over channels to the navigation
//! watcher; everything drawn comes from the shared screen.

use crate::launcher::{LaunchError, LaunchOutcome, OperationController, OperationSummary};
use crate::presentation::{lock_screen, Affordance, SharedScreen};
use crate::status::{EntityId, OperationKind};
use crate::view::{classify, NavEvent, PageKind, PageSnapshot};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use url::Url;

/// How long a freshly opened page takes to render its content container.
pub const PAGE_LOAD_DELAY: Duration = Duration::from_millis(300);

const BOOKMARKS: &[(&str, &str)] = &[
    ("Steam Store", "https://store.steampowered.com/"),
    (
        "Half-Life 2",
        "https://store.steampowered.com/app/220/HalfLife_2/",
    ),
    (
        "Team Fortress 2",
        "https://store.steampowered.com/app/440/Team_Fortress_2/",
    ),
    ("Garry's Mod", "https://steamcommunity.com/app/4000"),
    (
        "Workshop: gm_construct remake",
        "https://steamcommunity.com/sharedfiles/filedetails/?id=2503622437&appid=4000",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub title: String,
    pub url: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusModalType {
    Error {
        title: String,
        details: String,
        suggestions: Vec<String>,
    },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    StatusModal(StatusModalType),
}

pub struct App {
    pub pages: Vec<Page>,
    pub selected: usize,
    pub current: Page,
    pub history: Vec<Page>,
    pub loaded_at: Instant,
    pub input_mode: InputMode,
    pub message: Option<String>,
    pub should_quit: bool,
    pub show_operation_sidebar: bool,
    pub screen: SharedScreen,
    pub controller: OperationController,
    location_tx: watch::Sender<PageSnapshot>,
    nav_tx: mpsc::UnboundedSender<NavEvent>,
}

impl App {
    /// Build the host on `start_url`. The returned receivers feed the
    /// navigation watcher.
    pub fn new(
        start_url: &Url,
        controller: OperationController,
        screen: SharedScreen,
    ) -> (
        Self,
        watch::Receiver<PageSnapshot>,
        mpsc::UnboundedReceiver<NavEvent>,
    ) {
        let pages = bookmarks(start_url);
        let current = pages
            .iter()
            .find(|page| &page.url == start_url)
            .cloned()
            .unwrap_or_else(|| page_for(start_url));

        let (location_tx, location_rx) = watch::channel(PageSnapshot {
            url: current.url.clone(),
            container_ready: false,
        });
        let (nav_tx, nav_rx) = mpsc::unbounded_channel();

        let app = App {
            pages,
            selected: 0,
            current,
            history: Vec::new(),
            loaded_at: Instant::now(),
            input_mode: InputMode::Normal,
            message: None,
            should_quit: false,
            show_operation_sidebar: false,
            screen,
            controller,
            location_tx,
            nav_tx,
        };
        (app, location_rx, nav_rx)
    }

    pub fn page_kind(&self) -> PageKind {
        classify(&self.current.url)
    }

    /// Entity the current page is about, if any.
    pub fn current_entity(&self) -> Option<EntityId> {
        match self.page_kind() {
            PageKind::App(appid) => Some(appid),
            PageKind::Workshop { appid, .. } => Some(appid),
            PageKind::Other => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        !self.location_tx.borrow().container_ready
    }

    pub fn affordances(&self) -> Vec<Affordance> {
        lock_screen(&self.screen).affordances().to_vec()
    }

    pub fn operations(&self) -> Vec<OperationSummary> {
        self.controller.operations()
    }

    /// Finish loading the current page once its delay has passed.
    pub fn tick(&mut self) {
        if self.is_loading() && self.loaded_at.elapsed() >= PAGE_LOAD_DELAY {
            debug!("Page ready: {}", self.current.url);
            self.location_tx.send_modify(|snapshot| snapshot.container_ready = true);
        }
    }

    // ============== Navigation ==============

    pub fn next(&mut self) {
        if !self.pages.is_empty() {
            self.selected = (self.selected + 1) % self.pages.len();
        }
    }

    pub fn previous(&mut self) {
        if !self.pages.is_empty() {
            if self.selected > 0 {
                self.selected -= 1;
            } else {
                self.selected = self.pages.len() - 1;
            }
        }
    }

    /// Open the selected page as a programmatic push.
    pub fn open_selected(&mut self) {
        let Some(page) = self.pages.get(self.selected).cloned() else {
            return;
        };
        if page.url == self.current.url {
            return;
        }
        info!("Navigating to {}", page.url);
        let previous = std::mem::replace(&mut self.current, page);
        self.history.push(previous);
        self.load_current(NavEvent::Push);
    }

    pub fn go_back(&mut self) {
        let Some(page) = self.history.pop() else {
            self.message = Some("No previous page".to_string());
            return;
        };
        info!("Going back to {}", page.url);
        self.current = page;
        self.load_current(NavEvent::Traverse);
    }

    /// Load the current page again in place of itself.
    pub fn reload(&mut self) {
        info!("Reloading {}", self.current.url);
        self.load_current(NavEvent::Replace);
    }

    fn load_current(&mut self, event: NavEvent) {
        self.loaded_at = Instant::now();
        self.location_tx.send_replace(PageSnapshot {
            url: self.current.url.clone(),
            container_ready: false,
        });
        if self.nav_tx.send(event).is_err() {
            warn!("Navigation watcher is gone");
        }
    }

    // ============== Operations ==============

    pub async fn install_current(&mut self) {
        let Some(appid) = self.require_app_page() else {
            return;
        };
        let result = self.controller.install(appid).await;
        self.report_launch(OperationKind::Install, appid, result);
    }

    pub async fn apply_fix_current(&mut self) {
        let Some(appid) = self.require_app_page() else {
            return;
        };
        let game_name = self.current.title.clone();
        let result = self.controller.apply_available_fix(appid, game_name).await;
        self.report_launch(OperationKind::ApplyFix, appid, result);
    }

    pub async fn unfix_current(&mut self) {
        let Some(appid) = self.require_app_page() else {
            return;
        };
        let result = self.controller.unfix(appid, String::new()).await;
        self.report_launch(OperationKind::Unfix, appid, result);
    }

    pub async fn workshop_download_current(&mut self) {
        let PageKind::Workshop { appid, pubfile_id } = self.page_kind() else {
            self.message = Some("Open a workshop item page first".to_string());
            return;
        };
        let result = self.controller.download_workshop(appid, pubfile_id).await;
        self.report_launch(OperationKind::WorkshopDownload, appid, result);
    }

    pub async fn cancel_current(&mut self) {
        let Some(entity) = self.current_entity() else {
            return;
        };
        let Some(kind) = self.controller.active_kind(entity) else {
            self.message = Some("Nothing to cancel on this page".to_string());
            return;
        };
        match self.controller.cancel(entity).await {
            Ok(()) => self.message = Some("Cancellation requested".to_string()),
            Err(LaunchError::NotRunning(_)) => {
                self.message = Some("Nothing to cancel on this page".to_string());
            }
            Err(e) => {
                // The poller may have seen the end while the request was out.
                let finished = self
                    .controller
                    .last_update(entity, kind)
                    .map_or(false, |update| update.state.is_terminal());
                let suggestion = if finished {
                    "The operation already finished"
                } else {
                    "The operation keeps running"
                };
                self.show_error(
                    "Cancel failed".to_string(),
                    e.to_string(),
                    vec![suggestion.to_string()],
                );
            }
        }
    }

    /// Hide or close every popup belonging to the current page's entity.
    pub fn hide_current(&mut self) {
        let Some(entity) = self.current_entity() else {
            return;
        };
        let hidden = OperationKind::ALL
            .iter()
            .filter(|kind| self.controller.hide(entity, **kind))
            .count();
        if hidden == 0 {
            self.message = Some("No popup to hide".to_string());
        }
    }

    pub fn reopen_current(&mut self) {
        let Some(entity) = self.current_entity() else {
            return;
        };
        let reopened = OperationKind::ALL
            .iter()
            .filter(|kind| self.controller.reopen(entity, **kind))
            .count();
        if reopened == 0 {
            self.message = Some("No hidden popup for this page".to_string());
        }
    }

    /// Stop following the current page's operations. The backend keeps
    /// working; only the poller and popup go away.
    pub fn detach_current(&mut self) {
        let Some(entity) = self.current_entity() else {
            return;
        };
        let detached = OperationKind::ALL
            .iter()
            .filter(|kind| self.controller.detach(entity, **kind))
            .count();
        if detached > 0 {
            self.message = Some(format!("Stopped following {} operation(s)", detached));
        }
    }

    fn require_app_page(&mut self) -> Option<EntityId> {
        match self.page_kind() {
            PageKind::App(appid) => Some(appid),
            _ => {
                self.message = Some("Open a game page first".to_string());
                None
            }
        }
    }

    fn report_launch(
        &mut self,
        kind: OperationKind,
        entity: EntityId,
        result: Result<LaunchOutcome, LaunchError>,
    ) {
        match result {
            Ok(LaunchOutcome::Started) => {
                self.message = Some(format!("{} started for {}", kind_title(kind), entity));
            }
            Ok(LaunchOutcome::AlreadyRunning) => {
                self.message = Some(format!("An operation is already running for {}", entity));
            }
            Err(e) => self.show_error(
                format!("{} failed", kind_title(kind)),
                e.to_string(),
                launch_suggestions(kind),
            ),
        }
    }

    // ============== Modals ==============

    pub fn show_status_modal(&mut self, modal_type: StatusModalType) {
        self.input_mode = InputMode::StatusModal(modal_type);
    }

    pub fn show_error(&mut self, title: String, details: String, suggestions: Vec<String>) {
        self.show_status_modal(StatusModalType::Error {
            title,
            details,
            suggestions,
        });
    }

    pub fn show_help(&mut self) {
        self.show_status_modal(StatusModalType::Help);
    }

    pub fn close_modal(&mut self) {
        self.input_mode = InputMode::Normal;
    }

    pub fn clear_message(&mut self) {
        self.message = None;
    }
}

pub fn kind_title(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Install => "Install",
        OperationKind::ApplyFix => "Apply fix",
        OperationKind::Unfix => "Un-fix",
        OperationKind::WorkshopDownload => "Workshop download",
    }
}

fn launch_suggestions(kind: OperationKind) -> Vec<String> {
    let mut suggestions = vec!["Check that the LuaTools backend is running".to_string()];
    if kind == OperationKind::ApplyFix {
        suggestions.push("Make sure the game is installed".to_string());
    }
    suggestions
}

fn page_for(url: &Url) -> Page {
    let title = match classify(url) {
        PageKind::App(appid) => format!("App {}", appid),
        PageKind::Workshop { pubfile_id, .. } => format!("Workshop item {}", pubfile_id),
        PageKind::Other => url.host_str().unwrap_or("Page").to_string(),
    };
    Page {
        title,
        url: url.clone(),
    }
}

/// Built-in pages, with `start` first when it is not one of them.
fn bookmarks(start: &Url) -> Vec<Page> {
    let mut pages: Vec<Page> = BOOKMARKS
        .iter()
        .filter_map(|(title, url)| {
            Url::parse(url).ok().map(|url| Page {
                title: title.to_string(),
                url,
            })
        })
        .collect();
    if !pages.iter().any(|page| &page.url == start) {
        pages.insert(0, page_for(start));
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{install, ScriptedBackend};
    use crate::backend::{FixAvailability, StartRequest};
    use crate::guard::{GuardScope, OperationGuard};
    use crate::presentation::{shared_screen, SurfaceMarker};
    use std::sync::Arc;

    fn app(
        backend: &Arc<ScriptedBackend>,
        start: &str,
    ) -> (
        App,
        watch::Receiver<PageSnapshot>,
        mpsc::UnboundedReceiver<NavEvent>,
    ) {
        let screen = shared_screen();
        let controller = OperationController::new(
            backend.clone(),
            OperationGuard::new(GuardScope::Entity),
            screen.clone(),
        );
        App::new(&Url::parse(start).unwrap(), controller, screen)
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_publishes_location_and_history_events() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut app, location, mut events) = app(&backend, "https://store.steampowered.com/");
        assert_eq!(app.pages[0].title, "Steam Store");
        assert!(app.is_loading());

        app.next();
        app.open_selected();
        assert_eq!(app.current_entity(), Some(EntityId(220)));
        assert_eq!(events.try_recv().unwrap(), NavEvent::Push);
        assert!(!location.borrow().container_ready);

        tokio::time::advance(PAGE_LOAD_DELAY).await;
        app.tick();
        assert!(location.borrow().container_ready);

        app.reload();
        assert_eq!(events.try_recv().unwrap(), NavEvent::Replace);
        assert!(app.is_loading());
        assert_eq!(app.current_entity(), Some(EntityId(220)));

        app.go_back();
        assert_eq!(events.try_recv().unwrap(), NavEvent::Traverse);
        assert_eq!(location.borrow().url.as_str(), "https://store.steampowered.com/");
        assert_eq!(app.current_entity(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_start_page_is_listed_first() {
        let backend = Arc::new(ScriptedBackend::new());
        let (app, _location, _events) = app(&backend, "https://store.steampowered.com/app/570/");
        assert_eq!(app.pages[0].title, "App 570");
        assert_eq!(app.current_entity(), Some(EntityId(570)));
    }

    #[tokio::test(start_paused = true)]
    async fn install_opens_a_popup_and_a_second_press_is_ignored() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(
            OperationKind::Install,
            EntityId(220),
            vec![install("downloading", 1, 10)],
        );
        let (mut app, _location, _events) =
            app(&backend, "https://store.steampowered.com/app/220/HalfLife_2/");

        app.install_current().await;
        app.install_current().await;

        assert_eq!(backend.starts().len(), 1);
        assert_eq!(app.input_mode, InputMode::Normal);
        assert_eq!(
            app.message.as_deref(),
            Some("An operation is already running for 220")
        );
        assert!(lock_screen(&app.screen)
            .surface(SurfaceMarker::new(OperationKind::Install, EntityId(220)))
            .is_some());

        app.hide_current();
        assert_eq!(lock_screen(&app.screen).surface_count(), 0);
        app.reopen_current();
        assert_eq!(lock_screen(&app.screen).surface_count(), 1);
        app.controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn launch_error_is_shown_in_an_alert() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.set_fixes(
            EntityId(220),
            FixAvailability {
                online: true,
                ..FixAvailability::default()
            },
        );
        let (mut app, _location, _events) =
            app(&backend, "https://store.steampowered.com/app/220/HalfLife_2/");

        app.apply_fix_current().await;
        match &app.input_mode {
            InputMode::StatusModal(StatusModalType::Error { title, details, .. }) => {
                assert_eq!(title, "Apply fix failed");
                assert_eq!(details, "Game install path not found");
            }
            other => panic!("expected an error modal, got {:?}", other),
        }
        app.close_modal();
        assert_eq!(app.input_mode, InputMode::Normal);
        assert!(backend.starts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn workshop_download_needs_a_workshop_page() {
        let backend = Arc::new(ScriptedBackend::new());
        let (mut app, _location, _events) =
            app(&backend, "https://store.steampowered.com/app/220/HalfLife_2/");
        app.workshop_download_current().await;
        assert!(backend.starts().is_empty());
        assert_eq!(
            app.message.as_deref(),
            Some("Open a workshop item page first")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fix_is_picked_from_the_backend_check() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.set_install_path(EntityId(220), "/games/hl2");
        backend.set_fixes(
            EntityId(220),
            FixAvailability {
                game_name: Some("Half-Life 2".to_string()),
                generic: true,
                ..FixAvailability::default()
            },
        );
        let (mut app, _location, _events) =
            app(&backend, "https://store.steampowered.com/app/220/HalfLife_2/");

        app.apply_fix_current().await;
        assert_eq!(app.input_mode, InputMode::Normal);
        assert_eq!(
            backend.starts(),
            vec![StartRequest::ApplyFix {
                appid: EntityId(220),
                download_url: "https://files.luatools.work/GameBypasses/220.zip".to_string(),
                install_path: "/games/hl2".to_string(),
                fix_type: "Generic Fix".to_string(),
                game_name: "Half-Life 2".to_string(),
            }]
        );
        app.controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn game_without_fixes_is_refused() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.set_install_path(EntityId(440), "/games/tf2");
        let (mut app, _location, _events) =
            app(&backend, "https://store.steampowered.com/app/440/Team_Fortress_2/");

        app.apply_fix_current().await;
        match &app.input_mode {
            InputMode::StatusModal(StatusModalType::Error { details, .. }) => {
                assert_eq!(details, "No fix available for this game");
            }
            other => panic!("expected an error modal, got {:?}", other),
        }
        assert!(backend.starts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cancel_after_completion_does_not_claim_it_still_runs() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.script(
            OperationKind::Install,
            EntityId(220),
            vec![install("downloading", 1, 10), install("done", 10, 10)],
        );
        backend.fail_cancel(Some("Nothing to cancel"));
        backend.delay_cancel(Duration::from_secs(1));
        let (mut app, _location, _events) =
            app(&backend, "https://store.steampowered.com/app/220/HalfLife_2/");

        app.install_current().await;
        app.cancel_current().await;
        match &app.input_mode {
            InputMode::StatusModal(StatusModalType::Error {
                title, suggestions, ..
            }) => {
                assert_eq!(title, "Cancel failed");
                assert_eq!(suggestions, &vec!["The operation already finished".to_string()]);
            }
            other => panic!("expected an error modal, got {:?}", other),
        }
        assert_eq!(
            lock_screen(&app.screen)
                .surface(SurfaceMarker::new(OperationKind::Install, EntityId(220)))
                .unwrap()
                .status_line,
            "Game added!"
        );
        app.controller.shutdown().await;
    }
}
