//! Progress surfaces and the presentation adapter
//!
//! The [`Screen`] is the ambient UI structure: page affordances plus every
//! open progress surface, keyed by a structural [`SurfaceMarker`]. Pollers
//! never hold a surface; the adapter looks it up on each update and quietly
//! does nothing when the user has closed it.

use crate::backend::StartRequest;
use crate::status::{
    DoneDetail, DownloadProgress, EntityId, FailureReason, LifecycleState, OperationKind, Percent,
    StatusUpdate,
};
use log::debug;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type SharedScreen = Arc<Mutex<Screen>>;

pub fn shared_screen() -> SharedScreen {
    Arc::new(Mutex::new(Screen::default()))
}

pub fn lock_screen(screen: &SharedScreen) -> MutexGuard<'_, Screen> {
    screen.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Structural address of a progress surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceMarker {
    pub kind: OperationKind,
    pub entity: EntityId,
}

impl SurfaceMarker {
    pub fn new(kind: OperationKind, entity: EntityId) -> Self {
        Self { kind, entity }
    }
}

/// Page affordances inserted by view discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affordance {
    AddViaLuaTools(EntityId),
    RestartSteam,
    Icon,
    WorkshopDownload { appid: EntityId, pubfile_id: u64 },
}

impl Affordance {
    pub fn label(&self) -> &'static str {
        match self {
            Affordance::AddViaLuaTools(_) => "Add via LuaTools",
            Affordance::RestartSteam => "Restart Steam",
            Affordance::Icon => "LuaTools",
            Affordance::WorkshopDownload { .. } => "Download",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dismiss {
    /// Closing only hides; the operation keeps running.
    Hide,
    Close,
}

impl Dismiss {
    pub fn label(&self) -> &'static str {
        match self {
            Dismiss::Hide => "Hide",
            Dismiss::Close => "Close",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Working,
    Success,
    Error,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressBar {
    pub visible: bool,
    pub fill: Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelButton {
    pub visible: bool,
    pub pending: bool,
}

impl CancelButton {
    pub fn label(&self) -> &'static str {
        if self.pending {
            "Cancelling..."
        } else {
            "Cancel"
        }
    }
}

/// What a launcher wants its surface to look like before the first update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceConfig {
    pub title: String,
    pub initial_message: String,
    pub cancellable: bool,
    /// Name used in completion texts (the fix type for apply-fix).
    pub subject: Option<String>,
}

impl SurfaceConfig {
    pub fn for_request(request: &StartRequest) -> Self {
        match request {
            StartRequest::Install { .. } => Self {
                title: "LuaTools".to_string(),
                initial_message: "Checking availability…".to_string(),
                cancellable: true,
                subject: None,
            },
            StartRequest::ApplyFix { fix_type, .. } => {
                let fix = if fix_type.trim().is_empty() {
                    "Fix".to_string()
                } else {
                    fix_type.clone()
                };
                Self {
                    title: format!("Applying {}", fix),
                    initial_message: "Downloading...".to_string(),
                    cancellable: true,
                    subject: Some(fix),
                }
            }
            StartRequest::Unfix { .. } => Self {
                title: "Un-Fixing game".to_string(),
                initial_message: "Removing fix files...".to_string(),
                cancellable: false,
                subject: None,
            },
            StartRequest::WorkshopDownload { .. } => Self {
                title: "Workshop Downloader".to_string(),
                initial_message: "Initializing...".to_string(),
                cancellable: true,
                subject: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSurface {
    pub title: String,
    pub status_line: String,
    pub progress: ProgressBar,
    /// `None` when the operation kind offers no cancellation.
    pub cancel: Option<CancelButton>,
    pub dismiss: Dismiss,
    pub tone: Tone,
}

impl ProgressSurface {
    pub fn new(config: &SurfaceConfig) -> Self {
        Self {
            title: config.title.clone(),
            status_line: config.initial_message.clone(),
            progress: ProgressBar {
                visible: false,
                fill: Percent::Known(0),
            },
            cancel: config.cancellable.then_some(CancelButton {
                visible: true,
                pending: false,
            }),
            dismiss: Dismiss::Hide,
            tone: Tone::Working,
        }
    }

    pub fn is_final(&self) -> bool {
        self.dismiss == Dismiss::Close
    }
}

#[derive(Debug, Default)]
pub struct Screen {
    surfaces: BTreeMap<SurfaceMarker, ProgressSurface>,
    affordances: Vec<Affordance>,
}

impl Screen {
    pub fn surface(&self, marker: SurfaceMarker) -> Option<&ProgressSurface> {
        self.surfaces.get(&marker)
    }

    pub fn surface_mut(&mut self, marker: SurfaceMarker) -> Option<&mut ProgressSurface> {
        self.surfaces.get_mut(&marker)
    }

    pub fn surfaces(&self) -> impl Iterator<Item = (&SurfaceMarker, &ProgressSurface)> {
        self.surfaces.iter()
    }

    #[cfg(test)]
    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    /// Returns false when a surface with this marker already exists.
    pub fn open_surface(&mut self, marker: SurfaceMarker, surface: ProgressSurface) -> bool {
        if self.surfaces.contains_key(&marker) {
            return false;
        }
        self.surfaces.insert(marker, surface);
        true
    }

    pub fn remove_surface(&mut self, marker: SurfaceMarker) -> Option<ProgressSurface> {
        self.surfaces.remove(&marker)
    }

    pub fn affordances(&self) -> &[Affordance] {
        &self.affordances
    }

    pub fn has_affordance(&self, affordance: &Affordance) -> bool {
        self.affordances.contains(affordance)
    }

    pub fn insert_affordance(&mut self, affordance: Affordance) -> bool {
        if self.has_affordance(&affordance) {
            return false;
        }
        self.affordances.push(affordance);
        true
    }

    pub fn remove_affordance(&mut self, affordance: &Affordance) -> bool {
        let before = self.affordances.len();
        self.affordances.retain(|a| a != affordance);
        self.affordances.len() != before
    }

    /// Page content is gone; surfaces float above the page and survive.
    pub fn clear_affordances(&mut self) {
        self.affordances.clear();
    }
}

/// Status line in effect before a cancel request, restored if it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelMark {
    previous_line: String,
}

/// Reflects one operation's updates onto its surface, if there is one.
#[derive(Debug, Clone)]
pub struct PresentationAdapter {
    screen: SharedScreen,
    marker: SurfaceMarker,
    config: SurfaceConfig,
}

impl PresentationAdapter {
    pub fn new(screen: SharedScreen, marker: SurfaceMarker, config: SurfaceConfig) -> Self {
        Self {
            screen,
            marker,
            config,
        }
    }

    #[cfg(test)]
    pub fn marker(&self) -> SurfaceMarker {
        self.marker
    }

    /// Create the surface if it is missing and replay `last` onto it.
    pub fn open(&self, last: Option<&StatusUpdate>) -> bool {
        let opened = {
            let mut screen = lock_screen(&self.screen);
            screen.open_surface(self.marker, ProgressSurface::new(&self.config))
        };
        if let Some(update) = last {
            self.on_update(update);
        }
        opened
    }

    pub fn hide(&self) -> bool {
        lock_screen(&self.screen).remove_surface(self.marker).is_some()
    }

    pub fn on_update(&self, update: &StatusUpdate) {
        let mut screen = lock_screen(&self.screen);

        match screen.surface_mut(self.marker) {
            Some(surface) => apply(surface, self.marker.kind, &self.config, update),
            None => debug!("No surface for {:?}, skipping {}", self.marker, update.state.name()),
        }

        if self.marker.kind == OperationKind::Install
            && matches!(update.state, LifecycleState::Done { .. })
            && screen.remove_affordance(&Affordance::AddViaLuaTools(self.marker.entity))
        {
            debug!("Removed add affordance for {}", self.marker.entity);
        }
    }

    /// Mark the cancel affordance pending. `None` when there is no surface,
    /// no cancel affordance, or a cancel is already pending.
    pub fn begin_cancel(&self) -> Option<CancelMark> {
        let mut screen = lock_screen(&self.screen);
        let surface = screen.surface_mut(self.marker)?;
        let cancel = surface.cancel.as_mut()?;
        if cancel.pending || !cancel.visible {
            return None;
        }
        cancel.pending = true;
        let mark = CancelMark {
            previous_line: std::mem::replace(&mut surface.status_line, "Cancelling...".to_string()),
        };
        Some(mark)
    }

    pub fn cancel_failed(&self, mark: CancelMark) {
        let mut screen = lock_screen(&self.screen);
        let Some(surface) = screen.surface_mut(self.marker) else {
            return;
        };
        if surface.is_final() {
            return;
        }
        if let Some(cancel) = surface.cancel.as_mut() {
            cancel.pending = false;
        }
        surface.status_line = mark.previous_line;
    }
}

fn apply(
    surface: &mut ProgressSurface,
    kind: OperationKind,
    config: &SurfaceConfig,
    update: &StatusUpdate,
) {
    if kind == OperationKind::Install {
        if let Some(api) = &update.origin {
            surface.title = format!("LuaTools · {}", api);
        }
    }

    let pending_cancel = surface.cancel.map(|c| c.pending).unwrap_or(false);
    if let Some(line) = status_line(kind, config, &update.state) {
        // Keep "Cancelling..." up until the backend confirms or the
        // operation finishes on its own.
        if !pending_cancel || update.state.is_terminal() {
            surface.status_line = line;
        }
    }

    match &update.state {
        LifecycleState::Downloading { progress, .. } => {
            surface.progress = ProgressBar {
                visible: true,
                fill: bar_fill(progress),
            };
        }
        LifecycleState::Done { .. } => {
            surface.progress.fill = Percent::Known(100);
            finish(surface, Tone::Success);
        }
        LifecycleState::Failed { .. } => {
            surface.progress.visible = false;
            finish(surface, Tone::Error);
        }
        LifecycleState::Cancelled { .. } => {
            surface.progress.visible = false;
            finish(surface, Tone::Neutral);
        }
        _ => {}
    }
}

fn finish(surface: &mut ProgressSurface, tone: Tone) {
    if let Some(cancel) = surface.cancel.as_mut() {
        cancel.visible = false;
        cancel.pending = false;
    }
    surface.dismiss = Dismiss::Close;
    surface.tone = tone;
}

/// Bytes moving without a known total show a sliver rather than an empty bar.
fn bar_fill(progress: &DownloadProgress) -> Percent {
    match progress.percent() {
        Percent::Known(pct) => Percent::Known(pct),
        Percent::Indeterminate if progress.has_activity() => Percent::Indeterminate,
        Percent::Indeterminate => Percent::Known(0),
    }
}

/// Human status line for a state. `None` keeps whatever is shown.
pub fn status_line(
    kind: OperationKind,
    config: &SurfaceConfig,
    state: &LifecycleState,
) -> Option<String> {
    let line = match state {
        LifecycleState::Idle => return None,
        LifecycleState::Checking => "Checking availability…".to_string(),
        LifecycleState::Downloading { progress, message } => match kind {
            OperationKind::Install => "Downloading…".to_string(),
            OperationKind::ApplyFix => match progress.percent() {
                Percent::Known(pct) => format!("Downloading: {}%", pct),
                Percent::Indeterminate => "Downloading...".to_string(),
            },
            _ => return message.clone(),
        },
        LifecycleState::Processing { message } => match kind {
            OperationKind::Install => "Processing package… Close accela after download".to_string(),
            OperationKind::ApplyFix => "Extracting to game folder...".to_string(),
            OperationKind::Unfix => message
                .clone()
                .unwrap_or_else(|| "Removing fix files...".to_string()),
            OperationKind::WorkshopDownload => {
                message.clone().unwrap_or_else(|| "Processing...".to_string())
            }
        },
        LifecycleState::Installing { .. } => "Installing…".to_string(),
        LifecycleState::Done { detail } => match kind {
            OperationKind::Install => "Game added!".to_string(),
            OperationKind::ApplyFix => format!(
                "{} applied successfully!",
                config.subject.as_deref().unwrap_or("Fix")
            ),
            OperationKind::Unfix => {
                let removed = match detail {
                    DoneDetail::FilesRemoved(n) => *n,
                    _ => 0,
                };
                format!("Removed {} files. Running Steam verification...", removed)
            }
            OperationKind::WorkshopDownload => match detail {
                DoneDetail::SavedTo(path) => format!("Download Completed! Saved to {}", path),
                _ => "Download Completed!".to_string(),
            },
        },
        LifecycleState::Failed { reason } => match reason {
            FailureReason::Backend(error) => format!("Failed: {}", error),
            FailureReason::Unspecified => "Failed: Unknown error".to_string(),
            FailureReason::LoginRequired => {
                "This Workshop item does not support anonymous downloading.".to_string()
            }
        },
        LifecycleState::Cancelled { reason } => format!(
            "Cancelled: {}",
            reason.as_deref().unwrap_or("Cancelled by user")
        ),
    };
    Some(line)
}
