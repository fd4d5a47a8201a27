//! Operation launchers and the controller facade
//!
//! Each launch takes the guard, issues one start call and, only when the
//! backend accepted it, opens a progress surface and spawns the poller that
//! owns the guard lease from then on.

use crate::backend::{BackendError, FixKind, OperationBackend, StartRequest};
use crate::config::FixUrls;
use crate::guard::OperationGuard;
use crate::poller::{spawn_poller, PollReport, PollerHandle, StopHandle};
use crate::presentation::{
    lock_screen, PresentationAdapter, SharedScreen, SurfaceConfig, SurfaceMarker,
};
use crate::status::{EntityId, OperationKind, StatusUpdate};
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaunchError {
    /// The backend declined to begin, or a precondition was missing.
    #[error("{0}")]
    StartFailed(String),
    #[error("No operation running for {0}")]
    NotRunning(EntityId),
    #[error("{0} cannot be cancelled")]
    NotCancellable(OperationKind),
    #[error("Cancellation failed: {0}")]
    CancelFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started,
    /// The guard was held; nothing was sent to the backend.
    AlreadyRunning,
}

/// One launched operation, running or finished but still on screen.
struct LiveOperation {
    adapter: PresentationAdapter,
    last: Arc<Mutex<Option<StatusUpdate>>>,
    cancel_pending: Arc<AtomicBool>,
    stop: StopHandle,
    poller: Option<PollerHandle>,
}

/// Snapshot of a launched operation for display.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSummary {
    pub marker: SurfaceMarker,
    pub last: Option<StatusUpdate>,
    pub running: bool,
    pub surface_open: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct OperationController {
    backend: Arc<dyn OperationBackend>,
    guard: OperationGuard,
    screen: SharedScreen,
    poll_override: Option<Duration>,
    fix_urls: FixUrls,
    operations: Arc<Mutex<HashMap<SurfaceMarker, LiveOperation>>>,
}

impl OperationController {
    pub fn new(
        backend: Arc<dyn OperationBackend>,
        guard: OperationGuard,
        screen: SharedScreen,
    ) -> Self {
        Self {
            backend,
            guard,
            screen,
            poll_override: None,
            fix_urls: FixUrls::default(),
            operations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Poll every kind at `interval` instead of its default cadence.
    pub fn with_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_override = interval;
        self
    }

    pub fn with_fix_urls(mut self, fix_urls: FixUrls) -> Self {
        self.fix_urls = fix_urls;
        self
    }

    #[cfg(test)]
    pub fn guard(&self) -> &OperationGuard {
        &self.guard
    }

    pub fn can_start(&self, entity: EntityId, kind: OperationKind) -> bool {
        self.guard.can_start(entity, kind)
    }

    // ============== Launchers ==============

    pub async fn install(&self, appid: EntityId) -> Result<LaunchOutcome, LaunchError> {
        self.launch(StartRequest::Install { appid }).await
    }

    /// Apply a fix archive. The game has to be installed: without an
    /// install path nothing is started and the guard is never taken.
    pub async fn apply_fix(
        &self,
        appid: EntityId,
        download_url: String,
        fix_type: String,
        game_name: String,
    ) -> Result<LaunchOutcome, LaunchError> {
        if !self.can_start(appid, OperationKind::ApplyFix) {
            return Ok(LaunchOutcome::AlreadyRunning);
        }
        let install_path = self
            .install_path(appid)
            .await?
            .ok_or_else(|| LaunchError::StartFailed("Game install path not found".to_string()))?;

        self.launch(StartRequest::ApplyFix {
            appid,
            download_url,
            install_path,
            fix_type,
            game_name,
        })
        .await
    }

    /// Ask the backend which fixes exist for `appid` and apply the preferred
    /// one. Nothing is started when the game has no fix.
    pub async fn apply_available_fix(
        &self,
        appid: EntityId,
        game_name: String,
    ) -> Result<LaunchOutcome, LaunchError> {
        if !self.can_start(appid, OperationKind::ApplyFix) {
            return Ok(LaunchOutcome::AlreadyRunning);
        }
        let fixes = self.backend.check_fixes(appid).await.map_err(|e| {
            warn!("Fix check for {} failed: {}", appid, e);
            LaunchError::StartFailed(start_failure_message(e))
        })?;
        let Some(fix) = fixes.preferred() else {
            info!("No fix available for {}", appid);
            return Err(LaunchError::StartFailed(
                "No fix available for this game".to_string(),
            ));
        };
        let download_url = match (fix, fixes.online_url) {
            (FixKind::Online, Some(url)) => url,
            _ => self.fix_urls.url(fix, appid),
        };
        debug!("Using {} for {} from {}", fix.label(), appid, download_url);
        self.apply_fix(
            appid,
            download_url,
            fix.label().to_string(),
            fixes.game_name.unwrap_or(game_name),
        )
        .await
    }

    /// Revert a fix. The backend falls back to its own lookup when the
    /// install path is unknown.
    pub async fn unfix(
        &self,
        appid: EntityId,
        fix_date: String,
    ) -> Result<LaunchOutcome, LaunchError> {
        if !self.can_start(appid, OperationKind::Unfix) {
            return Ok(LaunchOutcome::AlreadyRunning);
        }
        let install_path = self.install_path(appid).await?.unwrap_or_default();
        self.launch(StartRequest::Unfix {
            appid,
            install_path,
            fix_date,
        })
        .await
    }

    pub async fn download_workshop(
        &self,
        appid: EntityId,
        pubfile_id: u64,
    ) -> Result<LaunchOutcome, LaunchError> {
        self.launch(StartRequest::WorkshopDownload { appid, pubfile_id })
            .await
    }

    async fn install_path(&self, appid: EntityId) -> Result<Option<String>, LaunchError> {
        self.backend.install_path(appid).await.map_err(|e| {
            warn!("Could not look up install path for {}: {}", appid, e);
            LaunchError::StartFailed(format!("Error getting game path: {}", e))
        })
    }

    /// Start `request` unless its entity is already busy.
    pub async fn launch(&self, request: StartRequest) -> Result<LaunchOutcome, LaunchError> {
        let entity = request.entity();
        let kind = request.kind();

        let Some(lease) = self.guard.try_acquire(entity, kind) else {
            info!("Ignoring {} for {}: an operation is already in flight", kind, entity);
            return Ok(LaunchOutcome::AlreadyRunning);
        };

        info!("Starting {} for {}", kind, entity);
        if let Err(e) = self.backend.start(&request).await {
            drop(lease);
            error!("Backend refused to start {} for {}: {}", kind, entity, e);
            return Err(LaunchError::StartFailed(start_failure_message(e)));
        }

        let marker = SurfaceMarker::new(kind, entity);
        let adapter = PresentationAdapter::new(
            self.screen.clone(),
            marker,
            SurfaceConfig::for_request(&request),
        );
        // A finished surface from an earlier run of the same pair is replaced.
        adapter.hide();
        adapter.open(None);

        let last = Arc::new(Mutex::new(None));
        let cancel_pending = Arc::new(AtomicBool::new(false));
        let backend = self.backend.clone();
        let on_update = {
            let adapter = adapter.clone();
            let last = last.clone();
            let cancel_pending = cancel_pending.clone();
            move |update: &StatusUpdate| {
                *lock(&last) = Some(update.clone());
                if update.state.is_terminal() {
                    cancel_pending.store(false, Ordering::SeqCst);
                }
                adapter.on_update(update);
            }
        };
        let poller = spawn_poller(
            lease,
            self.poll_override
                .unwrap_or_else(|| kind.default_poll_interval()),
            move |entity| {
                let backend = backend.clone();
                async move { backend.fetch_status(kind, entity).await }
            },
            on_update,
        );

        let record = LiveOperation {
            adapter,
            last,
            cancel_pending,
            stop: poller.stop_handle(),
            poller: Some(poller),
        };
        if let Some(previous) = lock(&self.operations).insert(marker, record) {
            previous.stop.stop();
        }

        Ok(LaunchOutcome::Started)
    }

    // ============== Running operations ==============

    /// Oldest kind still in flight on `entity`.
    pub fn active_kind(&self, entity: EntityId) -> Option<OperationKind> {
        self.guard.held_kinds(entity).into_iter().next()
    }

    /// Ask the backend to cancel the oldest in-flight operation on `entity`.
    /// Polling continues until the backend reports the cancellation.
    pub async fn cancel(&self, entity: EntityId) -> Result<(), LaunchError> {
        let kind = self
            .active_kind(entity)
            .ok_or(LaunchError::NotRunning(entity))?;
        self.cancel_operation(entity, kind).await
    }

    pub async fn cancel_operation(
        &self,
        entity: EntityId,
        kind: OperationKind,
    ) -> Result<(), LaunchError> {
        if !kind.supports_cancel() {
            return Err(LaunchError::NotCancellable(kind));
        }

        let (adapter, pending) = {
            let operations = lock(&self.operations);
            match operations.get(&SurfaceMarker::new(kind, entity)) {
                Some(op) if self.guard.held_kinds(entity).contains(&kind) => {
                    (op.adapter.clone(), op.cancel_pending.clone())
                }
                _ => return Err(LaunchError::NotRunning(entity)),
            }
        };

        if pending.swap(true, Ordering::SeqCst) {
            info!("Cancellation of {} for {} already requested", kind, entity);
            return Ok(());
        }

        let mark = adapter.begin_cancel();
        info!("Requesting cancellation of {} for {}", kind, entity);
        match self.backend.cancel(kind, entity).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Cancel of {} for {} failed: {}", kind, entity, e);
                pending.store(false, Ordering::SeqCst);
                if let Some(mark) = mark {
                    adapter.cancel_failed(mark);
                }
                Err(LaunchError::CancelFailed(e.to_string()))
            }
        }
    }

    /// Stop following an operation without telling the backend. The guard
    /// entry goes with the poller.
    pub fn detach(&self, entity: EntityId, kind: OperationKind) -> bool {
        let marker = SurfaceMarker::new(kind, entity);
        let Some(op) = lock(&self.operations).remove(&marker) else {
            return false;
        };
        info!("Detaching from {} for {}", kind, entity);
        op.stop.stop();
        op.adapter.hide();
        true
    }

    /// Hide a running operation's surface, or close a finished one.
    pub fn hide(&self, entity: EntityId, kind: OperationKind) -> bool {
        let marker = SurfaceMarker::new(kind, entity);
        let mut operations = lock(&self.operations);
        let Some(op) = operations.get(&marker) else {
            return false;
        };
        let hidden = op.adapter.hide();
        let finished = op.poller.as_ref().map_or(true, PollerHandle::is_finished)
            && !self.guard.held_kinds(entity).contains(&kind);
        if finished {
            operations.remove(&marker);
        }
        hidden
    }

    /// Bring back the surface of a launched operation from its last update.
    pub fn reopen(&self, entity: EntityId, kind: OperationKind) -> bool {
        let marker = SurfaceMarker::new(kind, entity);
        let operations = lock(&self.operations);
        let Some(op) = operations.get(&marker) else {
            return false;
        };
        let last = lock(&op.last).clone();
        let opened = op.adapter.open(last.as_ref());
        if op.cancel_pending.load(Ordering::SeqCst) {
            // The request is still out; the fresh surface has to say so.
            op.adapter.begin_cancel();
        }
        opened
    }

    pub fn last_update(&self, entity: EntityId, kind: OperationKind) -> Option<StatusUpdate> {
        let operations = lock(&self.operations);
        let op = operations.get(&SurfaceMarker::new(kind, entity))?;
        let last = lock(&op.last).clone();
        last
    }

    pub fn operations(&self) -> Vec<OperationSummary> {
        let operations = lock(&self.operations);
        let screen = lock_screen(&self.screen);
        let mut summaries: Vec<OperationSummary> = operations
            .iter()
            .map(|(marker, op)| OperationSummary {
                marker: *marker,
                last: lock(&op.last).clone(),
                running: op.poller.as_ref().map_or(false, |p| !p.is_finished()),
                surface_open: screen.surface(*marker).is_some(),
            })
            .collect();
        summaries.sort_by_key(|summary| summary.marker);
        summaries
    }

    /// Wait for an operation's poller to end. Only the first caller gets
    /// the report.
    #[cfg(test)]
    pub async fn wait(&self, entity: EntityId, kind: OperationKind) -> Option<PollReport> {
        let handle = lock(&self.operations)
            .get_mut(&SurfaceMarker::new(kind, entity))?
            .poller
            .take()?;
        Some(handle.join().await)
    }

    /// Detach from everything and wait for the pollers to wind down.
    pub async fn shutdown(&self) -> Vec<PollReport> {
        let handles: Vec<PollerHandle> = {
            let mut operations = lock(&self.operations);
            operations
                .drain()
                .filter_map(|(_, mut op)| {
                    op.stop.stop();
                    op.poller.take()
                })
                .collect()
        };
        info!("Shutting down {} poller(s)", handles.len());
        join_all(handles.into_iter().map(PollerHandle::join)).await
    }
}

fn start_failure_message(error: BackendError) -> String {
    match error {
        BackendError::Rejected(message) => message,
        other => format!("LuaTools backend unavailable: {}", other),
    }
}
