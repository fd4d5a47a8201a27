//! Backend status poller
//!
//! One poller task follows one guarded operation. Each tick waits for the
//! configured delay, fetches the status, maps it and hands distinct updates
//! to the presentation callback. The next tick is only scheduled after the
//! previous fetch resolved, so fetches for a pair never overlap.

use crate::backend::BackendError;
use crate::guard::GuardLease;
use crate::status::{self, EntityId, LifecycleState, Mapped, OperationKind, RawStatus, StatusUpdate};
use log::{debug, info, warn};
use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The backend reported a terminal state.
    Finished(LifecycleState),
    /// `stop()` was called before a terminal state arrived.
    Detached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    pub entity: EntityId,
    pub kind: OperationKind,
    pub outcome: PollOutcome,
    pub ticks: u32,
    pub transient_errors: u32,
    pub updates: u32,
}

/// Stop switch that outlives the join handle.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    /// Stop scheduling ticks. Nothing is sent to the backend; the operation
    /// keeps running there, only this controller stops following it.
    pub fn stop(&self) {
        self.0.cancel();
    }
}

pub struct PollerHandle {
    id: Uuid,
    entity: EntityId,
    kind: OperationKind,
    token: CancellationToken,
    task: JoinHandle<PollReport>,
}

impl PollerHandle {
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.token.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> PollReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                warn!("Poller {} for {} ended abnormally: {:?}", self.id, self.entity, e);
                PollReport {
                    entity: self.entity,
                    kind: self.kind,
                    outcome: PollOutcome::Detached,
                    ticks: 0,
                    transient_errors: 0,
                    updates: 0,
                }
            }
        }
    }
}

/// Start following the operation owned by `lease`.
///
/// `fetch` is called once per tick; `on_update` once per distinct mapped
/// update, in fetch order. The lease is released when a terminal state is
/// observed or when the handle is stopped.
pub fn spawn_poller<F, Fut, U>(
    lease: GuardLease,
    interval: Duration,
    fetch: F,
    on_update: U,
) -> PollerHandle
where
    F: FnMut(EntityId) -> Fut + Send + 'static,
    Fut: Future<Output = Result<RawStatus, BackendError>> + Send + 'static,
    U: FnMut(&StatusUpdate) + Send + 'static,
{
    let id = Uuid::new_v4();
    let entity = lease.entity();
    let kind = lease.kind();
    let token = CancellationToken::new();
    let task_token = token.clone();

    info!("Polling {} status for {} every {:?}", kind, entity, interval);
    let task = tokio::spawn(async move {
        poll_until_terminal(lease, interval, task_token, fetch, on_update).await
    });

    PollerHandle {
        id,
        entity,
        kind,
        token,
        task,
    }
}

async fn poll_until_terminal<F, Fut, U>(
    lease: GuardLease,
    interval: Duration,
    token: CancellationToken,
    mut fetch: F,
    mut on_update: U,
) -> PollReport
where
    F: FnMut(EntityId) -> Fut,
    Fut: Future<Output = Result<RawStatus, BackendError>>,
    U: FnMut(&StatusUpdate),
{
    let entity = lease.entity();
    let kind = lease.kind();
    let mut report = PollReport {
        entity,
        kind,
        outcome: PollOutcome::Detached,
        ticks: 0,
        transient_errors: 0,
        updates: 0,
    };
    let mut last: Option<StatusUpdate> = None;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = sleep(interval) => {}
        }

        report.ticks += 1;
        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = fetch(entity) => result,
        };

        let raw = match fetched {
            Ok(raw) => raw,
            Err(e) => {
                // Transient: retried on the next tick, never shown.
                report.transient_errors += 1;
                warn!(
                    "Status fetch for {} {} failed on tick {}: {}",
                    kind, entity, report.ticks, e
                );
                continue;
            }
        };

        let update = match status::map(kind, &raw) {
            Mapped::State(update) => update,
            Mapped::Unrecognized(tag) => {
                debug!("Ignoring unrecognized {} status '{}' for {}", kind, tag, entity);
                continue;
            }
        };

        if last.as_ref() != Some(&update) {
            debug!("{} {} -> {}", kind, entity, update.state.name());
            on_update(&update);
            report.updates += 1;
        }

        if update.state.is_terminal() {
            lease.release();
            info!(
                "{} for {} finished as {} after {} ticks",
                kind,
                entity,
                update.state.name(),
                report.ticks
            );
            report.outcome = PollOutcome::Finished(update.state);
            return report;
        }

        last = Some(update);
    }

    info!("Stopped following {} for {} (backend not notified)", kind, entity);
    drop(lease);
    report
}
