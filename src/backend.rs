//! Typed LuaTools backend client
//!
//! Wraps the raw server-method transport with the per-kind start, status
//! and cancel calls the controller needs.

use crate::backend_api::{BackendApiClient, BackendApiError};
use crate::status::{
    EntityId, FixState, InstallState, OperationKind, RawStatus, UnfixState, WorkshopState,
};
use async_trait::async_trait;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Api(#[from] BackendApiError),
    /// The backend answered `success: false`.
    #[error("{0}")]
    Rejected(String),
    #[error("{0} response carried no state")]
    MissingState(&'static str),
    #[error("Unexpected {method} payload: {source}")]
    Payload {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} cannot be cancelled")]
    Unsupported(OperationKind),
}

const UNKNOWN_ERROR: &str = "Unknown error";

/// Everything needed to start one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartRequest {
    Install {
        appid: EntityId,
    },
    ApplyFix {
        appid: EntityId,
        download_url: String,
        install_path: String,
        fix_type: String,
        game_name: String,
    },
    Unfix {
        appid: EntityId,
        install_path: String,
        fix_date: String,
    },
    WorkshopDownload {
        appid: EntityId,
        pubfile_id: u64,
    },
}

impl StartRequest {
    pub fn entity(&self) -> EntityId {
        match self {
            StartRequest::Install { appid }
            | StartRequest::ApplyFix { appid, .. }
            | StartRequest::Unfix { appid, .. }
            | StartRequest::WorkshopDownload { appid, .. } => *appid,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            StartRequest::Install { .. } => OperationKind::Install,
            StartRequest::ApplyFix { .. } => OperationKind::ApplyFix,
            StartRequest::Unfix { .. } => OperationKind::Unfix,
            StartRequest::WorkshopDownload { .. } => OperationKind::WorkshopDownload,
        }
    }

    fn args(&self) -> Value {
        match self {
            StartRequest::Install { appid } => json!({ "appid": appid }),
            StartRequest::ApplyFix {
                appid,
                download_url,
                install_path,
                fix_type,
                game_name,
            } => json!({
                "appid": appid,
                "downloadUrl": download_url,
                "installPath": install_path,
                "fixType": fix_type,
                "gameName": game_name,
            }),
            StartRequest::Unfix {
                appid,
                install_path,
                fix_date,
            } => json!({
                "appid": appid,
                "installPath": install_path,
                "fixDate": fix_date,
            }),
            StartRequest::WorkshopDownload { appid, pubfile_id } => json!({
                "appid": appid,
                "pubfile_id": pubfile_id,
            }),
        }
    }
}

/// The two fix archives the backend can offer for a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixKind {
    Generic,
    Online,
}

impl FixKind {
    /// Name sent as `fixType` and shown on the progress surface.
    pub fn label(self) -> &'static str {
        match self {
            FixKind::Generic => "Generic Fix",
            FixKind::Online => "Online Fix",
        }
    }
}

/// Result of `CheckForFixes` for one app.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixAvailability {
    pub game_name: Option<String>,
    pub generic: bool,
    pub online: bool,
    /// Archive location the backend suggests for the online fix.
    pub online_url: Option<String>,
}

impl FixAvailability {
    /// The fix to apply when the user does not pick one: online, then generic.
    pub fn preferred(&self) -> Option<FixKind> {
        if self.online {
            Some(FixKind::Online)
        } else if self.generic {
            Some(FixKind::Generic)
        } else {
            None
        }
    }
}

/// Server method names for one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindMethods {
    pub start: &'static str,
    pub status: &'static str,
    pub cancel: Option<&'static str>,
}

pub fn methods(kind: OperationKind) -> KindMethods {
    match kind {
        OperationKind::Install => KindMethods {
            start: "StartAddViaLuaTools",
            status: "GetAddViaLuaToolsStatus",
            cancel: Some("CancelAddViaLuaTools"),
        },
        OperationKind::ApplyFix => KindMethods {
            start: "ApplyGameFix",
            status: "GetApplyFixStatus",
            cancel: Some("CancelApplyFix"),
        },
        OperationKind::Unfix => KindMethods {
            start: "UnFixGame",
            status: "GetUnfixStatus",
            cancel: None,
        },
        OperationKind::WorkshopDownload => KindMethods {
            start: "StartWorkshopDownloadParams",
            status: "GetWorkshopDownloadStatus",
            cancel: Some("CancelWorkshopDownload"),
        },
    }
}

#[async_trait]
pub trait OperationBackend: Send + Sync {
    async fn start(&self, request: &StartRequest) -> Result<(), BackendError>;

    async fn fetch_status(
        &self,
        kind: OperationKind,
        entity: EntityId,
    ) -> Result<RawStatus, BackendError>;

    async fn cancel(&self, kind: OperationKind, entity: EntityId) -> Result<(), BackendError>;

    /// Install directory of the game, if the backend can find it.
    async fn install_path(&self, entity: EntityId) -> Result<Option<String>, BackendError>;

    /// Whether the backend already has LuaTools content for the app.
    async fn has_luatools(&self, entity: EntityId) -> Result<bool, BackendError>;

    /// Which fix archives exist for the app.
    async fn check_fixes(&self, entity: EntityId) -> Result<FixAvailability, BackendError>;
}

#[derive(Debug, Deserialize)]
struct Ack {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    state: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallPathReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    install_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PresenceReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    exists: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FixStatus {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    available: bool,
    #[serde(default)]
    url: Option<String>,
}

impl FixStatus {
    fn available(&self) -> bool {
        self.available || self.status == Some(200)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixCheckReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    game_name: Option<String>,
    #[serde(default)]
    generic_fix: FixStatus,
    #[serde(default)]
    online_fix: FixStatus,
}

fn fix_availability(value: Value) -> Result<FixAvailability, BackendError> {
    let reply: FixCheckReply = parse("CheckForFixes", value)?;
    if !reply.success {
        return Err(rejection(reply.error));
    }
    Ok(FixAvailability {
        game_name: reply.game_name.filter(|name| !name.trim().is_empty()),
        generic: reply.generic_fix.available(),
        online: reply.online_fix.available(),
        online_url: reply.online_fix.url.filter(|url| !url.trim().is_empty()),
    })
}

fn parse<T: DeserializeOwned>(method: &'static str, value: Value) -> Result<T, BackendError> {
    serde_json::from_value(value).map_err(|source| BackendError::Payload { method, source })
}

fn rejection(error: Option<String>) -> BackendError {
    BackendError::Rejected(
        error
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
    )
}

fn ack(method: &'static str, value: Value) -> Result<(), BackendError> {
    let ack: Ack = parse(method, value)?;
    if ack.success {
        Ok(())
    } else {
        Err(rejection(ack.error))
    }
}

fn unwrap_envelope<T: DeserializeOwned>(
    method: &'static str,
    value: Value,
) -> Result<T, BackendError> {
    let envelope: Envelope<T> = parse(method, value)?;
    if !envelope.success {
        return Err(rejection(envelope.error));
    }
    envelope.state.ok_or(BackendError::MissingState(method))
}

/// Decode a status reply for `kind` into its typed payload.
pub fn decode_status(kind: OperationKind, value: Value) -> Result<RawStatus, BackendError> {
    let method = methods(kind).status;
    Ok(match kind {
        OperationKind::Install => RawStatus::Install(unwrap_envelope::<InstallState>(method, value)?),
        OperationKind::ApplyFix => RawStatus::ApplyFix(unwrap_envelope::<FixState>(method, value)?),
        OperationKind::Unfix => RawStatus::Unfix(unwrap_envelope::<UnfixState>(method, value)?),
        OperationKind::WorkshopDownload => {
            RawStatus::WorkshopDownload(parse::<WorkshopState>(method, value)?)
        }
    })
}

/// Backend client speaking to the LuaTools plugin.
pub struct PluginClient {
    api: BackendApiClient,
}

impl PluginClient {
    pub fn new(api: BackendApiClient) -> Self {
        Self { api }
    }

    /// The workshop backend tracks a single download, so its status and
    /// cancel calls take no arguments.
    fn entity_args(kind: OperationKind, entity: EntityId) -> Value {
        match kind {
            OperationKind::WorkshopDownload => json!({}),
            _ => json!({ "appid": entity }),
        }
    }
}

#[async_trait]
impl OperationBackend for PluginClient {
    async fn start(&self, request: &StartRequest) -> Result<(), BackendError> {
        let method = methods(request.kind()).start;
        debug!("Calling {} for {}", method, request.entity());
        let reply = self.api.call(method, request.args()).await?;
        ack(method, reply)
    }

    async fn fetch_status(
        &self,
        kind: OperationKind,
        entity: EntityId,
    ) -> Result<RawStatus, BackendError> {
        let method = methods(kind).status;
        let reply = self.api.call(method, Self::entity_args(kind, entity)).await?;
        decode_status(kind, reply)
    }

    async fn cancel(&self, kind: OperationKind, entity: EntityId) -> Result<(), BackendError> {
        let method = methods(kind)
            .cancel
            .ok_or(BackendError::Unsupported(kind))?;
        debug!("Calling {} for {}", method, entity);
        let reply = self.api.call(method, Self::entity_args(kind, entity)).await?;
        ack(method, reply)
    }

    async fn install_path(&self, entity: EntityId) -> Result<Option<String>, BackendError> {
        const METHOD: &str = "GetGameInstallPath";
        let reply = self.api.call(METHOD, json!({ "appid": entity })).await?;
        let reply: InstallPathReply = parse(METHOD, reply)?;
        if !reply.success {
            warn!("Backend could not resolve the install path of {}", entity);
            return Ok(None);
        }
        Ok(reply.install_path.filter(|path| !path.trim().is_empty()))
    }

    async fn has_luatools(&self, entity: EntityId) -> Result<bool, BackendError> {
        const METHOD: &str = "HasLuaToolsForApp";
        let reply = self.api.call(METHOD, json!({ "appid": entity })).await?;
        let reply: PresenceReply = parse(METHOD, reply)?;
        Ok(reply.success && reply.exists)
    }

    async fn check_fixes(&self, entity: EntityId) -> Result<FixAvailability, BackendError> {
        let reply = self.api.call("CheckForFixes", json!({ "appid": entity })).await?;
        fix_availability(reply)
    }
}


#[cfg(test)]
pub mod fake {
    //! In-memory backend replaying scripted status sequences.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Key = (OperationKind, EntityId);

    #[derive(Default)]
    pub struct ScriptedBackend {
        scripts: Mutex<HashMap<Key, VecDeque<Result<RawStatus, BackendError>>>>,
        last: Mutex<HashMap<Key, RawStatus>>,
        start_error: Mutex<Option<String>>,
        cancel_error: Mutex<Option<String>>,
        start_delay: Mutex<Option<Duration>>,
        present: Mutex<HashMap<EntityId, bool>>,
        install_paths: Mutex<HashMap<EntityId, String>>,
        fixes: Mutex<HashMap<EntityId, FixAvailability>>,
        cancel_delay: Mutex<Option<Duration>>,
        starts: Mutex<Vec<StartRequest>>,
        cancels: Mutex<Vec<Key>>,
        fetches: AtomicU32,
        presence_checks: AtomicU32,
    }

    impl ScriptedBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue status replies for a pair. Once the queue runs dry the last
        /// successful reply repeats.
        pub fn script(
            &self,
            kind: OperationKind,
            entity: EntityId,
            replies: Vec<Result<RawStatus, BackendError>>,
        ) {
            self.scripts
                .lock()
                .unwrap()
                .entry((kind, entity))
                .or_default()
                .extend(replies);
        }

        pub fn fail_start(&self, error: &str) {
            *self.start_error.lock().unwrap() = Some(error.to_string());
        }

        pub fn fail_cancel(&self, error: Option<&str>) {
            *self.cancel_error.lock().unwrap() = error.map(str::to_string);
        }

        pub fn delay_start(&self, delay: Duration) {
            *self.start_delay.lock().unwrap() = Some(delay);
        }

        pub fn delay_cancel(&self, delay: Duration) {
            *self.cancel_delay.lock().unwrap() = Some(delay);
        }

        pub fn set_fixes(&self, entity: EntityId, fixes: FixAvailability) {
            self.fixes.lock().unwrap().insert(entity, fixes);
        }

        pub fn set_present(&self, entity: EntityId, present: bool) {
            self.present.lock().unwrap().insert(entity, present);
        }

        pub fn set_install_path(&self, entity: EntityId, path: &str) {
            self.install_paths
                .lock()
                .unwrap()
                .insert(entity, path.to_string());
        }

        pub fn starts(&self) -> Vec<StartRequest> {
            self.starts.lock().unwrap().clone()
        }

        pub fn cancels(&self) -> Vec<Key> {
            self.cancels.lock().unwrap().clone()
        }

        pub fn fetches(&self) -> u32 {
            self.fetches.load(Ordering::SeqCst)
        }

        pub fn presence_checks(&self) -> u32 {
            self.presence_checks.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OperationBackend for ScriptedBackend {
        async fn start(&self, request: &StartRequest) -> Result<(), BackendError> {
            self.starts.lock().unwrap().push(request.clone());
            let delay = *self.start_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match self.start_error.lock().unwrap().clone() {
                Some(error) => Err(BackendError::Rejected(error)),
                None => Ok(()),
            }
        }

        async fn fetch_status(
            &self,
            kind: OperationKind,
            entity: EntityId,
        ) -> Result<RawStatus, BackendError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let next = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&(kind, entity))
                .and_then(VecDeque::pop_front);
            match next {
                Some(Ok(raw)) => {
                    self.last.lock().unwrap().insert((kind, entity), raw.clone());
                    Ok(raw)
                }
                Some(Err(e)) => Err(e),
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .get(&(kind, entity))
                    .cloned()
                    .ok_or_else(|| BackendError::Rejected("no status scripted".to_string())),
            }
        }

        async fn cancel(&self, kind: OperationKind, entity: EntityId) -> Result<(), BackendError> {
            if !kind.supports_cancel() {
                return Err(BackendError::Unsupported(kind));
            }
            self.cancels.lock().unwrap().push((kind, entity));
            let delay = *self.cancel_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match self.cancel_error.lock().unwrap().clone() {
                Some(error) => Err(BackendError::Rejected(error)),
                None => Ok(()),
            }
        }

        async fn install_path(&self, entity: EntityId) -> Result<Option<String>, BackendError> {
            Ok(self.install_paths.lock().unwrap().get(&entity).cloned())
        }

        async fn has_luatools(&self, entity: EntityId) -> Result<bool, BackendError> {
            self.presence_checks.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .present
                .lock()
                .unwrap()
                .get(&entity)
                .copied()
                .unwrap_or(false))
        }

        async fn check_fixes(&self, entity: EntityId) -> Result<FixAvailability, BackendError> {
            Ok(self
                .fixes
                .lock()
                .unwrap()
                .get(&entity)
                .cloned()
                .unwrap_or_default())
        }
    }

    pub fn install(status: &str, read: u64, total: u64) -> Result<RawStatus, BackendError> {
        Ok(RawStatus::Install(InstallState {
            status: status.to_string(),
            bytes_read: read,
            total_bytes: total,
            ..InstallState::default()
        }))
    }

    pub fn fix(status: &str, read: u64, total: u64) -> Result<RawStatus, BackendError> {
        Ok(RawStatus::ApplyFix(FixState {
            status: status.to_string(),
            bytes_read: read,
            total_bytes: total,
            error: None,
        }))
    }

    pub fn workshop(status: &str, progress: f64, message: &str) -> Result<RawStatus, BackendError> {
        Ok(RawStatus::WorkshopDownload(WorkshopState {
            status: status.to_string(),
            progress: Some(progress),
            message: Some(message.to_string()),
            ..WorkshopState::default()
        }))
    }

    pub fn unreachable_backend() -> Result<RawStatus, BackendError> {
        Err(BackendError::Rejected("backend unreachable".to_string()))
    }
}
