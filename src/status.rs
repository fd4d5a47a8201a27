//! Operation kinds, lifecycle states and backend status mapping
//!
//! Every backend operation reports progress in its own small vocabulary. This
//! module holds the typed payload for each kind and folds it onto the generic
//! lifecycle that the poller and the presentation layer work with.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Target of an operation (a numeric game id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Install,
    ApplyFix,
    Unfix,
    WorkshopDownload,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Install,
        OperationKind::ApplyFix,
        OperationKind::Unfix,
        OperationKind::WorkshopDownload,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::ApplyFix => "apply-fix",
            OperationKind::Unfix => "un-fix",
            OperationKind::WorkshopDownload => "workshop-download",
        }
    }

    /// Install polls faster because its popup shows a live byte counter.
    pub fn default_poll_interval(&self) -> Duration {
        match self {
            OperationKind::Install => Duration::from_millis(300),
            _ => Duration::from_millis(500),
        }
    }

    pub fn supports_cancel(&self) -> bool {
        !matches!(self, OperationKind::Unfix)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Download progress as the backend reports it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DownloadProgress {
    /// Byte counters; a zero total means the size is not known yet.
    Bytes { read: u64, total: u64 },
    /// Percentage computed by the backend; negative means indeterminate.
    Reported(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Percent {
    Known(u8),
    Indeterminate,
}

impl DownloadProgress {
    pub fn percent(&self) -> Percent {
        match *self {
            DownloadProgress::Bytes { read, total } if total > 0 => {
                let pct = (u128::from(read) * 100) / u128::from(total);
                Percent::Known(pct.min(100) as u8)
            }
            DownloadProgress::Bytes { .. } => Percent::Indeterminate,
            DownloadProgress::Reported(pct) if pct.is_finite() && pct >= 0.0 => {
                Percent::Known(pct.floor().min(100.0) as u8)
            }
            DownloadProgress::Reported(_) => Percent::Indeterminate,
        }
    }

    /// True when bytes are moving even though no percentage can be shown.
    pub fn has_activity(&self) -> bool {
        match *self {
            DownloadProgress::Bytes { read, .. } => read > 0,
            DownloadProgress::Reported(pct) => pct > 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Backend(String),
    /// The workshop item refuses anonymous downloads.
    LoginRequired,
    Unspecified,
}

impl FailureReason {
    fn from_message(message: Option<&str>) -> Self {
        match non_empty(message) {
            Some(msg) => FailureReason::Backend(msg),
            None => FailureReason::Unspecified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoneDetail {
    None,
    FilesRemoved(u64),
    SavedTo(String),
}

/// Generic lifecycle every operation kind is mapped onto.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleState {
    Idle,
    Checking,
    Downloading {
        progress: DownloadProgress,
        message: Option<String>,
    },
    Processing {
        message: Option<String>,
    },
    Installing {
        message: Option<String>,
    },
    Done {
        detail: DoneDetail,
    },
    Failed {
        reason: FailureReason,
    },
    Cancelled {
        reason: Option<String>,
    },
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Done { .. }
                | LifecycleState::Failed { .. }
                | LifecycleState::Cancelled { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Checking => "checking",
            LifecycleState::Downloading { .. } => "downloading",
            LifecycleState::Processing { .. } => "processing",
            LifecycleState::Installing { .. } => "installing",
            LifecycleState::Done { .. } => "done",
            LifecycleState::Failed { .. } => "failed",
            LifecycleState::Cancelled { .. } => "cancelled",
        }
    }
}

/// One mapped observation handed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub state: LifecycleState,
    /// Where the backend is fetching from (Install's `currentApi`).
    pub origin: Option<String>,
}

impl StatusUpdate {
    pub fn new(state: LifecycleState) -> Self {
        Self {
            state,
            origin: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mapped {
    State(StatusUpdate),
    /// Tag the controller does not know; keep polling without touching the UI.
    Unrecognized(String),
}

// ============== Backend payloads ==============

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub current_api: Option<String>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub bytes_read: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_bytes: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixState {
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_count")]
    pub bytes_read: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_bytes: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnfixState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub files_removed: u64,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkshopState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub download_path: Option<String>,
}

/// Status payload tagged with the kind it was fetched for.
#[derive(Debug, Clone)]
pub enum RawStatus {
    Install(InstallState),
    ApplyFix(FixState),
    Unfix(UnfixState),
    WorkshopDownload(WorkshopState),
}

impl RawStatus {
    pub fn kind(&self) -> OperationKind {
        match self {
            RawStatus::Install(_) => OperationKind::Install,
            RawStatus::ApplyFix(_) => OperationKind::ApplyFix,
            RawStatus::Unfix(_) => OperationKind::Unfix,
            RawStatus::WorkshopDownload(_) => OperationKind::WorkshopDownload,
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            RawStatus::Install(s) => &s.status,
            RawStatus::ApplyFix(s) => &s.status,
            RawStatus::Unfix(s) => &s.status,
            RawStatus::WorkshopDownload(s) => &s.status,
        }
    }
}

/// Python backends emit counters as ints, floats or null.
fn lenient_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
        .unwrap_or(0))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// ============== Status vocabularies ==============

macro_rules! status_tags {
    ($name:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        enum $name {
            $($variant),+
        }

        impl FromStr for $name {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($tag => Ok($name::$variant),)+
                    _ => Err(()),
                }
            }
        }
    };
}

status_tags!(InstallTag {
    Checking => "checking",
    Downloading => "downloading",
    Processing => "processing",
    Installing => "installing",
    Done => "done",
    Failed => "failed",
    Cancelled => "cancelled",
});

status_tags!(FixTag {
    Downloading => "downloading",
    Extracting => "extracting",
    Done => "done",
    Failed => "failed",
    Cancelled => "cancelled",
});

status_tags!(UnfixTag {
    Removing => "removing",
    Done => "done",
    Failed => "failed",
});

status_tags!(WorkshopTag {
    Downloading => "downloading",
    Done => "done",
    Failed => "failed",
    Cancelled => "cancelled",
});

const LOGIN_REQUIRED: &str = "LOGIN_REQUIRED";

/// Map a backend payload for `kind` onto the generic lifecycle.
///
/// A payload that belongs to another kind, or carries a tag outside the
/// kind's vocabulary, comes back as [`Mapped::Unrecognized`].
pub fn map(kind: OperationKind, raw: &RawStatus) -> Mapped {
    if raw.kind() != kind {
        return Mapped::Unrecognized(format!("{}:{}", raw.kind(), raw.tag()));
    }

    match raw {
        RawStatus::Install(state) => map_install(state),
        RawStatus::ApplyFix(state) => map_fix(state),
        RawStatus::Unfix(state) => map_unfix(state),
        RawStatus::WorkshopDownload(state) => map_workshop(state),
    }
}

fn map_install(state: &InstallState) -> Mapped {
    let Ok(tag) = state.status.parse::<InstallTag>() else {
        return Mapped::Unrecognized(state.status.clone());
    };

    let lifecycle = match tag {
        InstallTag::Checking => LifecycleState::Checking,
        InstallTag::Downloading => LifecycleState::Downloading {
            progress: DownloadProgress::Bytes {
                read: state.bytes_read,
                total: state.total_bytes,
            },
            message: None,
        },
        InstallTag::Processing => LifecycleState::Processing { message: None },
        InstallTag::Installing => LifecycleState::Installing { message: None },
        InstallTag::Done => LifecycleState::Done {
            detail: DoneDetail::None,
        },
        InstallTag::Failed => LifecycleState::Failed {
            reason: FailureReason::from_message(state.error.as_deref()),
        },
        InstallTag::Cancelled => LifecycleState::Cancelled {
            reason: non_empty(state.error.as_deref()),
        },
    };

    Mapped::State(StatusUpdate {
        state: lifecycle,
        origin: non_empty(state.current_api.as_deref()),
    })
}

fn map_fix(state: &FixState) -> Mapped {
    let Ok(tag) = state.status.parse::<FixTag>() else {
        return Mapped::Unrecognized(state.status.clone());
    };

    let lifecycle = match tag {
        FixTag::Downloading => LifecycleState::Downloading {
            progress: DownloadProgress::Bytes {
                read: state.bytes_read,
                total: state.total_bytes,
            },
            message: None,
        },
        FixTag::Extracting => LifecycleState::Processing { message: None },
        FixTag::Done => LifecycleState::Done {
            detail: DoneDetail::None,
        },
        FixTag::Failed => LifecycleState::Failed {
            reason: FailureReason::from_message(state.error.as_deref()),
        },
        FixTag::Cancelled => LifecycleState::Cancelled {
            reason: non_empty(state.error.as_deref()),
        },
    };

    Mapped::State(StatusUpdate::new(lifecycle))
}

fn map_unfix(state: &UnfixState) -> Mapped {
    let Ok(tag) = state.status.parse::<UnfixTag>() else {
        return Mapped::Unrecognized(state.status.clone());
    };

    let lifecycle = match tag {
        UnfixTag::Removing => LifecycleState::Processing {
            message: non_empty(state.progress.as_deref()),
        },
        // "done" with an explicit success=false is how the backend reports
        // a removal that gave up halfway.
        UnfixTag::Done if state.success == Some(false) => LifecycleState::Failed {
            reason: FailureReason::from_message(state.error.as_deref()),
        },
        UnfixTag::Done => LifecycleState::Done {
            detail: DoneDetail::FilesRemoved(state.files_removed),
        },
        UnfixTag::Failed => LifecycleState::Failed {
            reason: FailureReason::from_message(state.error.as_deref()),
        },
    };

    Mapped::State(StatusUpdate::new(lifecycle))
}

fn map_workshop(state: &WorkshopState) -> Mapped {
    let Ok(tag) = state.status.parse::<WorkshopTag>() else {
        return Mapped::Unrecognized(state.status.clone());
    };

    let message = non_empty(state.message.as_deref()).filter(|m| m != LOGIN_REQUIRED);

    let lifecycle = match tag {
        WorkshopTag::Downloading => LifecycleState::Downloading {
            progress: DownloadProgress::Reported(state.progress.unwrap_or(-1.0)),
            message,
        },
        WorkshopTag::Done => LifecycleState::Done {
            detail: match non_empty(state.download_path.as_deref()) {
                Some(path) => DoneDetail::SavedTo(path),
                None => DoneDetail::None,
            },
        },
        WorkshopTag::Failed => {
            let login_required = state.message.as_deref() == Some(LOGIN_REQUIRED)
                || state
                    .error
                    .as_deref()
                    .map(|e| e.to_ascii_lowercase().contains("access denied"))
                    .unwrap_or(false);
            let reason = if login_required {
                FailureReason::LoginRequired
            } else {
                FailureReason::from_message(message.as_deref().or(state.error.as_deref()))
            };
            LifecycleState::Failed { reason }
        }
        WorkshopTag::Cancelled => LifecycleState::Cancelled { reason: None },
    };

    Mapped::State(StatusUpdate::new(lifecycle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn install(value: serde_json::Value) -> RawStatus {
        RawStatus::Install(serde_json::from_value(value).unwrap())
    }

    fn state_of(mapped: Mapped) -> LifecycleState {
        match mapped {
            Mapped::State(update) => update.state,
            Mapped::Unrecognized(tag) => panic!("unexpected unrecognized tag {tag}"),
        }
    }

    #[test]
    fn byte_progress_is_a_floored_percentage() {
        let progress = DownloadProgress::Bytes {
            read: 50,
            total: 200,
        };
        assert_eq!(progress.percent(), Percent::Known(25));

        let progress = DownloadProgress::Bytes {
            read: 199,
            total: 200,
        };
        assert_eq!(progress.percent(), Percent::Known(99));
    }

    #[test]
    fn unknown_total_is_indeterminate_not_zero() {
        let progress = DownloadProgress::Bytes { read: 5, total: 0 };
        assert_eq!(progress.percent(), Percent::Indeterminate);
        assert!(progress.has_activity());

        let idle = DownloadProgress::Bytes { read: 0, total: 0 };
        assert_eq!(idle.percent(), Percent::Indeterminate);
        assert!(!idle.has_activity());
    }

    #[test]
    fn percentages_are_clamped() {
        let over = DownloadProgress::Bytes {
            read: 900,
            total: 200,
        };
        assert_eq!(over.percent(), Percent::Known(100));
        assert_eq!(
            DownloadProgress::Reported(140.5).percent(),
            Percent::Known(100)
        );
        assert_eq!(
            DownloadProgress::Reported(-1.0).percent(),
            Percent::Indeterminate
        );
        assert_eq!(
            DownloadProgress::Reported(f64::NAN).percent(),
            Percent::Indeterminate
        );
    }

    #[test]
    fn install_vocabulary_maps_onto_lifecycle() {
        let mapped = map(
            OperationKind::Install,
            &install(json!({
                "status": "downloading",
                "currentApi": "Ryuu",
                "bytesRead": 50,
                "totalBytes": 200
            })),
        );
        let Mapped::State(update) = mapped else {
            panic!("downloading must be recognised");
        };
        assert_eq!(update.origin.as_deref(), Some("Ryuu"));
        assert_eq!(
            update.state,
            LifecycleState::Downloading {
                progress: DownloadProgress::Bytes {
                    read: 50,
                    total: 200
                },
                message: None,
            }
        );

        for (tag, name) in [
            ("checking", "checking"),
            ("processing", "processing"),
            ("installing", "installing"),
            ("done", "done"),
            ("failed", "failed"),
            ("cancelled", "cancelled"),
        ] {
            let state = state_of(map(
                OperationKind::Install,
                &install(json!({ "status": tag })),
            ));
            assert_eq!(state.name(), name);
        }
    }

    #[test]
    fn unknown_tags_are_flagged_not_failed() {
        let mapped = map(
            OperationKind::Install,
            &install(json!({ "status": "queued" })),
        );
        assert_eq!(mapped, Mapped::Unrecognized("queued".to_string()));

        let mapped = map(
            OperationKind::Install,
            &install(json!({ "totalBytes": 10 })),
        );
        assert_eq!(mapped, Mapped::Unrecognized(String::new()));
    }

    #[test]
    fn payload_for_another_kind_is_unrecognized() {
        let raw = RawStatus::ApplyFix(FixState {
            status: "done".to_string(),
            ..FixState::default()
        });
        assert!(matches!(
            map(OperationKind::Install, &raw),
            Mapped::Unrecognized(_)
        ));
    }

    #[test]
    fn counters_tolerate_floats_and_nulls() {
        let state: InstallState = serde_json::from_value(json!({
            "status": "downloading",
            "bytesRead": 1024.0,
            "totalBytes": null
        }))
        .unwrap();
        assert_eq!(state.bytes_read, 1024);
        assert_eq!(state.total_bytes, 0);
    }

    #[test]
    fn fix_extracting_is_processing_and_failure_keeps_reason() {
        let raw = RawStatus::ApplyFix(FixState {
            status: "extracting".to_string(),
            ..FixState::default()
        });
        assert_eq!(
            state_of(map(OperationKind::ApplyFix, &raw)),
            LifecycleState::Processing { message: None }
        );

        let raw = RawStatus::ApplyFix(FixState {
            status: "failed".to_string(),
            error: Some("  ".to_string()),
            ..FixState::default()
        });
        assert_eq!(
            state_of(map(OperationKind::ApplyFix, &raw)),
            LifecycleState::Failed {
                reason: FailureReason::Unspecified
            }
        );
    }

    #[test]
    fn unfix_done_without_success_is_a_failure() {
        let raw = RawStatus::Unfix(UnfixState {
            status: "done".to_string(),
            success: Some(false),
            error: Some("permission denied".to_string()),
            ..UnfixState::default()
        });
        assert_eq!(
            state_of(map(OperationKind::Unfix, &raw)),
            LifecycleState::Failed {
                reason: FailureReason::Backend("permission denied".to_string())
            }
        );

        let raw = RawStatus::Unfix(UnfixState {
            status: "done".to_string(),
            success: Some(true),
            files_removed: 12,
            ..UnfixState::default()
        });
        assert_eq!(
            state_of(map(OperationKind::Unfix, &raw)),
            LifecycleState::Done {
                detail: DoneDetail::FilesRemoved(12)
            }
        );
    }

    #[test]
    fn unfix_removing_carries_backend_progress_line() {
        let raw = RawStatus::Unfix(UnfixState {
            status: "removing".to_string(),
            progress: Some("Removing 3/9".to_string()),
            ..UnfixState::default()
        });
        assert_eq!(
            state_of(map(OperationKind::Unfix, &raw)),
            LifecycleState::Processing {
                message: Some("Removing 3/9".to_string())
            }
        );
    }

    #[test]
    fn workshop_login_restriction_is_its_own_reason() {
        let raw = RawStatus::WorkshopDownload(WorkshopState {
            status: "failed".to_string(),
            message: Some("LOGIN_REQUIRED".to_string()),
            ..WorkshopState::default()
        });
        assert_eq!(
            state_of(map(OperationKind::WorkshopDownload, &raw)),
            LifecycleState::Failed {
                reason: FailureReason::LoginRequired
            }
        );

        let raw = RawStatus::WorkshopDownload(WorkshopState {
            status: "failed".to_string(),
            message: Some("Error: timeout".to_string()),
            ..WorkshopState::default()
        });
        assert_eq!(
            state_of(map(OperationKind::WorkshopDownload, &raw)),
            LifecycleState::Failed {
                reason: FailureReason::Backend("Error: timeout".to_string())
            }
        );
    }

    #[test]
    fn workshop_progress_uses_reported_percentage() {
        let raw = RawStatus::WorkshopDownload(WorkshopState {
            status: "downloading".to_string(),
            progress: Some(-1.0),
            message: Some("Connecting".to_string()),
            ..WorkshopState::default()
        });
        let LifecycleState::Downloading { progress, message } =
            state_of(map(OperationKind::WorkshopDownload, &raw))
        else {
            panic!("expected downloading");
        };
        assert_eq!(progress.percent(), Percent::Indeterminate);
        assert_eq!(message.as_deref(), Some("Connecting"));
    }
}
