//! Data model for cached entities and queued offline writes.
//!
//! Everything here is persisted as JSON through the
//! [`LocalStore`](crate::local_store::LocalStore), so field names are part of
//! the on-device format.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Payload field holding the event a registration or check-in targets.
pub const EVENT_ID_FIELD: &str = "eventId";

const LOCAL_ID_PREFIX: &str = "temp_";
const LOCAL_ID_SUFFIX_LEN: usize = 9;

/// Client-generated placeholder id, `temp_<unix millis>_<random>`.
///
/// Generation and validation live here only; call sites treat the value as
/// opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    pub fn generate() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(LOCAL_ID_SUFFIX_LEN)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        LocalId(format!(
            "{LOCAL_ID_PREFIX}{}_{suffix}",
            Utc::now().timestamp_millis()
        ))
    }

    /// Accepts any string of the form `temp_<digits>_<alphanumerics>`.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(LOCAL_ID_PREFIX)?;
        let (millis, suffix) = rest.split_once('_')?;
        let valid = !millis.is_empty()
            && millis.bytes().all(|b| b.is_ascii_digit())
            && !suffix.is_empty()
            && suffix.bytes().all(|b| b.is_ascii_alphanumeric());
        valid.then(|| LocalId(raw.to_string()))
    }

    pub fn is_temporary(raw: &str) -> bool {
        Self::parse(raw).is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LocalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    CreateEvent,
    Register,
    CheckIn,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateEvent => "create-event",
            ActionKind::Register => "register",
            ActionKind::CheckIn => "check-in",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create-event" => Some(ActionKind::CreateEvent),
            "register" => Some(ActionKind::Register),
            "check-in" => Some(ActionKind::CheckIn),
            _ => None,
        }
    }

    /// Payload field that may point at an offline-created event.
    pub fn dependency_field(&self) -> Option<&'static str> {
        match self {
            ActionKind::CreateEvent => None,
            ActionKind::Register | ActionKind::CheckIn => Some(EVENT_ID_FIELD),
        }
    }
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a queued action: `pending -> syncing -> synced | failed`,
/// with `failed -> pending` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    Pending,
    Syncing,
    Failed,
    Synced,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Syncing => "syncing",
            ActionStatus::Failed => "failed",
            ActionStatus::Synced => "synced",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ActionStatus::Pending),
            "syncing" => Some(ActionStatus::Syncing),
            "failed" => Some(ActionStatus::Failed),
            "synced" => Some(ActionStatus::Synced),
            _ => None,
        }
    }

    /// Forward-only transitions. A pending action may fail without being
    /// replayed (unresolvable dependency); `synced` is terminal.
    pub fn can_transition_to(self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing) | (Pending, Failed) | (Syncing, Synced) | (Syncing, Failed) | (Failed, Pending)
        )
    }
}

impl Display for ActionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the last replay of an action did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "kebab-case")]
pub enum FailureReason {
    NetworkUnavailable {
        message: String,
    },
    ServerRejected {
        status: Option<u16>,
        message: String,
    },
    UnresolvedDependency {
        depends_on: LocalId,
    },
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::NetworkUnavailable { message } => {
                write!(f, "network unavailable: {message}")
            }
            FailureReason::ServerRejected {
                status: Some(status),
                message,
            } => write!(f, "rejected by server ({status}): {message}"),
            FailureReason::ServerRejected {
                status: None,
                message,
            } => write!(f, "rejected by server: {message}"),
            FailureReason::UnresolvedDependency { depends_on } => {
                write!(f, "event {depends_on} was never synced")
            }
        }
    }
}

/// A write made while disconnected, waiting for server confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub local_id: LocalId,
    pub kind: ActionKind,
    pub payload: JsonValue,
    /// Offline-created event this action needs a server id for.
    pub depends_on: Option<LocalId>,
    pub created_at: DateTime<Utc>,
    /// Enqueue order; breaks `created_at` ties.
    pub sequence: u64,
    pub attempts: u32,
    pub status: ActionStatus,
    pub last_error: Option<FailureReason>,
}

impl PendingAction {
    /// Replay order: oldest first.
    pub fn replay_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }
}

/// Last-known-good copy of a server record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity {
    pub entity_type: String,
    pub id: String,
    pub payload: JsonValue,
    pub cached_at: DateTime<Utc>,
}

/// Server id assigned to an offline-created entity. Written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityIdMapping {
    pub local_id: LocalId,
    pub server_id: String,
    pub mapped_at: DateTime<Utc>,
}

/// A queue change that stayed in memory because the store was full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageWarning {
    pub key: String,
    pub message: String,
}

/// Reads `payload[field]` as a temporary id, if it is one.
pub fn referenced_local_id(payload: &JsonValue, field: &str) -> Option<LocalId> {
    payload
        .get(field)
        .and_then(JsonValue::as_str)
        .and_then(LocalId::parse)
}

/// Replaces `payload[field]` with `server_id`. Non-object payloads are left alone.
pub fn substitute_id(payload: &mut JsonValue, field: &str, server_id: &str) {
    if let Some(object) = payload.as_object_mut() {
        object.insert(field.to_string(), JsonValue::String(server_id.to_string()));
    }
}
