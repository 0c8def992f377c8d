// Session data model: resumable identity, observable state, app messages

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

mod session_core;

pub use session_core::SessionCore;

/// Resumable identity of one membership.
///
/// Persisted as JSON (one record per `local_id`) so an application restart can
/// rejoin the same member slot. Fields filled in by the server (`member_id`,
/// `session_id`) stay `None` until acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Caller-chosen identifier, unique among live sessions on this client
    pub local_id: String,
    /// Matchmaking bucket (e.g. "duel")
    pub session_type: String,
    /// Target member count; 0 lets the server decide
    #[serde(default)]
    pub num_members: usize,
    #[serde(default)]
    pub is_private: bool,
    /// Session identifier; doubles as the join password for private sessions
    #[serde(default)]
    pub session_id: Option<String>,
    /// Member identifier assigned by the server
    #[serde(default)]
    pub member_id: Option<String>,
    #[serde(default)]
    pub session_started: bool,
    #[serde(default)]
    pub trying_to_end_session: bool,
    /// Set once the record describes a complete join request. Records
    /// without it are never resumed.
    #[serde(default)]
    pub initialized: bool,
}

impl SessionConfig {
    /// Public matchmaking request
    pub fn random(local_id: &str, session_type: &str, num_members: usize) -> Self {
        Self {
            local_id: local_id.to_string(),
            session_type: session_type.to_string(),
            num_members,
            is_private: false,
            session_id: None,
            member_id: None,
            session_started: false,
            trying_to_end_session: false,
            initialized: true,
        }
    }

    /// Request for a new private session hosted by this client
    pub fn host_private(local_id: &str, session_type: &str, num_members: usize) -> Self {
        Self {
            is_private: true,
            ..Self::random(local_id, session_type, num_members)
        }
    }

    /// Request to join an existing session by its id (password)
    pub fn join_private(local_id: &str, session_type: &str, session_id: &str) -> Self {
        Self {
            is_private: true,
            session_id: Some(session_id.to_string()),
            ..Self::random(local_id, session_type, 0)
        }
    }

    /// True while a hosted private session is waiting for its server-assigned id.
    pub fn private_session_pending(&self) -> bool {
        self.is_private && self.session_id.is_none()
    }
}

/// Session stage as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    WaitingForMoreMembers,
    SessionInProgress,
    ConnectionClosed,
}

/// Transport-level connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Why the controller last reached `ConnectionStatus::Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// First probe or every open attempt of a fresh join failed
    InitialConnectionFailed,
    /// A previously working connection could not be re-established
    ConnectionDied,
    DisconnectRequested,
    /// Another connection took over this member slot
    ConnectionOverwritten,
    SessionEnded,
    Paused,
}

impl DisconnectReason {
    /// Reasons after which a non-forced `reconnect` is allowed
    pub fn allows_reconnect(self) -> bool {
        matches!(
            self,
            DisconnectReason::ConnectionDied | DisconnectReason::InitialConnectionFailed
        )
    }
}

/// Application message relayed through the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrMessage {
    /// Sender's member index
    pub member_index: usize,
    pub payload: String,
    pub pinned: bool,
    /// Server timestamp, milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl SrMessage {
    /// Server timestamp as a UTC date-time, if representable
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }
}

/// Observable in-memory session state. Never persisted.
///
/// `member_presence` is only meaningful once `ready` is true; while not ready
/// the state may be stale even if the status is `Connected`.
#[derive(Debug, Clone, PartialEq)]
pub struct SrState {
    pub stage: Stage,
    pub status: ConnectionStatus,
    /// Only meaningful while `Connected`
    pub stable: bool,
    pub ready: bool,
    pub disconnect_reason: Option<DisconnectReason>,
    /// Assigned member index, `None` until the session connects
    pub member_index: Option<usize>,
    pub member_presence: Vec<bool>,
    pub pinned_message: Option<SrMessage>,
    pub is_host: bool,
    /// Session id to share with other members while a private session fills up
    pub password: Option<String>,
}

impl SrState {
    pub fn new() -> Self {
        Self {
            stage: Stage::WaitingForMoreMembers,
            status: ConnectionStatus::Connecting,
            stable: false,
            ready: false,
            disconnect_reason: None,
            member_index: None,
            member_presence: Vec::new(),
            pinned_message: None,
            is_host: false,
            password: None,
        }
    }

    /// Number of members currently marked present
    pub fn present_count(&self) -> usize {
        self.member_presence.iter().filter(|p| **p).count()
    }
}

impl Default for SrState {
    fn default() -> Self {
        Self::new()
    }
}

/// Event delivered to the embedding application, in mutation order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SrState),
    Message(SrMessage),
    /// Every open attempt failed while a member id was known; the id was dropped
    /// and the join restarted from scratch.
    IdentityReset { stale_member_id: String },
}
