use crate::session::SrMessage;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Tags the relay server may send. Anything else is dropped.
pub const KNOWN_TAGS: [&str; 10] = [
    "CONNECTION",
    "CONNECTION_OVERWRITE",
    "HEARTBEAT",
    "INVALID_CONNECTION",
    "MEMBER_DISCONNECT",
    "MEMBER_RECONNECT",
    "MESSAGE",
    "PRIVATE_SESSION_PENDING",
    "SESSION_CONNECT",
    "SESSION_END",
];

/// Message as embedded in frames (`MESSAGE` body, `pinnedMessage`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub member_num: usize,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub pinned: bool,
    pub time: i64,
}

impl From<WireMessage> for SrMessage {
    fn from(msg: WireMessage) -> Self {
        Self {
            member_index: msg.member_num,
            payload: msg.payload,
            pinned: msg.pinned,
            timestamp: msg.time,
        }
    }
}

/// Server → Client frame, tagged by `type`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingFrame {
    Connection {
        #[serde(rename = "memberId")]
        member_id: String,
    },
    ConnectionOverwrite,
    Heartbeat,
    InvalidConnection,
    MemberDisconnect {
        #[serde(rename = "memberNum")]
        member_num: usize,
    },
    MemberReconnect {
        #[serde(rename = "memberNum")]
        member_num: usize,
    },
    Message {
        #[serde(rename = "memberNum")]
        member_num: usize,
        #[serde(default)]
        payload: String,
        #[serde(default)]
        pinned: bool,
        time: i64,
    },
    PrivateSessionPending {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    SessionConnect {
        #[serde(rename = "memberNum")]
        member_num: usize,
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
        #[serde(rename = "sessionType", default)]
        session_type: Option<String>,
        #[serde(rename = "memberPresence", default)]
        member_presence: Option<Vec<bool>>,
        #[serde(rename = "pinnedMessage", default)]
        pinned_message: Option<WireMessage>,
    },
    SessionEnd,
}

impl IncomingFrame {
    /// Wire tag of this frame
    pub fn tag(&self) -> &'static str {
        match self {
            IncomingFrame::Connection { .. } => "CONNECTION",
            IncomingFrame::ConnectionOverwrite => "CONNECTION_OVERWRITE",
            IncomingFrame::Heartbeat => "HEARTBEAT",
            IncomingFrame::InvalidConnection => "INVALID_CONNECTION",
            IncomingFrame::MemberDisconnect { .. } => "MEMBER_DISCONNECT",
            IncomingFrame::MemberReconnect { .. } => "MEMBER_RECONNECT",
            IncomingFrame::Message { .. } => "MESSAGE",
            IncomingFrame::PrivateSessionPending { .. } => "PRIVATE_SESSION_PENDING",
            IncomingFrame::SessionConnect { .. } => "SESSION_CONNECT",
            IncomingFrame::SessionEnd => "SESSION_END",
        }
    }

    /// Lifecycle frames are handled even while the session is being ended.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            IncomingFrame::ConnectionOverwrite
                | IncomingFrame::InvalidConnection
                | IncomingFrame::SessionEnd
        )
    }
}

/// Handshake frames still expected, reported in heartbeats while not ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitingFor {
    Connection,
    PrivateSessionPending,
    SessionConnect,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Client → Server frame, tagged by `action`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutgoingFrame {
    SendMessage {
        payload: String,
        // Some relay deployments reject default-valued fields
        #[serde(skip_serializing_if = "is_false")]
        pinned: bool,
    },
    Heartbeat {
        #[serde(rename = "inclMessagesAfter")]
        incl_messages_after: i64,
        #[serde(rename = "waitingFor", skip_serializing_if = "Vec::is_empty")]
        waiting_for: Vec<WaitingFor>,
    },
    EndSession,
}

impl OutgoingFrame {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize outgoing frame")
    }
}

/// Parses one transport receive event (a JSON array of frames).
///
/// Invalid JSON, a non-array payload, and an empty array fail the whole batch.
/// Individual frames with an unknown tag or missing fields are logged and
/// skipped so the rest of the batch is still delivered.
pub fn parse_batch(text: &str) -> Result<Vec<IncomingFrame>> {
    let raw: Vec<Value> =
        serde_json::from_str(text).context("Batch is not a JSON array of frames")?;

    if raw.is_empty() {
        bail!("Received empty frame batch");
    }

    let mut frames = Vec::with_capacity(raw.len());
    for value in raw {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if !KNOWN_TAGS.contains(&tag.as_str()) {
            warn!(tag = %tag, "Dropping frame with unrecognized type");
            continue;
        }

        match serde_json::from_value::<IncomingFrame>(value) {
            Ok(frame) => frames.push(frame),
            Err(e) => warn!(tag = %tag, error = %e, "Dropping malformed frame"),
        }
    }

    Ok(frames)
}
