//! Message router: applies incoming frames to a [`SessionCore`].
//!
//! Dispatch is synchronous and side-effect free apart from the core itself;
//! anything that touches the outside world (persisting, notifying observers,
//! tearing down, reconnecting) comes back as an [`Effect`] for the controller
//! to carry out in order.

use crate::protocol::{parse_batch, IncomingFrame};
use crate::session::{DisconnectReason, SessionCore, SrMessage, Stage};
use tracing::{debug, info, warn};


/// How a teardown should treat the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    pub reason: DisconnectReason,
    /// Mark the stage `ConnectionClosed`
    pub close_stage: bool,
    /// Delete the persisted resumption record
    pub clear_config: bool,
}

impl Teardown {
    /// Session is over for good: closed and forgotten
    pub fn terminal(reason: DisconnectReason) -> Self {
        Self {
            reason,
            close_stage: true,
            clear_config: true,
        }
    }

    /// Connection is gone but the session may be resumed
    pub fn resumable(reason: DisconnectReason) -> Self {
        Self {
            reason,
            close_stage: false,
            clear_config: false,
        }
    }
}

/// Side effect requested by the router, applied by the controller in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Observable state changed; publish a snapshot
    StateChanged,
    /// Resumable identity changed; write it to the store
    Persist,
    /// Hand a message to the application
    Deliver(SrMessage),
    Teardown(Teardown),
    Reconnect,
}

impl Effect {
    /// Effects after which the rest of the batch must not be applied
    fn ends_connection(&self) -> bool {
        matches!(self, Effect::Teardown(_) | Effect::Reconnect)
    }
}

/// Parses and dispatches one transport receive event.
///
/// Batch-level parse failures are logged and yield no effects.
pub fn dispatch_batch(core: &mut SessionCore, text: &str) -> Vec<Effect> {
    let frames = match parse_batch(text) {
        Ok(frames) => frames,
        Err(e) => {
            warn!(local_id = %core.config.local_id, error = %format!("{:#}", e), "Dropping frame batch");
            return Vec::new();
        }
    };

    let mut effects = Vec::new();
    for frame in frames {
        let frame_effects = dispatch(core, frame);
        let stop = frame_effects.iter().any(Effect::ends_connection);
        effects.extend(frame_effects);
        if stop {
            break;
        }
    }
    effects
}

/// Applies a single frame.
pub fn dispatch(core: &mut SessionCore, frame: IncomingFrame) -> Vec<Effect> {
    if core.config.trying_to_end_session && !frame.is_lifecycle() {
        debug!(tag = frame.tag(), "Ignoring frame while ending session");
        return Vec::new();
    }

    match frame {
        IncomingFrame::Connection { member_id } => {
            debug!(local_id = %core.config.local_id, member_id = %member_id, "Member id assigned");
            core.config.member_id = Some(member_id);
            vec![Effect::Persist]
        }
        IncomingFrame::ConnectionOverwrite => {
            info!(local_id = %core.config.local_id, "Connection overwritten by another client");
            vec![Effect::Teardown(Teardown {
                reason: DisconnectReason::ConnectionOverwritten,
                close_stage: true,
                clear_config: false,
            })]
        }
        IncomingFrame::Heartbeat => {
            core.pending_heartbeats = 0;
            if core.state.stable {
                Vec::new()
            } else {
                core.state.stable = true;
                vec![Effect::StateChanged]
            }
        }
        IncomingFrame::InvalidConnection => {
            warn!(local_id = %core.config.local_id, "Server rejected connection, reconnecting");
            vec![Effect::Reconnect]
        }
        IncomingFrame::MemberDisconnect { member_num } => set_presence(core, member_num, false),
        IncomingFrame::MemberReconnect { member_num } => set_presence(core, member_num, true),
        IncomingFrame::Message {
            member_num,
            payload,
            pinned,
            time,
        } => {
            core.advance_cursor(time);
            let message = SrMessage {
                member_index: member_num,
                payload,
                pinned,
                timestamp: time,
            };
            if pinned {
                core.state.pinned_message = Some(message.clone());
                vec![Effect::Deliver(message), Effect::StateChanged]
            } else {
                vec![Effect::Deliver(message)]
            }
        }
        IncomingFrame::PrivateSessionPending { session_id } => {
            if core.state.ready {
                return Vec::new();
            }
            core.config.session_id = Some(session_id.clone());
            core.state.password = Some(session_id);
            vec![Effect::Persist, Effect::StateChanged]
        }
        IncomingFrame::SessionConnect {
            member_num,
            session_id,
            session_type,
            member_presence,
            pinned_message,
        } => {
            if core.state.ready {
                return Vec::new();
            }
            let num_members = member_presence
                .map(|presence| presence.len())
                .filter(|len| *len > 0)
                .unwrap_or(core.config.num_members);

            core.config.num_members = num_members;
            if session_id.is_some() {
                core.config.session_id = session_id;
            }
            if let Some(session_type) = session_type {
                core.config.session_type = session_type;
            }
            core.config.session_started = true;

            core.state.member_index = Some(member_num);
            core.state.is_host = member_num == 0;
            core.state.member_presence = vec![true; num_members];
            if let Some(pinned) = pinned_message {
                core.advance_cursor(pinned.time);
                core.state.pinned_message = Some(pinned.into());
            }
            core.state.stage = Stage::SessionInProgress;
            core.state.ready = true;
            core.state.password = None;

            info!(
                local_id = %core.config.local_id,
                member_index = member_num,
                num_members,
                "Session connected"
            );
            vec![Effect::Persist, Effect::StateChanged]
        }
        IncomingFrame::SessionEnd => {
            info!(local_id = %core.config.local_id, "Session ended by server");
            vec![Effect::Teardown(Teardown::terminal(DisconnectReason::SessionEnded))]
        }
    }
}

fn set_presence(core: &mut SessionCore, member_num: usize, present: bool) -> Vec<Effect> {
    match core.state.member_presence.get_mut(member_num) {
        Some(slot) if *slot == present => Vec::new(),
        Some(slot) => {
            *slot = present;
            vec![Effect::StateChanged]
        }
        None => {
            warn!(
                member_num,
                members = core.state.member_presence.len(),
                "Presence update for unknown member"
            );
            Vec::new()
        }
    }
}
