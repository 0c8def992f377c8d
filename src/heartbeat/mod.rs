//! Heartbeat monitor: liveness and stability tracking for a connected session.

pub mod ticker;

use crate::config::HeartbeatConfig;
use crate::protocol::{OutgoingFrame, WaitingFor};
use crate::session::{ConnectionStatus, SessionCore};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use ticker::{channel_ticker, ChannelTicker, IntervalTicker, TickSender, Ticker};

#[cfg(test)]
mod tests;

/// Unacknowledged heartbeats after which the connection is reported unstable
pub const HEARTBEAT_COUNT_UNTIL_UNSTABLE: u32 = 2;

/// Unacknowledged heartbeats after which the connection is abandoned
pub const HEARTBEAT_COUNT_UNTIL_RECONNECT: u32 = 5;

/// What the controller should do after a tick
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatAction {
    Idle,
    Send {
        frame: OutgoingFrame,
        /// Stability was just lost; observers must be told
        became_unstable: bool,
        /// Too many heartbeats outstanding; drop the connection after sending
        reconnect: bool,
    },
}

pub struct HeartbeatMonitor {
    stable_interval: Duration,
    unstable_interval: Duration,
    last_sent: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            stable_interval: config.stable_interval(),
            unstable_interval: config.unstable_interval(),
            last_sent: None,
        }
    }

    /// Forgets the last send time so the next tick on a fresh connection sends at once.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }

    /// Current heartbeat period for `core`
    pub fn interval(&self, core: &SessionCore) -> Duration {
        if core.handshake_pending() || core.pending_heartbeats > 0 {
            self.unstable_interval
        } else {
            self.stable_interval
        }
    }

    /// Handshake frames the server still owes us. Empty once ready.
    pub fn waiting_for(core: &SessionCore) -> Vec<WaitingFor> {
        if core.state.ready {
            return Vec::new();
        }

        let mut waiting = Vec::with_capacity(3);
        if core.config.member_id.is_none() {
            waiting.push(WaitingFor::Connection);
        }
        if core.config.private_session_pending() {
            waiting.push(WaitingFor::PrivateSessionPending);
        }
        waiting.push(WaitingFor::SessionConnect);
        waiting
    }

    /// Builds the frame for the next heartbeat without touching any counters.
    pub fn frame(core: &SessionCore) -> OutgoingFrame {
        if core.config.trying_to_end_session {
            OutgoingFrame::EndSession
        } else {
            OutgoingFrame::Heartbeat {
                incl_messages_after: core.delivered_cursor,
                waiting_for: Self::waiting_for(core),
            }
        }
    }

    /// Advances the monitor to `now`.
    ///
    /// Only acts while `Connected`. The heartbeat that brings the outstanding
    /// count to [`HEARTBEAT_COUNT_UNTIL_RECONNECT`] is still sent, then the
    /// connection is given up.
    pub fn on_tick(&mut self, now: Instant, core: &mut SessionCore) -> HeartbeatAction {
        if core.state.status != ConnectionStatus::Connected {
            return HeartbeatAction::Idle;
        }

        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.interval(core) {
                return HeartbeatAction::Idle;
            }
        }

        let frame = Self::frame(core);
        core.pending_heartbeats += 1;
        self.last_sent = Some(now);

        let became_unstable =
            core.pending_heartbeats >= HEARTBEAT_COUNT_UNTIL_UNSTABLE && core.state.stable;
        if became_unstable {
            core.state.stable = false;
            debug!(
                local_id = %core.config.local_id,
                outstanding = core.pending_heartbeats,
                "Connection unstable"
            );
        }

        let reconnect = core.pending_heartbeats >= HEARTBEAT_COUNT_UNTIL_RECONNECT;
        if reconnect {
            warn!(
                local_id = %core.config.local_id,
                outstanding = core.pending_heartbeats,
                "Heartbeats unanswered, reconnecting"
            );
        }

        HeartbeatAction::Send {
            frame,
            became_unstable,
            reconnect,
        }
    }
}
