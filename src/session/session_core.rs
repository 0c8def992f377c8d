use super::{SessionConfig, SrState};

/// Mutable session state owned by one controller's driver task.
///
/// The message router and heartbeat monitor operate on this directly; the
/// driver applies the side effects they return.
#[derive(Debug, Clone)]
pub struct SessionCore {
    pub config: SessionConfig,
    pub state: SrState,
    /// Timestamp of the newest delivered message; never decreases
    pub delivered_cursor: i64,
    /// Heartbeats sent since the last `HEARTBEAT` reply
    pub pending_heartbeats: u32,
    /// Set once a graceful disconnect has been requested
    pub disconnecting: bool,
}

impl SessionCore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SrState::new(),
            delivered_cursor: 0,
            pending_heartbeats: 0,
            disconnecting: false,
        }
    }

    /// Moves the cursor forward; older timestamps are ignored.
    pub fn advance_cursor(&mut self, timestamp: i64) {
        if timestamp > self.delivered_cursor {
            self.delivered_cursor = timestamp;
        }
    }

    /// True while a handshake is still in flight and heartbeats should be frequent.
    pub fn handshake_pending(&self) -> bool {
        self.config.private_session_pending() || (self.config.session_started && !self.state.ready)
    }

    /// Marks this client absent and stale ahead of a reconnect.
    pub fn mark_self_absent(&mut self) {
        if let Some(index) = self.state.member_index {
            if let Some(present) = self.state.member_presence.get_mut(index) {
                *present = false;
            }
        }
        self.state.ready = false;
    }
}
