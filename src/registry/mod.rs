use crate::error::SessionError;
use crate::notifier::DisconnectNotifier;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;


/// Disconnect notifier still waiting for the server's acknowledgment
struct PendingNotifier {
    member_id: String,
}

/// Shared bookkeeping for every controller composed by one client.
///
/// Enforces one live controller per local id and owns the disconnect
/// notifiers, which must keep running after their controller is gone.
pub struct SessionRegistry {
    /// local_id -> owning controller instance
    live: DashMap<String, Uuid>,
    /// local_id -> notifier in flight
    pending: DashMap<String, PendingNotifier>,
    /// Signalled whenever a pending notifier is removed
    notifier_cleared: Notify,
    /// Parent of every notifier's cancellation token
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            live: DashMap::new(),
            pending: DashMap::new(),
            notifier_cleared: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Claims `local_id` for controller `owner`.
    ///
    /// Fails if the id is empty or already held by a live controller.
    pub fn claim(&self, local_id: &str, owner: Uuid) -> Result<(), SessionError> {
        if local_id.is_empty() {
            return Err(SessionError::InvalidArgument(
                "local id must not be empty".to_string(),
            ));
        }

        match self.live.entry(local_id.to_string()) {
            Entry::Occupied(_) => Err(SessionError::IdentityConflict(local_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(owner);
                Ok(())
            }
        }
    }

    /// Releases `local_id` if it is still held by `owner`.
    pub fn release(&self, local_id: &str, owner: Uuid) -> bool {
        let released = self
            .live
            .remove_if(local_id, |_, holder| *holder == owner)
            .is_some();
        if released {
            debug!(local_id = %local_id, "Released local id");
        }
        released
    }

    pub fn is_live(&self, local_id: &str) -> bool {
        self.live.contains_key(local_id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn has_pending_notifier(&self, local_id: &str) -> bool {
        self.pending.contains_key(local_id)
    }

    pub fn pending_notifier_count(&self) -> usize {
        self.pending.len()
    }

    /// Starts a disconnect notifier for `local_id` unless one is already running.
    ///
    /// The notifier runs independently of any controller and stops on
    /// acknowledgment or [`shutdown`](Self::shutdown).
    pub fn start_notifier(self: &Arc<Self>, local_id: &str, notifier: DisconnectNotifier) -> bool {
        match self.pending.entry(local_id.to_string()) {
            Entry::Occupied(existing) => {
                debug!(
                    local_id = %local_id,
                    member_id = %existing.get().member_id,
                    "Disconnect notifier already pending"
                );
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingNotifier {
                    member_id: notifier.member_id().to_string(),
                });
            }
        }

        info!(local_id = %local_id, member_id = %notifier.member_id(), "Starting disconnect notifier");

        let registry = Arc::clone(self);
        let cancel = self.shutdown.child_token();
        let local_id = local_id.to_string();
        tokio::spawn(async move {
            let acknowledged = notifier.run(&cancel).await;
            registry.pending.remove(&local_id);
            registry.notifier_cleared.notify_waiters();
            debug!(local_id = %local_id, acknowledged, "Disconnect notifier finished");
        });

        true
    }

    /// Waits until no notifier is pending for `local_id`.
    ///
    /// Returns false if `cancel` fires first. `poll` bounds how long a missed
    /// wake-up can delay the check.
    pub async fn wait_for_notifier(
        &self,
        local_id: &str,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            let cleared = self.notifier_cleared.notified();
            tokio::pin!(cleared);
            cleared.as_mut().enable();

            if !self.has_pending_notifier(local_id) {
                return true;
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut cleared => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Cancels every running notifier. Used at process shutdown.
    pub fn shutdown(&self) {
        info!(pending = self.pending.len(), "Shutting down session registry");
        self.shutdown.cancel();
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
