//! Out-of-band "member left" notification.
//!
//! The socket may already be dead when a session is torn down, so the server
//! is told over HTTP instead: `GET {http_url}/notifyDisconnect/{memberId}` on a
//! fixed period until it answers 200.

use crate::protocol::notify_disconnect_url;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone)]
pub struct DisconnectNotifier {
    http_client: reqwest::Client,
    member_id: String,
    url: String,
    period: Duration,
    timeout: Duration,
}

impl DisconnectNotifier {
    pub fn new(
        http_client: reqwest::Client,
        http_url: &str,
        member_id: &str,
        period: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            member_id: member_id.to_string(),
            url: notify_disconnect_url(http_url, member_id),
            period,
            timeout,
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    async fn notify_once(&self) -> bool {
        match self
            .http_client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                debug!(member_id = %self.member_id, status = %response.status(), "Disconnect notification rejected");
                false
            }
            Err(e) => {
                debug!(member_id = %self.member_id, error = %e, "Disconnect notification failed");
                false
            }
        }
    }

    /// Retries until acknowledged. Returns false if cancelled first.
    pub async fn run(&self, cancel: &CancellationToken) -> bool {
        let mut ticker = interval(self.period);
        let mut attempts: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(member_id = %self.member_id, attempts, "Disconnect notifier cancelled");
                    return false;
                }
                _ = ticker.tick() => {}
            }

            attempts += 1;
            let acknowledged = tokio::select! {
                _ = cancel.cancelled() => return false,
                ok = self.notify_once() => ok,
            };

            if acknowledged {
                info!(member_id = %self.member_id, attempts, "Server acknowledged disconnect");
                return true;
            }
        }
    }
}
