//! Connectivity probing before each connection attempt.
//!
//! A timed `GET {http_url}/ping`. Network errors, timeouts and non-200
//! statuses are all "not reachable"; none of them is surfaced as a failure.

use crate::protocol::ping_url;
use reqwest::StatusCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
pub struct ConnectivityProber {
    http_client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl ConnectivityProber {
    pub fn new(http_client: reqwest::Client, http_url: &str, timeout: Duration) -> Self {
        Self {
            http_client,
            url: ping_url(http_url),
            timeout,
        }
    }

    /// Single probe. True only for HTTP 200.
    pub async fn probe(&self) -> bool {
        match self
            .http_client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                debug!(url = %self.url, status = %response.status(), "Ping rejected");
                false
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Ping failed");
                false
            }
        }
    }

    /// Probes every `interval` until the server answers.
    ///
    /// Returns false only if `cancel` fires first.
    pub async fn wait_until_reachable(&self, interval: Duration, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                reachable = self.probe() => {
                    if reachable {
                        return true;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
