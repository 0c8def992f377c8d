//! Transport session seam.
//!
//! A transport is single-use: one `connect`, one `receive_loop`, one
//! `dispose`. The controller asks its [`TransportFactory`] for a fresh one on
//! every connection attempt.

pub mod websocket;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use websocket::{WebSocketTransport, WebSocketTransportFactory};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the connection, failing if it is not up within `timeout`.
    async fn connect(&self, timeout: Duration) -> Result<()>;

    /// Queues one text frame for sending. Returns immediately.
    fn send(&self, text: String) -> Result<()>;

    /// Drops every frame queued but not yet written.
    fn clear_send_queue(&self);

    /// Feeds each received text frame to `on_message` until the connection
    /// closes or the transport is disposed.
    async fn receive_loop(&self, on_message: &(dyn Fn(String) + Send + Sync));

    /// Closes the connection and releases its resources. Idempotent.
    async fn dispose(&self);

    fn is_connected(&self) -> bool;
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, url: &str) -> Arc<dyn Transport>;
}
