//! Relay session client - joins and maintains membership in a relayed
//! multiplayer session.
//!
//! # Architecture
//!
//! ```text
//! SessionHandle ──commands──▶ driver task (owns SessionCore)
//!                                 │
//!          ┌──────────────────────┼──────────────────────┐
//!          ▼                      ▼                      ▼
//!   ConnectivityProber     Transport (WebSocket)   HeartbeatMonitor
//!     GET /ping                   │                  (Ticker)
//!                                 ▼
//!                          router::dispatch ──effects──▶ SessionEvents
//!
//! SessionRegistry: live local ids + DisconnectNotifier tasks
//!     GET /notifyDisconnect/{memberId}
//! ```
//!
//! # Example
//!
//! ```no_run
//! use relay_session::{RelayConfig, SessionClient, SessionEvent, SqliteConfigStore, WebSocketTransportFactory};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = RelayConfig::from_env();
//! let store = Arc::new(SqliteConfigStore::new("sessions.db")?);
//! let transports = Arc::new(WebSocketTransportFactory::new(config.timeouts.send()));
//! let client = SessionClient::new(config, store, transports);
//!
//! let (handle, mut events) = client.join_random("player-1", "duel", 2)?;
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Message(message) = event {
//!         println!("{}: {}", message.member_index, message.payload);
//!         handle.send("gg", false)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod notifier;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{load_config, RelayConfig};
pub use controller::{JoinRequest, SessionClient, SessionEvents, SessionHandle};
pub use error::SessionError;
pub use heartbeat::{channel_ticker, IntervalTicker, Ticker};
pub use registry::SessionRegistry;
pub use session::{
    ConnectionStatus, DisconnectReason, SessionConfig, SessionEvent, SrMessage, SrState, Stage,
};
pub use store::{ConfigStore, SqliteConfigStore};
pub use transport::{Transport, TransportFactory, WebSocketTransportFactory};
