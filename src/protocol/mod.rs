// Relay wire protocol: frames and connection endpoints

pub mod frames;
pub mod url;

pub use frames::{parse_batch, IncomingFrame, OutgoingFrame, WaitingFor, WireMessage};
pub use url::{connection_url, notify_disconnect_url, ping_url};
