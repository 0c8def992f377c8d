use std::fmt;

/// Failures surfaced synchronously by the public session API.
///
/// Network trouble never shows up here: it is retried in the background and
/// reported through `SrState::disconnect_reason` instead.
#[derive(Debug)]
pub enum SessionError {
    /// The local identifier already has a live controller
    IdentityConflict(String),
    /// A required argument was empty or out of range
    InvalidArgument(String),
    /// `rejoin` was called but nothing is stored for the local identifier
    NoSavedSession(String),
    /// The resumption record store failed (including corrupt records)
    Storage(anyhow::Error),
    /// The controller has been destroyed and no longer accepts commands
    Closed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::IdentityConflict(id) => {
                write!(f, "local id '{}' already has a live session", id)
            }
            SessionError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            SessionError::NoSavedSession(id) => {
                write!(f, "no saved session for local id '{}'", id)
            }
            SessionError::Storage(e) => write!(f, "session store error: {:#}", e),
            SessionError::Closed => write!(f, "session controller is closed"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Storage(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for SessionError {
    fn from(e: anyhow::Error) -> Self {
        SessionError::Storage(e)
    }
}
