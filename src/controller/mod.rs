//! Session controller: join entry points and the public handle.
//!
//! Every joined session gets one driver task that owns its [`SessionCore`]
//! and processes commands, connection reports and heartbeat ticks strictly
//! one at a time. [`SessionHandle`] only enqueues commands; state comes back
//! through [`SessionEvents`] and the [`SessionHandle::state`] snapshot.

mod driver;

use crate::config::RelayConfig;
use crate::error::SessionError;
use crate::heartbeat::{IntervalTicker, Ticker};
use crate::registry::SessionRegistry;
use crate::session::{SessionConfig, SessionCore, SessionEvent, SrState};
use crate::store::ConfigStore;
use crate::transport::TransportFactory;
use driver::{Command, Driver, DriverContext};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;
use uuid::Uuid;

/// How a new controller obtains its session identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRequest {
    /// Resume the record persisted for the local id
    Rejoin,
    /// Public matchmaking
    Random {
        session_type: String,
        num_members: usize,
    },
    /// Host a new private session; its id arrives as the password
    HostPrivate {
        session_type: String,
        num_members: usize,
    },
    /// Join an existing private session by id
    JoinPrivate {
        session_type: String,
        session_id: String,
    },
}

/// Composes session controllers against one relay server.
pub struct SessionClient {
    config: Arc<RelayConfig>,
    store: Arc<dyn ConfigStore>,
    transports: Arc<dyn TransportFactory>,
    registry: Arc<SessionRegistry>,
    http_client: reqwest::Client,
}

impl SessionClient {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn ConfigStore>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self::with_registry(config, store, transports, Arc::new(SessionRegistry::new()))
    }

    /// Shares `registry` with other clients so local ids stay unique across them.
    pub fn with_registry(
        config: RelayConfig,
        store: Arc<dyn ConfigStore>,
        transports: Arc<dyn TransportFactory>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            transports,
            registry,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn rejoin(&self, local_id: &str) -> Result<(SessionHandle, SessionEvents), SessionError> {
        self.join(local_id, JoinRequest::Rejoin)
    }

    pub fn join_random(
        &self,
        local_id: &str,
        session_type: &str,
        num_members: usize,
    ) -> Result<(SessionHandle, SessionEvents), SessionError> {
        self.join(
            local_id,
            JoinRequest::Random {
                session_type: session_type.to_string(),
                num_members,
            },
        )
    }

    pub fn host_private(
        &self,
        local_id: &str,
        session_type: &str,
        num_members: usize,
    ) -> Result<(SessionHandle, SessionEvents), SessionError> {
        self.join(
            local_id,
            JoinRequest::HostPrivate {
                session_type: session_type.to_string(),
                num_members,
            },
        )
    }

    pub fn join_private(
        &self,
        local_id: &str,
        session_type: &str,
        session_id: &str,
    ) -> Result<(SessionHandle, SessionEvents), SessionError> {
        self.join(
            local_id,
            JoinRequest::JoinPrivate {
                session_type: session_type.to_string(),
                session_id: session_id.to_string(),
            },
        )
    }

    fn join(
        &self,
        local_id: &str,
        request: JoinRequest,
    ) -> Result<(SessionHandle, SessionEvents), SessionError> {
        let ticker = IntervalTicker::new(self.config.heartbeat.tick());
        self.join_with_ticker(local_id, request, Box::new(ticker))
    }

    /// Starts a controller for `local_id`, driving heartbeats from `ticker`.
    ///
    /// Must be called inside a tokio runtime. Fails without side effects if
    /// the arguments are invalid, the id is already live, or the store fails.
    pub fn join_with_ticker(
        &self,
        local_id: &str,
        request: JoinRequest,
        ticker: Box<dyn Ticker>,
    ) -> Result<(SessionHandle, SessionEvents), SessionError> {
        validate(&request)?;

        let owner = Uuid::new_v4();
        self.registry.claim(local_id, owner)?;

        let session = match self.session_config(local_id, &request) {
            Ok(session) => session,
            Err(e) => {
                self.registry.release(local_id, owner);
                return Err(e);
            }
        };

        info!(
            local_id = %local_id,
            controller = %owner,
            session_type = %session.session_type,
            private = session.is_private,
            resumed = request == JoinRequest::Rejoin,
            "Joining session"
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SrState::new());

        let driver = Driver::new(
            DriverContext {
                id: owner,
                settings: Arc::clone(&self.config),
                store: Arc::clone(&self.store),
                transports: Arc::clone(&self.transports),
                registry: Arc::clone(&self.registry),
                http_client: self.http_client.clone(),
            },
            SessionCore::new(session),
            command_rx,
            event_tx,
            state_tx,
            ticker,
        );
        tokio::spawn(driver.run());

        let handle = SessionHandle {
            local_id: local_id.to_string(),
            commands: command_tx,
            state: state_rx,
        };
        Ok((handle, SessionEvents { rx: event_rx }))
    }

    /// Resolves the identity a new controller starts from, persisting new ones.
    fn session_config(
        &self,
        local_id: &str,
        request: &JoinRequest,
    ) -> Result<SessionConfig, SessionError> {
        let session = match request {
            JoinRequest::Rejoin => {
                return self
                    .store
                    .load(local_id)?
                    .filter(|record| record.initialized)
                    .ok_or_else(|| SessionError::NoSavedSession(local_id.to_string()));
            }
            JoinRequest::Random {
                session_type,
                num_members,
            } => SessionConfig::random(local_id, session_type, *num_members),
            JoinRequest::HostPrivate {
                session_type,
                num_members,
            } => SessionConfig::host_private(local_id, session_type, *num_members),
            JoinRequest::JoinPrivate {
                session_type,
                session_id,
            } => SessionConfig::join_private(local_id, session_type, session_id),
        };

        // Replaces any stale record left under this local id
        self.store.save(&session)?;
        Ok(session)
    }

    /// Cancels every pending disconnect notifier. Call at process shutdown.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

fn validate(request: &JoinRequest) -> Result<(), SessionError> {
    match request {
        JoinRequest::Rejoin => Ok(()),
        JoinRequest::Random { session_type, .. } | JoinRequest::HostPrivate { session_type, .. }
            if session_type.is_empty() =>
        {
            Err(SessionError::InvalidArgument(
                "session type must not be empty".to_string(),
            ))
        }
        JoinRequest::JoinPrivate { session_id, .. } if session_id.is_empty() => Err(
            SessionError::InvalidArgument("session id must not be empty".to_string()),
        ),
        _ => Ok(()),
    }
}

/// Control surface of one session controller.
///
/// Every operation returns as soon as the command is queued. Once the
/// controller is gone they all fail with [`SessionError::Closed`].
#[derive(Clone)]
pub struct SessionHandle {
    local_id: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SrState>,
}

impl SessionHandle {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Latest published state
    pub fn state(&self) -> SrState {
        self.state.borrow().clone()
    }

    /// Sends an application message. Dropped unless connected.
    pub fn send(&self, payload: &str, pinned: bool) -> Result<(), SessionError> {
        self.command(Command::Send {
            payload: payload.to_string(),
            pinned,
        })
    }

    /// Discards queued outgoing frames. No-op unless connected.
    pub fn clear_send_queue(&self) -> Result<(), SessionError> {
        self.command(Command::ClearSendQueue)
    }

    /// Drops the connection but keeps the session resumable via [`start`](Self::start).
    pub fn pause(&self) -> Result<(), SessionError> {
        self.command(Command::Pause)
    }

    /// Resumes a paused controller.
    pub fn start(&self) -> Result<(), SessionError> {
        self.command(Command::Start)
    }

    /// Reconnects after the connection died or the first connection failed.
    ///
    /// Ignored in any other state unless `force` is set.
    pub fn reconnect(&self, force: bool) -> Result<(), SessionError> {
        self.command(Command::Reconnect { force })
    }

    /// Leaves the session. With `end_session` the whole session is ended for
    /// every member and the resumption record is deleted.
    pub fn disconnect(&self, end_session: bool) -> Result<(), SessionError> {
        self.command(Command::Disconnect { end_session })
    }

    /// Destroys the controller. The resumption record is kept for a later `rejoin`.
    pub fn stop(&self) -> Result<(), SessionError> {
        self.command(Command::Stop)
    }

    /// False once the controller has been destroyed
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }
}

/// Ordered stream of events from one controller
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    /// Next event, or `None` once the controller is gone and the stream drained
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}
