use crate::config::RelayConfig;
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor, Ticker};
use crate::notifier::DisconnectNotifier;
use crate::probe::ConnectivityProber;
use crate::protocol::{connection_url, OutgoingFrame};
use crate::registry::SessionRegistry;
use crate::router::{dispatch_batch, Effect, Teardown};
use crate::session::{ConnectionStatus, DisconnectReason, SessionCore, SessionEvent, SrState, Stage};
use crate::store::ConfigStore;
use crate::transport::{Transport, TransportFactory};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Operations queued by a `SessionHandle`
#[derive(Debug)]
pub(super) enum Command {
    Send { payload: String, pinned: bool },
    ClearSendQueue,
    Pause,
    Start,
    Reconnect { force: bool },
    Disconnect { end_session: bool },
    Stop,
}

/// Shared collaborators of every driver spawned by one client
pub(super) struct DriverContext {
    pub id: Uuid,
    pub settings: Arc<RelayConfig>,
    pub store: Arc<dyn ConfigStore>,
    pub transports: Arc<dyn TransportFactory>,
    pub registry: Arc<SessionRegistry>,
    pub http_client: reqwest::Client,
}

impl DriverContext {
    fn notifier(&self, member_id: &str) -> DisconnectNotifier {
        DisconnectNotifier::new(
            self.http_client.clone(),
            &self.settings.server.http_url,
            member_id,
            self.settings.reconnect.notify_period(),
            self.settings.timeouts.notify(),
        )
    }
}

/// Progress report from a background task of one connection attempt
enum AttemptEvent {
    /// A transport is about to be opened
    Opening,
    /// That transport failed to open; the attempt may wait for a notifier again
    OpenFailed,
    Connected(Arc<dyn Transport>),
    /// First probe of a fresh join failed
    Unreachable,
    /// Every open attempt failed
    Exhausted,
    Frames(String),
    TransportClosed,
}

struct Report {
    attempt: u64,
    event: AttemptEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Probing or waiting for a pending notifier; no transport exists
    Preparing,
    Opening,
    Connected,
}

enum Next {
    Command(Option<Command>),
    Report(Report),
    Tick,
}

/// Owns one controller's session state; everything touching it runs here.
pub(super) struct Driver {
    ctx: DriverContext,
    core: SessionCore,
    monitor: HeartbeatMonitor,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<SrState>,
    ticker: Box<dyn Ticker>,
    reports_tx: mpsc::UnboundedSender<Report>,
    reports_rx: mpsc::UnboundedReceiver<Report>,
    /// Cancelled when the controller is destroyed
    lifetime: CancellationToken,
    /// Child of `lifetime`, replaced on every connection attempt
    attempt_cancel: CancellationToken,
    attempt: u64,
    phase: Phase,
    transport: Option<Arc<dyn Transport>>,
    ever_connected: bool,
    /// Disconnect requested while the transport was opening; holds `end_session`
    deferred_disconnect: Option<bool>,
    closing: bool,
    stopped: bool,
}

impl Driver {
    pub(super) fn new(
        ctx: DriverContext,
        core: SessionCore,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<SessionEvent>,
        state: watch::Sender<SrState>,
        ticker: Box<dyn Ticker>,
    ) -> Self {
        let monitor = HeartbeatMonitor::new(&ctx.settings.heartbeat);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();
        let attempt_cancel = lifetime.child_token();

        Self {
            ctx,
            core,
            monitor,
            commands,
            events,
            state,
            ticker,
            reports_tx,
            reports_rx,
            lifetime,
            attempt_cancel,
            attempt: 0,
            phase: Phase::Idle,
            transport: None,
            ever_connected: false,
            deferred_disconnect: None,
            closing: false,
            stopped: false,
        }
    }

    pub(super) async fn run(mut self) {
        self.start_attempt().await;

        while !self.closing && !self.stopped {
            // Attempt progress lands before commands queued after it
            let next = tokio::select! {
                biased;
                Some(report) = self.reports_rx.recv() => Next::Report(report),
                command = self.commands.recv() => Next::Command(command),
                _ = self.ticker.tick() => Next::Tick,
            };

            match next {
                Next::Command(Some(command)) => self.handle_command(command).await,
                Next::Command(None) => {
                    debug!(local_id = %self.core.config.local_id, "Every handle dropped");
                    self.stop().await;
                }
                Next::Report(report) => self.handle_report(report).await,
                Next::Tick => self.heartbeat().await,
            }
        }

        if self.closing && !self.stopped {
            self.await_notifier().await;
        }

        self.lifetime.cancel();
        self.ctx.registry.release(&self.core.config.local_id, self.ctx.id);
        info!(
            local_id = %self.core.config.local_id,
            controller = %self.ctx.id,
            "Session controller destroyed"
        );
    }

    /// Keeps a closed controller alive until its disconnect notification is acknowledged.
    async fn await_notifier(&mut self) {
        let local_id = self.core.config.local_id.clone();
        let poll = self.ctx.settings.reconnect.notifier_poll();
        let cleared = self
            .ctx
            .registry
            .wait_for_notifier(&local_id, poll, &self.lifetime);
        tokio::pin!(cleared);

        loop {
            tokio::select! {
                _ = &mut cleared => break,
                command = self.commands.recv() => match command {
                    Some(Command::Stop) | None => break,
                    Some(command) => debug!(local_id = %local_id, command = ?command, "Session closed, ignoring command"),
                },
            }
        }
    }

    fn publish(&self) {
        let snapshot = self.core.state.clone();
        self.state.send_replace(snapshot.clone());
        self.emit(SessionEvent::StateChanged(snapshot));
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn save_config(&self) {
        if let Err(e) = self.ctx.store.save(&self.core.config) {
            warn!(
                local_id = %self.core.config.local_id,
                error = %format!("{:#}", e),
                "Failed to persist session record"
            );
        }
    }

    /// Persists a server-assigned identity change unless a disconnect is under way.
    fn persist(&self) {
        if self.core.disconnecting || self.core.config.trying_to_end_session {
            debug!(local_id = %self.core.config.local_id, "Not persisting while disconnecting");
            return;
        }
        self.save_config();
    }

    fn start_notifier(&self) {
        if let Some(member_id) = self.core.config.member_id.as_deref() {
            self.ctx
                .registry
                .start_notifier(&self.core.config.local_id, self.ctx.notifier(member_id));
        }
    }

    /// Begins a fresh connection attempt, abandoning any attempt in flight.
    async fn start_attempt(&mut self) {
        self.attempt_cancel.cancel();
        self.attempt += 1;
        self.attempt_cancel = self.lifetime.child_token();
        self.phase = Phase::Preparing;

        self.core.state.status = if self.ever_connected {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        };
        self.core.state.disconnect_reason = None;
        self.core.pending_heartbeats = 0;
        self.monitor.reset();
        self.publish();

        let url = match connection_url(&self.ctx.settings.server.ws_url, &self.core.config) {
            Ok(url) => url,
            Err(e) => {
                warn!(local_id = %self.core.config.local_id, error = %format!("{:#}", e), "Cannot build connection URL");
                let reason = self.failure_reason();
                self.teardown(Teardown::resumable(reason)).await;
                return;
            }
        };

        debug!(
            local_id = %self.core.config.local_id,
            attempt = self.attempt,
            url = %url,
            "Starting connection attempt"
        );

        let attempt = ConnectAttempt {
            attempt: self.attempt,
            cancel: self.attempt_cancel.clone(),
            local_id: self.core.config.local_id.clone(),
            url,
            fail_fast: !self.ever_connected,
            prober: ConnectivityProber::new(
                self.ctx.http_client.clone(),
                &self.ctx.settings.server.http_url,
                self.ctx.settings.timeouts.probe(),
            ),
            settings: Arc::clone(&self.ctx.settings),
            registry: Arc::clone(&self.ctx.registry),
            transports: Arc::clone(&self.ctx.transports),
            notifier: self
                .core
                .config
                .member_id
                .as_deref()
                .map(|member_id| self.ctx.notifier(member_id)),
            reports: self.reports_tx.clone(),
        };
        tokio::spawn(attempt.run());
    }

    fn failure_reason(&self) -> DisconnectReason {
        if self.ever_connected {
            DisconnectReason::ConnectionDied
        } else {
            DisconnectReason::InitialConnectionFailed
        }
    }

    /// Drops the current transport and connects again with the same identity.
    async fn restart_connection(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.dispose().await;
        }
        self.core.mark_self_absent();
        self.start_attempt().await;
    }

    async fn teardown(&mut self, teardown: Teardown) {
        self.attempt_cancel.cancel();
        self.phase = Phase::Idle;
        self.deferred_disconnect = None;
        if let Some(transport) = self.transport.take() {
            transport.dispose().await;
        }

        let local_id = self.core.config.local_id.clone();
        if teardown.close_stage {
            self.core.state.stage = Stage::ConnectionClosed;
            self.closing = true;
        }
        if teardown.clear_config {
            if let Err(e) = self.ctx.store.delete(&local_id) {
                warn!(local_id = %local_id, error = %format!("{:#}", e), "Failed to delete session record");
            }
        }
        if teardown.close_stage || teardown.clear_config {
            self.ctx.registry.release(&local_id, self.ctx.id);
        }

        self.core.state.status = ConnectionStatus::Disconnected;
        self.core.state.disconnect_reason = Some(teardown.reason);
        info!(
            local_id = %local_id,
            reason = ?teardown.reason,
            closed = teardown.close_stage,
            "Session disconnected"
        );
        self.publish();

        // The overwriting connection owns the member slot now
        if teardown.reason != DisconnectReason::ConnectionOverwritten {
            self.start_notifier();
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { payload, pinned } => {
                self.send_frame(&OutgoingFrame::SendMessage { payload, pinned });
            }
            Command::ClearSendQueue => {
                if let Some(transport) = self.connected_transport() {
                    transport.clear_send_queue();
                }
            }
            Command::Pause => {
                if self.core.state.status == ConnectionStatus::Disconnected {
                    debug!(local_id = %self.core.config.local_id, "Already disconnected, nothing to pause");
                    return;
                }
                self.teardown(Teardown::resumable(DisconnectReason::Paused)).await;
            }
            Command::Start => {
                let paused = self.core.state.status == ConnectionStatus::Disconnected
                    && self.core.state.disconnect_reason == Some(DisconnectReason::Paused);
                if paused {
                    info!(local_id = %self.core.config.local_id, "Resuming paused session");
                    self.restart_connection().await;
                } else {
                    debug!(local_id = %self.core.config.local_id, "Not paused, ignoring start");
                }
            }
            Command::Reconnect { force } => {
                let allowed = self.core.state.status == ConnectionStatus::Disconnected
                    && self
                        .core
                        .state
                        .disconnect_reason
                        .map_or(false, DisconnectReason::allows_reconnect);
                if force || allowed {
                    info!(local_id = %self.core.config.local_id, force, "Reconnecting");
                    self.restart_connection().await;
                } else {
                    debug!(
                        local_id = %self.core.config.local_id,
                        status = ?self.core.state.status,
                        "Reconnect not allowed in current state"
                    );
                }
            }
            Command::Disconnect { end_session } => self.disconnect(end_session).await,
            Command::Stop => self.stop().await,
        }
    }

    async fn disconnect(&mut self, end_session: bool) {
        self.core.disconnecting = true;

        if end_session
            && self.core.state.stage == Stage::SessionInProgress
            && self.phase != Phase::Idle
        {
            // The server ends the session for everyone and answers SESSION_END
            info!(local_id = %self.core.config.local_id, "Requesting session end");
            self.core.config.trying_to_end_session = true;
            self.save_config();
            if self.phase == Phase::Connected {
                self.monitor.reset();
                self.heartbeat().await;
            }
            return;
        }

        if self.phase == Phase::Opening {
            debug!(local_id = %self.core.config.local_id, "Deferring disconnect until connected");
            self.deferred_disconnect = Some(end_session);
            return;
        }

        self.teardown(Teardown {
            reason: DisconnectReason::DisconnectRequested,
            close_stage: true,
            clear_config: end_session,
        })
        .await;
    }

    async fn stop(&mut self) {
        info!(local_id = %self.core.config.local_id, controller = %self.ctx.id, "Stopping session controller");
        self.lifetime.cancel();
        self.phase = Phase::Idle;
        if let Some(transport) = self.transport.take() {
            transport.dispose().await;
        }

        if self.core.state.status != ConnectionStatus::Disconnected {
            self.core.state.status = ConnectionStatus::Disconnected;
            self.core.state.disconnect_reason = Some(DisconnectReason::DisconnectRequested);
            self.publish();
            self.start_notifier();
        }
        self.stopped = true;
    }

    async fn handle_report(&mut self, report: Report) {
        if report.attempt != self.attempt || self.attempt_cancel.is_cancelled() {
            if let AttemptEvent::Connected(transport) = report.event {
                debug!(attempt = report.attempt, "Closing transport of abandoned attempt");
                transport.dispose().await;
            }
            return;
        }

        match report.event {
            AttemptEvent::Opening => self.phase = Phase::Opening,
            AttemptEvent::OpenFailed => {
                self.phase = Phase::Preparing;
                if let Some(end_session) = self.deferred_disconnect.take() {
                    self.teardown(Teardown {
                        reason: DisconnectReason::DisconnectRequested,
                        close_stage: true,
                        clear_config: end_session,
                    })
                    .await;
                }
            }
            AttemptEvent::Connected(transport) => self.on_connected(transport).await,
            AttemptEvent::Unreachable => {
                info!(local_id = %self.core.config.local_id, "Relay server unreachable");
                self.teardown(Teardown::resumable(DisconnectReason::InitialConnectionFailed))
                    .await;
            }
            AttemptEvent::Exhausted => self.on_exhausted().await,
            AttemptEvent::Frames(text) => {
                if self.phase != Phase::Connected {
                    return;
                }
                let effects = dispatch_batch(&mut self.core, &text);
                self.apply(effects).await;
            }
            AttemptEvent::TransportClosed => {
                if self.phase == Phase::Connected {
                    info!(local_id = %self.core.config.local_id, "Connection lost, reconnecting");
                    self.restart_connection().await;
                }
            }
        }
    }

    async fn on_connected(&mut self, transport: Arc<dyn Transport>) {
        self.transport = Some(Arc::clone(&transport));
        self.phase = Phase::Connected;

        if let Some(end_session) = self.deferred_disconnect.take() {
            if !self.core.config.trying_to_end_session {
                self.teardown(Teardown {
                    reason: DisconnectReason::DisconnectRequested,
                    close_stage: true,
                    clear_config: end_session,
                })
                .await;
                return;
            }
        }

        self.ever_connected = true;
        self.core.state.status = ConnectionStatus::Connected;
        self.core.state.stable = true;
        self.core.state.disconnect_reason = None;
        self.core.pending_heartbeats = 0;
        self.monitor.reset();
        info!(
            local_id = %self.core.config.local_id,
            attempt = self.attempt,
            member_id = ?self.core.config.member_id,
            "Connected to relay"
        );
        self.publish();

        let reports = self.reports_tx.clone();
        let attempt = self.attempt;
        let cancel = self.attempt_cancel.clone();
        tokio::spawn(async move {
            let forward = |text: String| {
                let _ = reports.send(Report {
                    attempt,
                    event: AttemptEvent::Frames(text),
                });
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = transport.receive_loop(&forward) => {}
            }
            let _ = reports.send(Report {
                attempt,
                event: AttemptEvent::TransportClosed,
            });
        });
    }

    async fn on_exhausted(&mut self) {
        match self.core.config.member_id.take() {
            Some(stale_member_id) => {
                warn!(
                    local_id = %self.core.config.local_id,
                    member_id = %stale_member_id,
                    "Every connection attempt failed, rejoining without member id"
                );
                self.persist();
                self.emit(SessionEvent::IdentityReset { stale_member_id });
                self.ever_connected = false;
                self.start_attempt().await;
            }
            None => {
                let reason = self.failure_reason();
                self.teardown(Teardown::resumable(reason)).await;
            }
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StateChanged => self.publish(),
                Effect::Persist => self.persist(),
                Effect::Deliver(message) => self.emit(SessionEvent::Message(message)),
                Effect::Teardown(teardown) => {
                    self.teardown(teardown).await;
                    break;
                }
                Effect::Reconnect => {
                    self.restart_connection().await;
                    break;
                }
            }
        }
    }

    async fn heartbeat(&mut self) {
        if self.phase != Phase::Connected {
            return;
        }
        match self.monitor.on_tick(Instant::now(), &mut self.core) {
            HeartbeatAction::Idle => {}
            HeartbeatAction::Send {
                frame,
                became_unstable,
                reconnect,
            } => {
                self.send_frame(&frame);
                if became_unstable {
                    self.publish();
                }
                if reconnect {
                    self.restart_connection().await;
                }
            }
        }
    }

    fn connected_transport(&self) -> Option<&Arc<dyn Transport>> {
        if self.core.state.status != ConnectionStatus::Connected {
            return None;
        }
        self.transport.as_ref()
    }

    fn send_frame(&self, frame: &OutgoingFrame) {
        let Some(transport) = self.connected_transport() else {
            debug!(local_id = %self.core.config.local_id, "Not connected, dropping outgoing frame");
            return;
        };

        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Dropping unserializable frame");
                return;
            }
        };
        if let Err(e) = transport.send(text) {
            debug!(local_id = %self.core.config.local_id, error = %e, "Send failed");
        }
    }
}

/// Background half of one connection attempt: probe, wait for any pending
/// notifier, then open the transport with retries.
struct ConnectAttempt {
    attempt: u64,
    cancel: CancellationToken,
    local_id: String,
    url: String,
    /// Give up after a single failed probe
    fail_fast: bool,
    prober: ConnectivityProber,
    settings: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    transports: Arc<dyn TransportFactory>,
    notifier: Option<DisconnectNotifier>,
    reports: mpsc::UnboundedSender<Report>,
}

impl ConnectAttempt {
    fn report(&self, event: AttemptEvent) {
        let _ = self.reports.send(Report {
            attempt: self.attempt,
            event,
        });
    }

    async fn run(self) {
        let reachable = if self.fail_fast {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                reachable = self.prober.probe() => reachable,
            }
        } else {
            self.prober
                .wait_until_reachable(self.settings.reconnect.probe_interval(), &self.cancel)
                .await
        };

        if !reachable {
            if !self.cancel.is_cancelled() {
                self.report(AttemptEvent::Unreachable);
            }
            return;
        }

        let poll = self.settings.reconnect.notifier_poll();
        let tries = self.settings.reconnect.connect_retries + 1;
        for attempt_no in 1..=tries {
            // The server must never see two connections for one member slot
            if !self
                .registry
                .wait_for_notifier(&self.local_id, poll, &self.cancel)
                .await
            {
                return;
            }

            self.report(AttemptEvent::Opening);
            let transport = self.transports.create(&self.url);
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    transport.dispose().await;
                    return;
                }
                result = transport.connect(self.settings.timeouts.connect()) => result,
            };

            match result {
                Ok(()) => {
                    self.report(AttemptEvent::Connected(transport));
                    return;
                }
                Err(e) => {
                    debug!(
                        local_id = %self.local_id,
                        attempt = self.attempt,
                        try_no = attempt_no,
                        error = %format!("{:#}", e),
                        "Transport open failed"
                    );
                    transport.dispose().await;
                    if let Some(notifier) = &self.notifier {
                        self.registry.start_notifier(&self.local_id, notifier.clone());
                    }
                    self.report(AttemptEvent::OpenFailed);
                }
            }
        }

        if !self.cancel.is_cancelled() {
            self.report(AttemptEvent::Exhausted);
        }
    }
}
