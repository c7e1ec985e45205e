//! RelayConnectionManager - the instance's persistent relay link.
//!
//! # Architecture
//!
//! One supervisor task owns everything about the relay socket. The link
//! logic itself is the pure [`RelayLink`] state machine from tunnel-core;
//! the supervisor feeds it events and executes the actions it returns.
//!
//! ```text
//! ManagerHandle ──commands──► supervisor ──► writer task ──► relay socket
//!                                 │  ▲                            │
//!                    per-session  │  └──────── reader ◄───────────┘
//!                    queues       ▼
//!                       acceptor tasks (Noise responder) ──► Tunnel
//! ```
//!
//! - Every outbound message goes through one writer task.
//! - Inbound frames are demultiplexed by session id into bounded
//!   per-session queues. A full queue closes that session only.
//! - Each `connection` gets its own acceptor task running the handshake
//!   as responder, pinned to the client key the relay announced.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use zerok_tunnel_core::{
    Backoff, Heartbeat, Keypair, LinkAction, LinkEvent, LinkNotice, LinkState, NoiseSession,
    RelayLink, RetryBudget, Role, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_INITIAL_BACKOFF,
    DEFAULT_MAX_BACKOFF, DEFAULT_MAX_MISSED_PONGS, DEFAULT_REGISTER_BUDGET,
};
use zerok_tunnel_types::{ClaimCode, InstanceId, PublicKey, RelayMessage, SessionId, RATE_LIMITED};

use crate::transport::{Connection, RelayStream, Transport, TransportError};
use crate::tunnel::{establish, SessionLink, Tunnel};

/// Default bound on each handshake read.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-session inbound queue.
pub const DEFAULT_SESSION_QUEUE: usize = 64;

/// Manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The link is not registered with the relay.
    #[error("not registered with the relay")]
    NotRegistered,

    /// The manager has stopped or failed.
    #[error("manager stopped")]
    Stopped,

    /// The relay refused the request.
    #[error("relay error: {0}")]
    Relay(String),

    /// The socket went away before the relay answered.
    #[error("relay connection lost")]
    Disconnected,

    /// The relay did not answer in time.
    #[error("request timed out")]
    Timeout,
}

/// Configuration for the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// WebSocket URL of the relay's instance endpoint.
    pub relay_url: String,
    /// This instance's id.
    pub instance_id: InstanceId,
    /// This instance's static key.
    pub keypair: Keypair,
    /// Candidate endpoints announced at registration.
    pub addresses: Vec<String>,
    /// Interval between pings.
    pub heartbeat_interval: Duration,
    /// Unanswered pings before the socket is declared dead.
    pub max_missed_pongs: u32,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Largest reconnect delay.
    pub max_backoff: Duration,
    /// Bound on each handshake read and on opening the socket.
    pub handshake_timeout: Duration,
    /// Bound on a request to the relay.
    pub request_timeout: Duration,
    /// Per-session inbound queue.
    pub session_queue: usize,
    /// Queue in front of the socket writer.
    pub outbound_queue: usize,
    /// Rejected registrations tolerated before giving up.
    pub register_budget: u32,
}

impl ManagerConfig {
    /// Configuration with defaults.
    pub fn new(relay_url: impl Into<String>, instance_id: InstanceId, keypair: Keypair) -> Self {
        Self {
            relay_url: relay_url.into(),
            instance_id,
            keypair,
            addresses: Vec::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_pongs: DEFAULT_MAX_MISSED_PONGS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            session_queue: DEFAULT_SESSION_QUEUE,
            outbound_queue: 256,
            register_budget: DEFAULT_REGISTER_BUDGET,
        }
    }

    /// Set the announced addresses.
    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }

    /// Set the heartbeat interval and tolerance.
    pub fn with_heartbeat(mut self, interval: Duration, max_missed: u32) -> Self {
        self.heartbeat_interval = interval;
        self.max_missed_pongs = max_missed;
        self
    }

    /// Set the reconnect backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the per-session queue bound.
    pub fn with_session_queue(mut self, bound: usize) -> Self {
        self.session_queue = bound.max(1);
        self
    }

    /// Set the registration retry budget.
    pub fn with_register_budget(mut self, budget: u32) -> Self {
        self.register_budget = budget;
        self
    }
}

/// A claim code issued through the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedClaim {
    /// The code to display.
    pub code: ClaimCode,
    /// Unix seconds after which it is dead.
    pub expires_at: i64,
}

/// Snapshot of the link for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStats {
    /// Registered with the relay right now.
    pub relay_connected: bool,
    /// Sessions with a live queue (handshaking or established).
    pub active_sessions: usize,
}

#[derive(Debug, Default)]
struct SharedStats {
    relay_connected: AtomicBool,
    active_sessions: AtomicUsize,
}

enum Command {
    IssueCode {
        ttl: Option<Duration>,
        reply: oneshot::Sender<Result<IssuedClaim, ManagerError>>,
    },
    Shutdown,
}

/// Spawns the relay link supervisor.
#[derive(Debug)]
pub struct RelayConnectionManager;

impl RelayConnectionManager {
    /// Start the manager. Established tunnels arrive on the returned
    /// receiver.
    pub fn spawn<T: Transport>(
        config: ManagerConfig,
        transport: T,
    ) -> (ManagerHandle, mpsc::Receiver<Tunnel>) {
        let (commands_tx, commands) = mpsc::channel(32);
        let (state_tx, state) = watch::channel(LinkState::Disconnected);
        let (events, _) = broadcast::channel(64);
        let (tunnels_tx, tunnels) = mpsc::channel(16);
        let stats = Arc::new(SharedStats::default());

        let link = RelayLink::new(
            Backoff::new(config.initial_backoff, config.max_backoff),
            Heartbeat::new(config.max_missed_pongs),
            RetryBudget::new(config.register_budget),
        );
        let request_timeout = config.request_timeout;

        let supervisor = Supervisor {
            config,
            transport,
            link,
            state_tx,
            events: events.clone(),
            stats: stats.clone(),
            commands,
            tunnels: tunnels_tx,
            socket: None,
            sessions: HashMap::new(),
            acceptors: JoinSet::new(),
            heartbeat: None,
            reconnect_at: None,
            pending_codes: VecDeque::new(),
        };
        let task = tokio::spawn(supervisor.run());

        let handle = ManagerHandle {
            commands: commands_tx,
            state,
            events,
            stats,
            request_timeout,
            supervisor: task,
        };
        (handle, tunnels)
    }
}

/// Control surface of a running manager.
#[derive(Debug)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<LinkState>,
    events: broadcast::Sender<LinkNotice>,
    stats: Arc<SharedStats>,
    request_timeout: Duration,
    supervisor: JoinHandle<()>,
}

impl ManagerHandle {
    /// Watch the link state.
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Current link state.
    pub fn current_state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    /// Subscribe to link notices.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkNotice> {
        self.events.subscribe()
    }

    /// Link statistics.
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            relay_connected: self.stats.relay_connected.load(Ordering::Relaxed),
            active_sessions: self.stats.active_sessions.load(Ordering::Relaxed),
        }
    }

    /// Wait until registered. Fails if the link reaches a terminal state.
    pub async fn wait_registered(&self) -> Result<(), ManagerError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s == LinkState::Registered || s.is_terminal())
            .await
            .map_err(|_| ManagerError::Stopped)?;
        if *reached == LinkState::Registered {
            Ok(())
        } else {
            Err(ManagerError::Stopped)
        }
    }

    /// Ask the relay for a claim code pointing at this instance.
    pub async fn issue_claim_code(&self, ttl: Option<Duration>) -> Result<IssuedClaim, ManagerError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::IssueCode { ttl, reply })
            .await
            .map_err(|_| ManagerError::Stopped)?;

        match tokio::time::timeout(self.request_timeout, answer).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ManagerError::Stopped),
            Err(_) => Err(ManagerError::Timeout),
        }
    }

    /// Stop the manager: cancel timers, close the socket, abort session
    /// tasks and wait for the supervisor to exit.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.supervisor.await {
            tracing::error!("Relay supervisor ended abnormally: {}", e);
        }
    }
}

struct Socket {
    outbound: mpsc::Sender<RelayMessage>,
    stream: Box<dyn RelayStream>,
    writer: JoinHandle<()>,
}

enum Wake {
    Command(Option<Command>),
    Relay(Option<Result<RelayMessage, TransportError>>),
    Tick,
    Reconnect,
    Acceptor(Result<(), JoinError>),
}

struct Supervisor<T> {
    config: ManagerConfig,
    transport: T,
    link: RelayLink,
    state_tx: watch::Sender<LinkState>,
    events: broadcast::Sender<LinkNotice>,
    stats: Arc<SharedStats>,
    commands: mpsc::Receiver<Command>,
    tunnels: mpsc::Sender<Tunnel>,
    socket: Option<Socket>,
    sessions: HashMap<SessionId, mpsc::Sender<Vec<u8>>>,
    acceptors: JoinSet<()>,
    heartbeat: Option<Interval>,
    reconnect_at: Option<Pin<Box<Sleep>>>,
    pending_codes: VecDeque<oneshot::Sender<Result<IssuedClaim, ManagerError>>>,
}

impl<T: Transport> Supervisor<T> {
    async fn run(mut self) {
        self.dispatch(LinkEvent::Start).await;

        while !self.link.state().is_terminal() {
            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                msg = read(&mut self.socket) => Wake::Relay(msg),
                _ = tick(&mut self.heartbeat) => Wake::Tick,
                _ = wait(&mut self.reconnect_at) => Wake::Reconnect,
                Some(res) = self.acceptors.join_next(), if !self.acceptors.is_empty() => {
                    Wake::Acceptor(res)
                }
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => {
                    self.dispatch(LinkEvent::Shutdown).await;
                }
                Wake::Command(Some(Command::IssueCode { ttl, reply })) => {
                    self.request_code(ttl, reply);
                }
                Wake::Relay(Some(Ok(message))) => {
                    if let Some(event) = self.on_message(message) {
                        self.dispatch(event).await;
                    }
                }
                Wake::Relay(Some(Err(e))) => {
                    self.dispatch(LinkEvent::SocketClosed {
                        reason: e.to_string(),
                    })
                    .await;
                }
                Wake::Relay(None) => {
                    self.dispatch(LinkEvent::SocketClosed {
                        reason: "relay closed the socket".into(),
                    })
                    .await;
                }
                Wake::Tick => self.dispatch(LinkEvent::HeartbeatTick).await,
                Wake::Reconnect => {
                    self.reconnect_at = None;
                    self.dispatch(LinkEvent::ReconnectTimer).await;
                }
                Wake::Acceptor(Err(e)) if e.is_panic() => {
                    tracing::error!("Session acceptor panicked: {}", e);
                }
                Wake::Acceptor(_) => {}
            }
            self.refresh_stats();
        }

        self.acceptors.shutdown().await;
        if let Some(socket) = self.socket.take() {
            socket.writer.abort();
        }
        self.refresh_stats();
        tracing::debug!("Relay supervisor exited");
    }

    /// Feed `event` to the link and run the resulting actions, including
    /// any follow-up events they produce.
    async fn dispatch(&mut self, event: LinkEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let actions = self.link.on_event(event);
            self.publish_state();
            for action in actions {
                if let Some(follow) = self.execute(action).await {
                    queue.push_back(follow);
                }
            }
        }
    }

    async fn execute(&mut self, action: LinkAction) -> Option<LinkEvent> {
        match action {
            LinkAction::Connect => self.connect().await,
            LinkAction::SendRegister => {
                let register = RelayMessage::Register {
                    instance_id: self.config.instance_id,
                    public_key: self.config.keypair.public_key(),
                    addresses: self.config.addresses.clone(),
                };
                self.send(register)
                    .err()
                    .map(|e| LinkEvent::SocketClosed {
                        reason: e.to_string(),
                    })
            }
            LinkAction::SendPing => {
                if let Err(e) = self.send(RelayMessage::Ping) {
                    tracing::debug!("Ping not sent: {}", e);
                }
                None
            }
            LinkAction::StartHeartbeat => {
                let period = self.config.heartbeat_interval;
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);
                None
            }
            LinkAction::StopHeartbeat => {
                self.heartbeat = None;
                None
            }
            LinkAction::CloseSocket => {
                self.close_socket().await;
                None
            }
            LinkAction::ScheduleReconnect { delay } => {
                self.reconnect_at = Some(Box::pin(tokio::time::sleep(delay)));
                None
            }
            LinkAction::CancelReconnect => {
                self.reconnect_at = None;
                None
            }
            LinkAction::Emit(notice) => {
                self.emit(notice);
                None
            }
        }
    }

    async fn connect(&mut self) -> Option<LinkEvent> {
        let url = self.config.relay_url.clone();
        tracing::debug!(%url, "Connecting to relay");

        match tokio::time::timeout(self.config.handshake_timeout, self.transport.connect(&url)).await
        {
            Ok(Ok(connection)) => {
                self.install(connection);
                Some(LinkEvent::SocketOpened)
            }
            Ok(Err(e)) => Some(LinkEvent::ConnectFailed {
                error: e.to_string(),
            }),
            Err(_) => Some(LinkEvent::ConnectFailed {
                error: TransportError::Timeout.to_string(),
            }),
        }
    }

    fn install(&mut self, connection: Connection) {
        let Connection { mut sink, stream } = connection;
        let (outbound, mut queue) = mpsc::channel::<RelayMessage>(self.config.outbound_queue.max(1));

        let writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::debug!("Relay write failed: {}", e);
                    break;
                }
            }
            sink.close().await;
        });

        self.socket = Some(Socket {
            outbound,
            stream,
            writer,
        });
    }

    async fn close_socket(&mut self) {
        // Dropping the queues ends every tunnel on this socket
        self.sessions.clear();
        self.acceptors.shutdown().await;
        for reply in self.pending_codes.drain(..) {
            let _ = reply.send(Err(ManagerError::Disconnected));
        }
        if let Some(socket) = self.socket.take() {
            socket.writer.abort();
        }
    }

    fn send(&self, message: RelayMessage) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::ConnectionClosed)?;
        socket.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::SendFailed("outbound queue full".into()),
            TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    fn on_message(&mut self, message: RelayMessage) -> Option<LinkEvent> {
        match message {
            RelayMessage::Registered => Some(LinkEvent::RegisterAcknowledged),
            RelayMessage::Pong => Some(LinkEvent::PongReceived),
            RelayMessage::Ping => {
                let _ = self.send(RelayMessage::Pong);
                None
            }
            RelayMessage::Error { message } => {
                if *self.link.state() == LinkState::Connecting {
                    return Some(if message == RATE_LIMITED {
                        LinkEvent::RegisterThrottled { message }
                    } else {
                        LinkEvent::RegisterRejected { message }
                    });
                }
                match self.pending_codes.pop_front() {
                    Some(reply) => {
                        let _ = reply.send(Err(ManagerError::Relay(message)));
                    }
                    None => tracing::warn!("Relay reported: {}", message),
                }
                None
            }
            RelayMessage::ClaimCode { code, expires_at } => {
                match self.pending_codes.pop_front() {
                    Some(reply) => {
                        let _ = reply.send(Ok(IssuedClaim { code, expires_at }));
                    }
                    None => tracing::debug!("Unsolicited claim code ignored"),
                }
                None
            }
            RelayMessage::Connection {
                session_id,
                client_public_key,
            } => {
                self.open_session(session_id, client_public_key);
                None
            }
            RelayMessage::Frame {
                session_id,
                payload,
            } => {
                self.route_frame(session_id, payload);
                None
            }
            RelayMessage::Close { session_id } => {
                if self.sessions.remove(&session_id).is_some() {
                    tracing::debug!(session = ?session_id, "Session closed by relay");
                }
                None
            }
            other => {
                tracing::debug!(kind = other.kind(), "Ignoring unexpected relay message");
                None
            }
        }
    }

    fn open_session(&mut self, session_id: SessionId, client_public_key: PublicKey) {
        if *self.link.state() != LinkState::Registered {
            tracing::debug!(session = ?session_id, "Connection before registration ignored");
            return;
        }
        let Some(outbound) = self.socket.as_ref().map(|s| s.outbound.clone()) else {
            return;
        };
        if self.sessions.contains_key(&session_id) {
            tracing::warn!(session = ?session_id, "Duplicate connection ignored");
            return;
        }

        let (inbound_tx, inbound) = mpsc::channel(self.config.session_queue.max(1));
        self.sessions.insert(session_id, inbound_tx);

        tracing::info!(session = ?session_id, client = ?client_public_key, "Incoming session");
        let link = SessionLink::new(session_id, outbound, inbound);
        self.acceptors.spawn(accept_session(
            link,
            self.config.keypair.clone(),
            client_public_key,
            self.config.handshake_timeout,
            self.tunnels.clone(),
        ));
    }

    fn route_frame(&mut self, session_id: SessionId, payload: Vec<u8>) {
        let Some(queue) = self.sessions.get(&session_id) else {
            tracing::debug!(session = ?session_id, "Frame for unknown session dropped");
            return;
        };

        match queue.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session = ?session_id, "Session queue overflow, closing session");
                self.sessions.remove(&session_id);
                let _ = self.send(RelayMessage::Close { session_id });
            }
            Err(TrySendError::Closed(_)) => {
                self.sessions.remove(&session_id);
            }
        }
    }

    fn request_code(
        &mut self,
        ttl: Option<Duration>,
        reply: oneshot::Sender<Result<IssuedClaim, ManagerError>>,
    ) {
        if *self.link.state() != LinkState::Registered {
            let _ = reply.send(Err(ManagerError::NotRegistered));
            return;
        }
        let request = RelayMessage::IssueCode {
            ttl_secs: ttl.map(|d| d.as_secs()),
        };
        match self.send(request) {
            Ok(()) => self.pending_codes.push_back(reply),
            Err(e) => {
                tracing::debug!("Claim code request not sent: {}", e);
                let _ = reply.send(Err(ManagerError::Disconnected));
            }
        }
    }

    fn emit(&self, notice: LinkNotice) {
        match &notice {
            LinkNotice::Registered => tracing::info!("Registered with relay"),
            LinkNotice::Disconnected { reason } => {
                tracing::warn!("Relay connection lost: {}", reason)
            }
            LinkNotice::ReconnectScheduled { attempt, delay } => {
                tracing::info!(attempt, ?delay, "Reconnect scheduled")
            }
            LinkNotice::Fatal { reason } => tracing::error!("Relay link failed: {}", reason),
            LinkNotice::Stopped => tracing::info!("Relay link stopped"),
        }
        let _ = self.events.send(notice);
    }

    fn publish_state(&self) {
        let next = self.link.state();
        self.state_tx.send_if_modified(|current| {
            if current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
    }

    fn refresh_stats(&mut self) {
        self.sessions.retain(|_, queue| !queue.is_closed());
        self.stats
            .active_sessions
            .store(self.sessions.len(), Ordering::Relaxed);
        self.stats.relay_connected.store(
            *self.link.state() == LinkState::Registered,
            Ordering::Relaxed,
        );
    }
}

async fn accept_session(
    link: SessionLink,
    keypair: Keypair,
    client_public_key: PublicKey,
    timeout: Duration,
    tunnels: mpsc::Sender<Tunnel>,
) {
    let session_id = link.session_id;
    let noise = NoiseSession::initialize(Role::Responder, keypair, Some(client_public_key));

    match establish(noise, link, None, timeout).await {
        Ok(tunnel) => {
            tracing::info!(session = ?session_id, "Tunnel established");
            if tunnels.send(tunnel).await.is_err() {
                tracing::debug!(session = ?session_id, "No tunnel consumer, closing");
            }
        }
        Err(e) => tracing::warn!(session = ?session_id, "Handshake failed: {}", e),
    }
}

async fn read(socket: &mut Option<Socket>) -> Option<Result<RelayMessage, TransportError>> {
    match socket {
        Some(socket) => socket.stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
