//! Relay link state machine for 0k-Tunnel instances.
//!
//! This module provides a pure, side-effect-free state machine for the
//! instance's persistent relay connection. It takes events as input and
//! produces a list of actions to execute.
//!
//! The actual I/O (opening sockets, sending frames, sleeping) is performed
//! by tunnel-instance, not by this module. This enables instant unit
//! testing without network mocks.

use std::time::Duration;

use crate::backoff::Backoff;
use crate::heartbeat::{Beat, Heartbeat};

/// Default number of rejected registrations tolerated before giving up.
pub const DEFAULT_REGISTER_BUDGET: u32 = 5;

/// Where the relay link is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected, not trying.
    Disconnected,
    /// Socket opening, or open with `register` sent and no reply yet.
    Connecting,
    /// Relay acknowledged `register`; sessions may arrive.
    Registered,
    /// Waiting out a backoff delay.
    Reconnecting {
        /// Consecutive failures so far.
        attempt: u32,
    },
    /// Gave up; an operator has to intervene.
    Failed {
        /// Why the link gave up.
        reason: String,
    },
    /// Shut down on request.
    Stopped,
}

impl LinkState {
    /// Terminal states accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Stopped)
    }
}

/// Inputs to the link state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Manager started.
    Start,
    /// Transport connection established.
    SocketOpened,
    /// Transport connection could not be established.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Relay answered `registered`.
    RegisterAcknowledged,
    /// Relay answered `register` with an error.
    RegisterRejected {
        /// Relay's message.
        message: String,
    },
    /// Relay refused `register` for now (rate limit). Backs off without
    /// spending the register budget.
    RegisterThrottled {
        /// Relay's message.
        message: String,
    },
    /// Heartbeat interval elapsed.
    HeartbeatTick,
    /// Relay answered a ping.
    PongReceived,
    /// Socket closed or errored.
    SocketClosed {
        /// Reason for disconnection.
        reason: String,
    },
    /// Backoff delay elapsed.
    ReconnectTimer,
    /// Owner asked for shutdown.
    Shutdown,
}

/// Actions to be executed by the connection manager.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Open the transport.
    Connect,
    /// Send `register` on the fresh socket.
    SendRegister,
    /// Send `ping`.
    SendPing,
    /// Start the heartbeat interval.
    StartHeartbeat,
    /// Stop the heartbeat interval.
    StopHeartbeat,
    /// Close the socket and tear down every session on it.
    CloseSocket,
    /// Sleep, then feed [`LinkEvent::ReconnectTimer`].
    ScheduleReconnect {
        /// Delay before reconnecting.
        delay: Duration,
    },
    /// Drop any pending reconnect.
    CancelReconnect,
    /// Tell the application.
    Emit(LinkNotice),
}

/// Notifications for the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// Registered with the relay.
    Registered,
    /// Lost the relay socket.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// A reconnect is scheduled.
    ReconnectScheduled {
        /// Which attempt this will be.
        attempt: u32,
        /// Delay before it.
        delay: Duration,
    },
    /// The link gave up for good.
    Fatal {
        /// Why.
        reason: String,
    },
    /// The link was shut down.
    Stopped,
}

/// Counts consecutive failures of one kind against a fixed allowance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    max: u32,
    used: u32,
}

impl RetryBudget {
    /// Allow `max` failures.
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Record a failure. Returns `false` once the allowance is spent.
    pub fn consume(&mut self) -> bool {
        self.used = self.used.saturating_add(1);
        self.used < self.max
    }

    /// Failures recorded since the last reset.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Forget recorded failures.
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

/// The relay link: state plus the policies that drive its transitions.
#[derive(Debug, Clone)]
pub struct RelayLink {
    state: LinkState,
    backoff: Backoff,
    heartbeat: Heartbeat,
    register_budget: RetryBudget,
}

impl RelayLink {
    /// Create a link in the Disconnected state.
    pub fn new(backoff: Backoff, heartbeat: Heartbeat, register_budget: RetryBudget) -> Self {
        Self {
            state: LinkState::Disconnected,
            backoff,
            heartbeat,
            register_budget,
        }
    }

    /// Current state.
    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Process an event and return the actions to execute.
    ///
    /// Events that make no sense in the current state are ignored.
    pub fn on_event(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        use LinkAction as A;
        use LinkEvent as E;
        use LinkState as S;

        if self.state.is_terminal() {
            return vec![];
        }

        match (self.state.clone(), event) {
            (_, E::Shutdown) => {
                self.state = S::Stopped;
                vec![
                    A::StopHeartbeat,
                    A::CancelReconnect,
                    A::CloseSocket,
                    A::Emit(LinkNotice::Stopped),
                ]
            }

            (S::Disconnected, E::Start) | (S::Reconnecting { .. }, E::ReconnectTimer) => {
                self.state = S::Connecting;
                vec![A::Connect]
            }

            (S::Connecting, E::SocketOpened) => vec![A::SendRegister],
            (S::Connecting, E::ConnectFailed { error }) => self.schedule_reconnect(error, false),
            (S::Connecting, E::RegisterAcknowledged) => {
                self.state = S::Registered;
                self.backoff.reset();
                self.heartbeat.reset();
                self.register_budget.reset();
                vec![A::StartHeartbeat, A::Emit(LinkNotice::Registered)]
            }
            (S::Connecting, E::RegisterRejected { message }) => {
                if self.register_budget.consume() {
                    self.schedule_reconnect(format!("registration rejected: {message}"), true)
                } else {
                    let reason = format!(
                        "registration rejected {} times, last: {message}",
                        self.register_budget.used()
                    );
                    self.state = S::Failed {
                        reason: reason.clone(),
                    };
                    vec![A::CloseSocket, A::Emit(LinkNotice::Fatal { reason })]
                }
            }
            (S::Connecting, E::RegisterThrottled { message }) => {
                self.schedule_reconnect(format!("registration throttled: {message}"), true)
            }
            (S::Connecting, E::SocketClosed { reason }) => self.schedule_reconnect(reason, true),

            (S::Registered, E::HeartbeatTick) => match self.heartbeat.on_tick() {
                Beat::SendPing => vec![A::SendPing],
                Beat::Dead { missed } => {
                    let mut actions = vec![A::StopHeartbeat];
                    actions.extend(
                        self.schedule_reconnect(format!("{missed} pongs missed"), true),
                    );
                    actions
                }
            },
            (S::Registered, E::PongReceived) => {
                self.heartbeat.on_pong();
                vec![]
            }
            (S::Registered, E::SocketClosed { reason }) => {
                let mut actions = vec![A::StopHeartbeat];
                actions.extend(self.schedule_reconnect(reason, true));
                actions
            }

            // Invalid transitions - stay in current state
            _ => vec![],
        }
    }

    fn schedule_reconnect(&mut self, reason: String, close_socket: bool) -> Vec<LinkAction> {
        let delay = self.backoff.next_delay();
        let attempt = self.backoff.attempt();
        self.state = LinkState::Reconnecting { attempt };

        let mut actions = Vec::with_capacity(4);
        if close_socket {
            actions.push(LinkAction::CloseSocket);
        }
        actions.push(LinkAction::Emit(LinkNotice::Disconnected { reason }));
        actions.push(LinkAction::Emit(LinkNotice::ReconnectScheduled { attempt, delay }));
        actions.push(LinkAction::ScheduleReconnect { delay });
        actions
    }
}

impl Default for RelayLink {
    fn default() -> Self {
        Self::new(
            Backoff::default(),
            Heartbeat::default(),
            RetryBudget::new(DEFAULT_REGISTER_BUDGET),
        )
    }
}
