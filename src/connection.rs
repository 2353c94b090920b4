// ABOUTME: Connection manager for the NetSIO link: handshake, keepalive, credit accounting
// ABOUTME: Pure polling model; the bridge pumps it and puts its reaction messages on the wire

use crate::codec::Message;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Tunables for the connection layer.
///
/// The keepalive interval and dead-peer threshold must both be shorter
/// than the hub's own so the hub never declares us gone first.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Credits granted to the hub (and assumed granted back) on handshake.
    pub initial_credits: u16,
    /// Idle time after which an `AliveRequest` is sent.
    pub keepalive_interval: Duration,
    /// Idle time after which the peer is considered dead.
    pub dead_threshold: Duration,
    /// Minimum spacing between stream-mode reconnect attempts.
    pub reconnect_cooldown: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_credits: 200,
            keepalive_interval: Duration::from_secs(3),
            dead_threshold: Duration::from_secs(9),
            reconnect_cooldown: Duration::from_secs(5),
        }
    }
}

/// Link-level state shared by the handshake and credit machinery.
///
/// `peer` is absent until a connect event (ping, device connect, or the
/// stream handshake) carries the transport's learned address in.
#[derive(Debug, Default)]
pub struct ConnectionState {
    pub peer: Option<SocketAddr>,
    pub connected: bool,
    pub send_credits: u16,
    pub last_seen_at: Option<Instant>,
}

/// What `on_incoming` decided about a message.
#[derive(Debug, PartialEq, Eq)]
pub enum Handled {
    /// Management opcode consumed here; reactions (if any) were queued.
    Consumed,
    /// The peer told us it is going away.
    PeerDisconnected,
    /// Not a management opcode; the bridge should dispatch it.
    NotManagement,
}

/// Tracks the hub session: who the peer is, whether the handshake has
/// completed, how many send credits remain, and when we last heard from
/// the other side.
///
/// The manager never touches a socket. `on_incoming` and `tick` push
/// their reaction messages into an outbox the bridge drains onto the
/// transport, keeping this layer trivially testable.
#[derive(Debug)]
pub struct ConnectionManager {
    pub state: ConnectionState,
    config: ConnectionConfig,
    outbox: Vec<Message>,
    last_alive_sent: Option<Instant>,
    last_reconnect: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> ConnectionManager {
        ConnectionManager {
            state: ConnectionState::default(),
            config,
            outbox: Vec::new(),
            last_alive_sent: None,
            last_reconnect: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.state.peer
    }

    pub fn send_credits(&self) -> u16 {
        self.state.send_credits
    }

    pub fn has_credit(&self) -> bool {
        self.state.send_credits > 0
    }

    /// Spend one credit for a credit-consuming send. The caller checks
    /// `has_credit` first; spending from zero is a protocol violation.
    pub fn consume_credit(&mut self) {
        debug_assert!(self.state.send_credits > 0, "send with zero credits");
        self.state.send_credits = self.state.send_credits.saturating_sub(1);
    }

    /// Messages produced as reactions, in emit order.
    pub fn drain_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }

    /// Mark the stream-mode TCP handshake as the connect event. `peer`
    /// is the transport's configured remote address.
    pub fn on_stream_connected(&mut self, peer: Option<SocketAddr>, now: Instant) {
        self.state.peer = peer;
        self.state.connected = true;
        self.state.send_credits = self.config.initial_credits;
        self.state.last_seen_at = Some(now);
        debug!("stream link established");
    }

    /// Feed one incoming message through the handshake table. `peer` is
    /// the transport's current notion of the hub's address, recorded on
    /// the connect events.
    pub fn on_incoming(
        &mut self,
        msg: &Message,
        peer: Option<SocketAddr>,
        now: Instant,
    ) -> Handled {
        match msg {
            Message::PingRequest => {
                self.state.peer = peer;
                self.state.connected = true;
                self.state.send_credits = self.config.initial_credits;
                self.state.last_seen_at = Some(now);
                debug!(credits = self.state.send_credits, "ping handshake");
                self.outbox.push(Message::PingResponse);
                self.outbox.push(Message::CreditUpdate {
                    credits: self.config.initial_credits,
                });
                Handled::Consumed
            }
            Message::PingResponse => {
                self.state.last_seen_at = Some(now);
                Handled::Consumed
            }
            Message::DeviceConnect => {
                self.state.peer = peer;
                self.state.connected = true;
                self.state.last_seen_at = Some(now);
                debug!("device connected");
                Handled::Consumed
            }
            Message::DeviceDisconnect => {
                // Connected stays set until teardown; no credit-consuming
                // sends can happen in the meantime.
                self.state.send_credits = 0;
                debug!("device disconnected");
                Handled::PeerDisconnected
            }
            Message::AliveRequest => {
                self.state.last_seen_at = Some(now);
                self.outbox.push(Message::AliveResponse);
                Handled::Consumed
            }
            Message::AliveResponse => {
                self.state.peer = peer;
                self.state.last_seen_at = Some(now);
                self.state.connected = true;
                Handled::Consumed
            }
            Message::CreditStatus => {
                self.state.send_credits = self
                    .state
                    .send_credits
                    .saturating_add(self.config.initial_credits);
                self.outbox.push(Message::CreditUpdate {
                    credits: self.config.initial_credits,
                });
                debug!(credits = self.state.send_credits, "credit window extended");
                Handled::Consumed
            }
            Message::CreditUpdate { credits } => {
                // A replacement, not an increment.
                self.state.send_credits = *credits;
                debug!(credits = *credits, "credit window replaced");
                Handled::Consumed
            }
            _ => {
                // The arms above must cover the management opcode set.
                debug_assert!(
                    !msg.opcode().is_management(),
                    "management opcode fell through the handshake table"
                );
                Handled::NotManagement
            }
        }
    }

    /// Keepalive clock. Emits at most one `AliveRequest` per interval;
    /// returns true when the peer has been silent past the dead
    /// threshold and the session was torn down.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.state.connected {
            return false;
        }
        let Some(last_seen) = self.state.last_seen_at else {
            return false;
        };
        let idle = now.duration_since(last_seen);

        if idle >= self.config.dead_threshold {
            warn!(?idle, "hub unresponsive, tearing down session");
            self.state.connected = false;
            self.state.send_credits = 0;
            self.last_alive_sent = None;
            return true;
        }

        if idle >= self.config.keepalive_interval {
            let due = match self.last_alive_sent {
                None => true,
                Some(sent) => now.duration_since(sent) >= self.config.keepalive_interval,
            };
            if due {
                self.outbox.push(Message::AliveRequest);
                self.last_alive_sent = Some(now);
            }
        }
        false
    }

    /// Gate for stream-mode reconnects: at most one attempt per cooldown
    /// window while disconnected.
    pub fn should_reconnect(&mut self, now: Instant) -> bool {
        if self.state.connected {
            return false;
        }
        let due = match self.last_reconnect {
            None => true,
            Some(last) => now.duration_since(last) >= self.config.reconnect_cooldown,
        };
        if due {
            self.last_reconnect = Some(now);
        }
        due
    }
}
