// NetSIO bridge: turns SIO bus transactions into NetSIO message
// sequences and reassembles the hub's answer for the bus front-end.
//
// The bridge owns everything session-scoped: the connection manager,
// the sync counter, the single in-flight sync slot, and the response
// buffer the front-end drains through `poll_response`. There is exactly
// one bridge per emulated machine; nothing here is process-global.

use crate::codec::{Message, SyncCounter};
use crate::connection::{ConnectionConfig, ConnectionManager, Handled};
use crate::sio::{CommandFrame, SioStatus, COMPLETE, ERROR};
use crate::transport::{LinkMode, Transport, TransportError};
use bytes::Bytes;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on buffered response bytes for one command.
pub const MAX_RESPONSE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Send window exhausted; surfaces as SIO NAK.
    #[error("no send credits left")]
    Backpressure,

    /// No hub session; surfaces as SIO error.
    #[error("hub not connected")]
    NotConnected,

    /// A sync wait is already live. Issuing a second command before the
    /// first resolves is a caller bug.
    #[error("sync rendezvous already in flight")]
    SyncInFlight,

    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

/// Result of one `poll_response` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Still waiting; keep the CPU stalled and keep pumping.
    Pending,
    /// The next response byte, and whether another will follow.
    Ready { byte: u8, more: bool },
    /// The deadline passed; the sync slot has been cleared.
    Timeout,
}

/// Hub-initiated events the front-end must surface to the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    SpeedChange { baud: u32 },
    Motor { on: bool },
    Proceed { on: bool },
    Interrupt { on: bool },
    Reset { cold: bool },
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bound on the command sync rendezvous.
    pub response_timeout: Duration,
    /// Bound on the data-phase rendezvous after a write frame.
    pub read_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(2000),
            read_timeout: Duration::from_millis(500),
            connection: ConnectionConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

/// The rendezvous between an outgoing sync-stamped message and its
/// `SyncResponse`. At most one is live at a time.
#[derive(Debug, Clone, Copy)]
struct SyncSlot {
    sync: u8,
    deadline: Instant,
}

/// Per-command scratch buffer the emulator drains through `get_byte`:
/// the ack byte first, then data bytes in arrival order, then the
/// synthetic completion byte on success.
#[derive(Debug, Default)]
struct ResponseBuffer {
    data: Vec<u8>,
    read_pos: usize,
    ready: bool,
    /// True from command start until the front-end finishes the
    /// transaction; gates the append path.
    active: bool,
    final_status: Option<SioStatus>,
    write_size: u16,
    completion_sent: bool,
}

impl ResponseBuffer {
    fn begin(&mut self) {
        self.data.clear();
        self.read_pos = 0;
        self.ready = false;
        self.active = true;
        self.final_status = None;
        self.write_size = 0;
        self.completion_sent = false;
    }

    fn deactivate(&mut self) {
        self.active = false;
        self.ready = false;
    }

    /// The sync response arrived: record the verdict and seed the buffer
    /// with the ack byte.
    fn accept(&mut self, status: SioStatus, ack_byte: u8, write_size: u16) {
        self.final_status = Some(status);
        self.write_size = write_size;
        self.push(ack_byte);
        self.ready = true;
    }

    fn push(&mut self, byte: u8) {
        if self.data.len() >= MAX_RESPONSE {
            warn!("response buffer full, dropping byte");
            return;
        }
        self.data.push(byte);
    }

    fn extend(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }

    fn drained(&self) -> bool {
        self.read_pos == self.data.len()
    }
}

/// The NetSIO bridge proper.
pub struct NetSioBridge<T: Transport> {
    transport: T,
    conn: ConnectionManager,
    sync: SyncCounter,
    pending: Option<SyncSlot>,
    response: ResponseBuffer,
    config: BridgeConfig,
}

impl<T: Transport> NetSioBridge<T> {
    pub fn new(transport: T, config: BridgeConfig) -> NetSioBridge<T> {
        let conn = ConnectionManager::new(config.connection.clone());
        NetSioBridge {
            transport,
            conn,
            sync: SyncCounter::new(),
            pending: None,
            response: ResponseBuffer::default(),
            config,
        }
    }

    /// Open the link. In stream mode the TCP handshake is the connect
    /// event; in datagram mode a pre-configured hub gets a
    /// `DeviceConnect` registration and the handshake completes when it
    /// pings us.
    pub fn start(&mut self, now: Instant) -> Result<(), BridgeError> {
        self.transport.open()?;
        match self.transport.mode() {
            LinkMode::Stream => self.conn.on_stream_connected(self.transport.peer(), now),
            LinkMode::Datagram => {
                if self.transport.peer().is_some() {
                    self.transport.send(&Message::DeviceConnect)?;
                }
            }
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn send_credits(&self) -> u16 {
        self.conn.send_credits()
    }

    pub fn sync_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn response_ready(&self) -> bool {
        self.response.ready
    }

    pub fn response_status(&self) -> Option<SioStatus> {
        self.response.final_status
    }

    /// Host-to-device byte count requested by the hub's sync reply.
    pub fn response_write_size(&self) -> u16 {
        self.response.write_size
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    /// Send one SIO command frame as a NetSIO sequence. Returns the sync
    /// counter value the hub will echo. `payload` carries host-to-device
    /// bytes already known at command time, if any.
    pub fn begin_command(
        &mut self,
        frame: &CommandFrame,
        payload: Option<&[u8]>,
        now: Instant,
    ) -> Result<u8, BridgeError> {
        if self.pending.is_some() {
            debug_assert!(false, "command issued while a sync wait is live");
            return Err(BridgeError::SyncInFlight);
        }
        if !self.conn.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        if !self.conn.has_credit() {
            return Err(BridgeError::Backpressure);
        }

        self.response.begin();
        let sync = self.sync.next();
        self.send(&Message::CommandOn {
            device: frame.device,
        })?;
        self.send(&Message::DataBlock {
            data: Bytes::copy_from_slice(&[frame.command, frame.aux1, frame.aux2]),
        })?;
        if let Some(data) = payload {
            self.send(&Message::DataBlock {
                data: Bytes::copy_from_slice(data),
            })?;
        }
        self.send(&Message::CommandOffSync { sync })?;
        self.pending = Some(SyncSlot {
            sync,
            deadline: now + self.config.response_timeout,
        });
        debug!(
            sync,
            device = frame.device,
            command = frame.command,
            "command frame forwarded"
        );
        Ok(sync)
    }

    /// Forward a host-to-device data frame (payload plus its trailing
    /// checksum byte). The checksum byte travels with the sync stamp so
    /// the hub's ack covers the whole frame; the data-phase read timeout
    /// bounds the wait.
    pub fn send_write_frame(&mut self, data: &[u8], now: Instant) -> Result<u8, BridgeError> {
        if self.pending.is_some() {
            debug_assert!(false, "write frame issued while a sync wait is live");
            return Err(BridgeError::SyncInFlight);
        }
        if !self.conn.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        if !self.conn.has_credit() {
            return Err(BridgeError::Backpressure);
        }
        let (body, last) = match data.split_last() {
            Some((last, body)) => (body, *last),
            None => return Err(BridgeError::Protocol("empty write frame")),
        };

        self.response.begin();
        let sync = self.sync.next();
        if !body.is_empty() {
            self.send(&Message::DataBlock {
                data: Bytes::copy_from_slice(body),
            })?;
        }
        self.send(&Message::DataByteSync { sync, byte: last })?;
        self.pending = Some(SyncSlot {
            sync,
            deadline: now + self.config.read_timeout,
        });
        debug!(sync, len = data.len(), "write frame forwarded");
        Ok(sync)
    }

    /// Drain incoming messages and the connection manager's clock.
    /// Returns hub-initiated events for the front-end to surface.
    pub fn tick(&mut self, now: Instant) -> Vec<BusEvent> {
        let mut events = Vec::new();
        self.pump(now, &mut events);

        if self.conn.tick(now) {
            self.fail_pending(now);
        }
        self.flush_outbox();

        if self.transport.mode() == LinkMode::Stream
            && !self.conn.is_connected()
            && self.conn.should_reconnect(now)
        {
            match self.transport.reconnect() {
                Ok(()) => self.conn.on_stream_connected(self.transport.peer(), now),
                Err(e) => debug!(error = %e, "reconnect attempt failed"),
            }
        }
        events
    }

    fn pump(&mut self, now: Instant, events: &mut Vec<BusEvent>) {
        loop {
            match self.transport.poll() {
                Ok(Some(msg)) => {
                    if let Some(event) = self.on_incoming(msg, now) {
                        events.push(event);
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "link lost");
                    self.on_link_lost(now);
                    break;
                }
                Err(e) => {
                    // Framing trouble discards one message, not the session.
                    warn!(error = %e, "malformed message discarded");
                }
            }
        }
        self.flush_outbox();
    }

    /// Dispatch one incoming message.
    pub fn on_incoming(&mut self, msg: Message, now: Instant) -> Option<BusEvent> {
        match self.conn.on_incoming(&msg, self.transport.peer(), now) {
            Handled::Consumed => return None,
            Handled::PeerDisconnected => {
                self.fail_pending(now);
                return None;
            }
            Handled::NotManagement => {}
        }

        match msg {
            Message::SyncResponse { sync, reply } => {
                match self.pending {
                    Some(slot) if slot.sync == sync => {
                        self.pending = None;
                        match reply {
                            Some(r) => {
                                let status = SioStatus::from_ack_type(r.ack_type);
                                self.response.accept(status, r.ack_byte, r.write_size);
                                debug!(sync, ?status, "sync response accepted");
                            }
                            None => {
                                // Empty sync response: no device answered.
                                self.response.accept(SioStatus::Error, ERROR, 0);
                                debug!(sync, "empty sync response, no device answered");
                            }
                        }
                    }
                    Some(slot) => {
                        warn!(got = sync, want = slot.sync, "mismatched sync response dropped")
                    }
                    None => warn!(sync, "stray sync response dropped"),
                }
                None
            }
            Message::DataByte { byte } => {
                if self.response.active {
                    self.response.push(byte);
                } else {
                    warn!(byte, "data byte with no transaction in flight");
                }
                None
            }
            Message::DataBlock { data } => {
                if self.response.active {
                    self.response.extend(&data);
                } else {
                    warn!(len = data.len(), "data block with no transaction in flight");
                }
                None
            }
            Message::SpeedChange { baud } => Some(BusEvent::SpeedChange { baud }),
            Message::MotorOn => Some(BusEvent::Motor { on: true }),
            Message::MotorOff => Some(BusEvent::Motor { on: false }),
            Message::ProceedOn => Some(BusEvent::Proceed { on: true }),
            Message::ProceedOff => Some(BusEvent::Proceed { on: false }),
            Message::InterruptOn => Some(BusEvent::Interrupt { on: true }),
            Message::InterruptOff => Some(BusEvent::Interrupt { on: false }),
            Message::WarmReset => Some(BusEvent::Reset { cold: false }),
            Message::ColdReset => Some(BusEvent::Reset { cold: true }),
            other => {
                // Emulator-to-hub opcodes have no business arriving here.
                warn!(opcode = ?other.opcode(), "unexpected opcode dropped");
                None
            }
        }
    }

    /// Next response byte for the front-end's `get_byte` path.
    pub fn poll_response(&mut self, now: Instant) -> PollOutcome {
        if let Some(slot) = self.pending {
            if now >= slot.deadline {
                warn!(sync = slot.sync, "sync rendezvous timed out");
                self.pending = None;
                self.response.deactivate();
                return PollOutcome::Timeout;
            }
            return PollOutcome::Pending;
        }

        if !self.response.ready {
            return PollOutcome::Pending;
        }
        if !self.response.drained() {
            let byte = self.response.data[self.response.read_pos];
            self.response.read_pos += 1;
            let more = !self.response.drained()
                || (self.response.final_status == Some(SioStatus::Complete)
                    && !self.response.completion_sent);
            return PollOutcome::Ready { byte, more };
        }
        if self.response.final_status == Some(SioStatus::Complete)
            && !self.response.completion_sent
        {
            self.response.completion_sent = true;
            return PollOutcome::Ready {
                byte: COMPLETE,
                more: false,
            };
        }
        PollOutcome::Pending
    }

    /// The front-end finished (or abandoned) the current transaction.
    pub fn finish_command(&mut self) {
        self.pending = None;
        self.response.deactivate();
    }

    fn send(&mut self, msg: &Message) -> Result<(), BridgeError> {
        if msg.consumes_credit() {
            if !self.conn.has_credit() {
                return Err(BridgeError::Backpressure);
            }
            self.conn.consume_credit();
        }
        self.transport.send(msg).map_err(BridgeError::from)
    }

    fn flush_outbox(&mut self) {
        for msg in self.conn.drain_outbox() {
            if let Err(e) = self.transport.send(&msg) {
                warn!(error = %e, "dropped reaction message");
            }
        }
    }

    /// A live sync wait just became unanswerable: fail it as an error
    /// the front-end will read.
    fn fail_pending(&mut self, _now: Instant) {
        if self.pending.take().is_some() || self.response.active {
            self.response.begin();
            self.response.accept(SioStatus::Error, ERROR, 0);
        }
    }

    fn on_link_lost(&mut self, now: Instant) {
        self.conn.state.connected = false;
        self.conn.state.send_credits = 0;
        self.fail_pending(now);
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
