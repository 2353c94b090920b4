pub mod bridge;
pub mod codec;
pub mod connection;
pub mod sio;
pub mod transport;


// Re-export the emulator-facing API for direct access
pub use bridge::{BridgeConfig, BridgeError, BusEvent, NetSioBridge, PollOutcome};
pub use codec::{CodecError, Message, Opcode, SyncCounter, SyncReply, MAX_PAYLOAD};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use sio::{sio_checksum, CommandFrame, HostBus, Registers, SioPort, SioStatus};
pub use transport::{
    LinkMode, TcpTransport, Transport, TransportError, UdpTransport, DEFAULT_TCP_PORT,
    DEFAULT_UDP_PORT,
};

/// Couples an Atari 8-bit emulator's SIO bus emulation to a FujiNet
/// peripheral hub over a network link, so remote peripherals appear to
/// the emulated CPU as locally attached SIO devices.
///
/// The emulator owns one [`SioPort`] per machine and drives it from
/// three places: the CPU's serial register accesses (`put_byte` /
/// `get_byte`), the frame tick (`tick`), and an implementation of
/// [`HostBus`] that supplies IRQ scheduling and the CPU stall line.
///
/// # Example
///
/// ```rust,no_run
/// use netsio::{BridgeConfig, HostBus, NetSioBridge, SioPort, UdpTransport};
/// use std::time::Instant;
///
/// struct Machine;
///
/// impl HostBus for Machine {
///     fn schedule_serial_irq(&mut self, _cycles: u32) { /* POKEY timer */ }
///     fn set_cpu_stall(&mut self, _stalled: bool) { /* checked between fetches */ }
/// }
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = UdpTransport::new(
///         "0.0.0.0:0".parse()?,
///         Some("127.0.0.1:9997".parse()?),
///     );
///     let bridge = NetSioBridge::new(transport, BridgeConfig::default());
///     let mut port = SioPort::new(bridge);
///     let mut machine = Machine;
///
///     port.start(Instant::now())?;
///     loop {
///         port.tick(&mut machine, Instant::now());
///         // ... emulate one frame; CPU calls port.put_byte / port.get_byte
///     }
/// }
/// ```
pub type Result<T> = std::result::Result<T, BridgeError>;
