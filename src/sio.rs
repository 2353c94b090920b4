// ABOUTME: SIO bus front-end: the state machine the emulated CPU talks to
// ABOUTME: Assembles command frames from put_byte, serves responses via get_byte, paces serial IRQs

use crate::bridge::{BridgeError, BusEvent, NetSioBridge, PollOutcome};
use crate::transport::Transport;
use std::time::Instant;
use tracing::{debug, warn};

/// SIO ack/status bytes as they appear on the bus.
pub const ACK: u8 = b'A';
pub const COMPLETE: u8 = b'C';
pub const NAK: u8 = b'N';
pub const ERROR: u8 = b'E';

/// Recognized device ranges.
pub const DEVICE_DISK_FIRST: u8 = 0x31;
pub const DEVICE_DISK_LAST: u8 = 0x38;
pub const DEVICE_CASSETTE: u8 = 0x60;
pub const DEVICE_FUJINET: u8 = 0x70;

/// NTSC machine clock.
pub const MACHINE_CYCLES_PER_SEC: u32 = 1_789_773;

/// Standard SIO rate; a `SpeedChange` from the hub reprograms it.
pub const STANDARD_BAUD: u32 = 19_200;

/// Lead-in between the ack leaving the device and the first SERIN IRQ.
const ACK_TO_SERIN_CYCLES: u32 = 1_500;

/// Cycles to shift one 10-bit serial frame at the given rate.
pub fn byte_cycles(baud: u32) -> u32 {
    if baud == 0 {
        return MACHINE_CYCLES_PER_SEC;
    }
    (MACHINE_CYCLES_PER_SEC / baud).saturating_mul(10)
}

/// SIO checksum: fold the 16-bit sum back into a byte twice, so the
/// carry of the first fold is absorbed by the second.
pub fn sio_checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| u32::from(b)).sum();
    let fold = |s: u32| (s & 0xFF) + (s >> 8);
    fold(fold(sum)) as u8
}

/// The five-byte SIO command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub device: u8,
    pub command: u8,
    pub aux1: u8,
    pub aux2: u8,
    pub checksum: u8,
}

impl CommandFrame {
    pub fn from_bytes(bytes: [u8; 5]) -> CommandFrame {
        CommandFrame {
            device: bytes[0],
            command: bytes[1],
            aux1: bytes[2],
            aux2: bytes[3],
            checksum: bytes[4],
        }
    }

    pub fn checksum_ok(&self) -> bool {
        sio_checksum(&[self.device, self.command, self.aux1, self.aux2]) == self.checksum
    }

    /// Frames addressed outside these ranges are ignored entirely; some
    /// other bus handler owns them.
    pub fn device_recognized(&self) -> bool {
        matches!(self.device, DEVICE_DISK_FIRST..=DEVICE_DISK_LAST)
            || self.device == DEVICE_CASSETTE
            || self.device == DEVICE_FUJINET
    }
}

/// Outcome of a finished bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SioStatus {
    Complete,
    Nak,
    Error,
    /// No transaction has completed yet, or the command fell through
    /// unhandled.
    Unhandled,
}

impl SioStatus {
    /// Map a `SyncResponse` ack type to a bus status. Hubs disagree on
    /// the encoding: the numeric scheme uses 0x00/0x01, older firmware
    /// sends the ASCII complete byte. Both complete spellings are
    /// accepted; every other value is an error.
    pub fn from_ack_type(ack_type: u8) -> SioStatus {
        match ack_type {
            0x00 | 0x43 => SioStatus::Complete,
            0x01 => SioStatus::Nak,
            _ => SioStatus::Error,
        }
    }

    /// CPU register state the OS interrupt vector reads at end of
    /// command.
    pub fn registers(self) -> Registers {
        match self {
            SioStatus::Complete => Registers {
                y: 1,
                carry: true,
                negative: false,
            },
            SioStatus::Nak => Registers {
                y: 139,
                carry: false,
                negative: true,
            },
            SioStatus::Error => Registers {
                y: 144,
                carry: false,
                negative: true,
            },
            SioStatus::Unhandled => Registers {
                y: 146,
                carry: false,
                negative: true,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub y: u8,
    pub carry: bool,
    pub negative: bool,
}

/// The emulator-side seams. The front-end talks to the machine only
/// through this trait: IRQ scheduling, the CPU stall line, and the
/// outbound line-state callbacks, so the bus module never calls back
/// into emulator internals.
pub trait HostBus {
    /// Request a serial-input IRQ this many machine cycles from now.
    fn schedule_serial_irq(&mut self, cycles: u32);

    /// Assert or release the flag the CPU checks between instruction
    /// fetches.
    fn set_cpu_stall(&mut self, stalled: bool);

    fn on_speed_change(&mut self, _baud: u32) {}
    fn on_motor(&mut self, _on: bool) {}
    fn on_proceed(&mut self, _on: bool) {}
    fn on_interrupt(&mut self, _on: bool) {}
    fn on_reset(&mut self, _cold: bool) {}
}

/// Bus front-end states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusState {
    Idle,
    /// Accumulating the five command-frame bytes.
    CommandFrame,
    /// Command forwarded; waiting on the hub's ack.
    WaitAck,
    /// Serving response bytes to the CPU.
    DataToHost,
    /// Collecting a host-to-device data frame from the CPU.
    DataFromHost,
    /// Waiting for / serving the final status of a write frame.
    FinalStatus,
}

/// The SIO bus as the emulated CPU sees it.
///
/// `put_byte` is the CPU's serial output register write, `get_byte` its
/// serial input register read, and `tick` runs once per emulator frame
/// to pump the network side.
pub struct SioPort<T: Transport> {
    bridge: NetSioBridge<T>,
    state: BusState,
    frame: [u8; 5],
    frame_len: usize,
    write_buf: Vec<u8>,
    write_expected: usize,
    baud: u32,
    /// A locally generated reply byte (NAK on backpressure, error on a
    /// dead link) served ahead of anything from the bridge.
    local_reply: Option<u8>,
    last_status: SioStatus,
    irq_armed: bool,
}

impl<T: Transport> SioPort<T> {
    pub fn new(bridge: NetSioBridge<T>) -> SioPort<T> {
        SioPort {
            bridge,
            state: BusState::Idle,
            frame: [0; 5],
            frame_len: 0,
            write_buf: Vec::new(),
            write_expected: 0,
            baud: STANDARD_BAUD,
            local_reply: None,
            last_status: SioStatus::Unhandled,
            irq_armed: false,
        }
    }

    pub fn start(&mut self, now: Instant) -> Result<(), BridgeError> {
        self.bridge.start(now)
    }

    pub fn bridge(&self) -> &NetSioBridge<T> {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut NetSioBridge<T> {
        &mut self.bridge
    }

    /// Register state for the OS interrupt vector at end of command.
    pub fn status_registers(&self) -> Registers {
        self.last_status.registers()
    }

    pub fn is_idle(&self) -> bool {
        self.state == BusState::Idle
    }

    fn first_byte_cycles(&self) -> u32 {
        ACK_TO_SERIN_CYCLES + byte_cycles(self.baud)
    }

    /// Frame-tick housekeeping: pump the link, surface hub events,
    /// detect sync timeouts, and keep the stall line honest.
    pub fn tick(&mut self, host: &mut dyn HostBus, now: Instant) {
        for event in self.bridge.tick(now) {
            self.handle_event(host, event);
        }

        // A hub that never answers must not stall the CPU forever.
        if self.bridge.sync_pending() {
            if let PollOutcome::Timeout = self.bridge.poll_response(now) {
                debug!("sync wait expired, failing transaction");
                self.local_reply = Some(ERROR);
                self.last_status = SioStatus::Error;
                host.schedule_serial_irq(self.first_byte_cycles());
            }
        }

        // First response byte became available: arm the SERIN IRQ once.
        if matches!(self.state, BusState::WaitAck | BusState::FinalStatus)
            && self.bridge.response_ready()
            && !self.irq_armed
        {
            host.schedule_serial_irq(self.first_byte_cycles());
            self.irq_armed = true;
        }

        host.set_cpu_stall(self.bridge.sync_pending());
    }

    fn handle_event(&mut self, host: &mut dyn HostBus, event: BusEvent) {
        match event {
            BusEvent::SpeedChange { baud } => {
                debug!(baud, "bus speed reprogrammed");
                self.baud = baud;
                host.on_speed_change(baud);
            }
            BusEvent::Motor { on } => host.on_motor(on),
            BusEvent::Proceed { on } => host.on_proceed(on),
            BusEvent::Interrupt { on } => host.on_interrupt(on),
            BusEvent::Reset { cold } => {
                self.reset(host);
                host.on_reset(cold);
            }
        }
    }

    /// Return the bus to idle, abandoning any transaction in flight.
    pub fn reset(&mut self, host: &mut dyn HostBus) {
        self.state = BusState::Idle;
        self.frame_len = 0;
        self.write_buf.clear();
        self.local_reply = None;
        self.baud = STANDARD_BAUD;
        self.bridge.finish_command();
        host.set_cpu_stall(false);
    }

    /// CPU serial output register write.
    pub fn put_byte(&mut self, host: &mut dyn HostBus, byte: u8, now: Instant) {
        match self.state {
            BusState::DataFromHost => {
                self.write_buf.push(byte);
                if self.write_buf.len() == self.write_expected {
                    self.forward_write_frame(host, now);
                }
            }
            BusState::Idle | BusState::CommandFrame => {
                self.accumulate_command_byte(host, byte, now);
            }
            _ => {
                // A new command frame aborts whatever was in progress.
                debug!(state = ?self.state, "command byte aborts active transaction");
                self.bridge.finish_command();
                self.state = BusState::Idle;
                self.frame_len = 0;
                self.accumulate_command_byte(host, byte, now);
            }
        }
    }

    fn accumulate_command_byte(&mut self, host: &mut dyn HostBus, byte: u8, now: Instant) {
        self.state = BusState::CommandFrame;
        self.frame[self.frame_len] = byte;
        self.frame_len += 1;
        if self.frame_len < 5 {
            return;
        }
        self.frame_len = 0;
        let frame = CommandFrame::from_bytes(self.frame);
        self.handle_command_frame(host, &frame, now);
    }

    fn handle_command_frame(
        &mut self,
        host: &mut dyn HostBus,
        frame: &CommandFrame,
        now: Instant,
    ) {
        if !frame.device_recognized() {
            self.state = BusState::Idle;
            return;
        }
        if !frame.checksum_ok() {
            warn!(
                device = frame.device,
                command = frame.command,
                "command frame checksum mismatch"
            );
            self.last_status = SioStatus::Error;
            self.state = BusState::Idle;
            return;
        }

        match self.bridge.begin_command(frame, None, now) {
            Ok(_) => {
                self.state = BusState::WaitAck;
                self.irq_armed = false;
                host.set_cpu_stall(true);
            }
            Err(BridgeError::Backpressure) => {
                debug!(device = frame.device, "send window exhausted, local NAK");
                self.local_reply = Some(NAK);
                self.last_status = SioStatus::Nak;
                self.state = BusState::WaitAck;
                host.schedule_serial_irq(self.first_byte_cycles());
            }
            Err(e) => {
                warn!(error = %e, device = frame.device, "command not forwarded");
                self.local_reply = Some(ERROR);
                self.last_status = SioStatus::Error;
                self.state = BusState::WaitAck;
                host.schedule_serial_irq(self.first_byte_cycles());
            }
        }
    }

    fn forward_write_frame(&mut self, host: &mut dyn HostBus, now: Instant) {
        let data = std::mem::take(&mut self.write_buf);
        match self.bridge.send_write_frame(&data, now) {
            Ok(_) => {
                self.state = BusState::FinalStatus;
                self.irq_armed = false;
                host.set_cpu_stall(true);
            }
            Err(BridgeError::Backpressure) => {
                self.local_reply = Some(NAK);
                self.last_status = SioStatus::Nak;
                self.state = BusState::FinalStatus;
                host.schedule_serial_irq(self.first_byte_cycles());
            }
            Err(e) => {
                warn!(error = %e, "write frame not forwarded");
                self.local_reply = Some(ERROR);
                self.last_status = SioStatus::Error;
                self.state = BusState::FinalStatus;
                host.schedule_serial_irq(self.first_byte_cycles());
            }
        }
    }

    /// CPU serial input register read.
    pub fn get_byte(&mut self, host: &mut dyn HostBus, now: Instant) -> Option<u8> {
        if let Some(byte) = self.local_reply.take() {
            self.end_transaction(host, self.last_status);
            return Some(byte);
        }

        match self.state {
            BusState::WaitAck => self.serve_ack(host, now),
            BusState::DataToHost => self.serve_data(host, now),
            BusState::FinalStatus => self.serve_final(host, now),
            _ => None,
        }
    }

    fn serve_ack(&mut self, host: &mut dyn HostBus, now: Instant) -> Option<u8> {
        match self.bridge.poll_response(now) {
            PollOutcome::Pending => {
                host.set_cpu_stall(self.bridge.sync_pending());
                None
            }
            PollOutcome::Timeout => {
                self.end_transaction(host, SioStatus::Error);
                Some(ERROR)
            }
            PollOutcome::Ready { byte, .. } => {
                host.set_cpu_stall(false);
                match self.bridge.response_status() {
                    Some(SioStatus::Complete) => {
                        if self.bridge.response_write_size() > 0 {
                            // The hub wants a data frame from the host next.
                            self.write_expected =
                                usize::from(self.bridge.response_write_size()) + 1;
                            self.write_buf.clear();
                            self.state = BusState::DataFromHost;
                        } else {
                            self.state = BusState::DataToHost;
                            host.schedule_serial_irq(byte_cycles(self.baud));
                        }
                        Some(byte)
                    }
                    Some(status) => {
                        self.end_transaction(host, status);
                        Some(byte)
                    }
                    None => None,
                }
            }
        }
    }

    fn serve_data(&mut self, host: &mut dyn HostBus, now: Instant) -> Option<u8> {
        match self.bridge.poll_response(now) {
            PollOutcome::Ready { byte, more } => {
                if more {
                    host.schedule_serial_irq(byte_cycles(self.baud));
                } else {
                    // A disconnect mid-phase replaces the buffer with an
                    // error verdict; honor whatever the bridge recorded.
                    let status = self
                        .bridge
                        .response_status()
                        .unwrap_or(SioStatus::Complete);
                    self.end_transaction(host, status);
                }
                Some(byte)
            }
            PollOutcome::Timeout => {
                self.end_transaction(host, SioStatus::Error);
                Some(ERROR)
            }
            PollOutcome::Pending => None,
        }
    }

    fn serve_final(&mut self, host: &mut dyn HostBus, now: Instant) -> Option<u8> {
        match self.bridge.poll_response(now) {
            PollOutcome::Pending => {
                host.set_cpu_stall(self.bridge.sync_pending());
                None
            }
            PollOutcome::Timeout => {
                self.end_transaction(host, SioStatus::Error);
                Some(ERROR)
            }
            PollOutcome::Ready { byte, .. } => {
                let status = self
                    .bridge
                    .response_status()
                    .unwrap_or(SioStatus::Error);
                self.end_transaction(host, status);
                Some(byte)
            }
        }
    }

    fn end_transaction(&mut self, host: &mut dyn HostBus, status: SioStatus) {
        self.last_status = status;
        self.state = BusState::Idle;
        self.bridge.finish_command();
        host.set_cpu_stall(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_known_frames() {
        // Disk 1 STATUS.
        assert_eq!(sio_checksum(&[0x31, 0x53, 0x00, 0x00]), 0x84);
        // All-zero frame.
        assert_eq!(sio_checksum(&[0, 0, 0, 0]), 0);
        // Sum with carry folds back in.
        assert_eq!(sio_checksum(&[0xFF, 0xFF, 0xFF, 0xFF]), 0xFF);
        assert_eq!(sio_checksum(&[0xFF, 0x01, 0x00, 0x00]), 0x01);
    }

    #[test]
    fn checksum_is_pure() {
        let frame = [0x70, 0x4E, 0x12, 0x34];
        assert_eq!(sio_checksum(&frame), sio_checksum(&frame));
    }

    #[test]
    fn command_frame_checksum_validation() {
        let good = CommandFrame::from_bytes([0x31, 0x53, 0x00, 0x00, 0x84]);
        assert!(good.checksum_ok());
        let bad = CommandFrame::from_bytes([0x31, 0x53, 0x00, 0x00, 0x85]);
        assert!(!bad.checksum_ok());
    }

    #[test]
    fn device_ranges() {
        for device in 0x31..=0x38u8 {
            let frame = CommandFrame::from_bytes([device, 0x53, 0, 0, 0]);
            assert!(frame.device_recognized(), "disk {device:#x}");
        }
        assert!(CommandFrame::from_bytes([0x60, 0, 0, 0, 0]).device_recognized());
        assert!(CommandFrame::from_bytes([0x70, 0, 0, 0, 0]).device_recognized());
        assert!(!CommandFrame::from_bytes([0x30, 0, 0, 0, 0]).device_recognized());
        assert!(!CommandFrame::from_bytes([0x39, 0, 0, 0, 0]).device_recognized());
        assert!(!CommandFrame::from_bytes([0x50, 0, 0, 0, 0]).device_recognized());
    }

    #[test]
    fn ack_type_mapping() {
        assert_eq!(SioStatus::from_ack_type(0x00), SioStatus::Complete);
        assert_eq!(SioStatus::from_ack_type(0x43), SioStatus::Complete);
        assert_eq!(SioStatus::from_ack_type(0x01), SioStatus::Nak);
        assert_eq!(SioStatus::from_ack_type(0x4E), SioStatus::Error);
        assert_eq!(SioStatus::from_ack_type(0x45), SioStatus::Error);
    }

    #[test]
    fn register_convention() {
        let ok = SioStatus::Complete.registers();
        assert_eq!((ok.y, ok.carry, ok.negative), (1, true, false));
        let nak = SioStatus::Nak.registers();
        assert_eq!((nak.y, nak.negative), (139, true));
        let err = SioStatus::Error.registers();
        assert_eq!((err.y, err.negative), (144, true));
        let unhandled = SioStatus::Unhandled.registers();
        assert_eq!((unhandled.y, unhandled.negative), (146, true));
    }

    #[test]
    fn serial_timing_tracks_the_divisor() {
        let standard = byte_cycles(STANDARD_BAUD);
        assert_eq!(standard, 930);
        // Faster rate, shorter frames.
        assert!(byte_cycles(68_266) < standard);
        // Degenerate rate must not divide by zero.
        assert_eq!(byte_cycles(0), MACHINE_CYCLES_PER_SEC);
    }
}
