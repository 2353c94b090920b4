// NetSIO Codec - wire representation of hub/emulator bus events
//
// This module owns everything about the byte-level protocol: the opcode
// table, the `Message` type, and the two framings a hub may speak
// (one-message-per-UDP-datagram, and the length-prefixed Altirra stream
// format used over TCP). The transport layer moves framed bytes; the
// bridge deals only in `Message` values.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use std::io::Cursor;
use thiserror::Error;

/// Largest payload a single NetSIO message may carry.
pub const MAX_PAYLOAD: usize = 512;

/// Datagram header: kind, parameter, payload_len (LE16).
pub const DGRAM_HEADER: usize = 4;

/// Altirra stream header: total_length (LE32) + timestamp (LE32).
pub const STREAM_HEADER: usize = 8;

/// Smallest valid Altirra frame: header + kind + parameter.
pub const STREAM_MIN_FRAME: usize = STREAM_HEADER + 2;

/// Largest valid Altirra frame accepted on receive.
pub const STREAM_MAX_FRAME: usize = 1024 + STREAM_HEADER;

/// NetSIO opcodes.
///
/// One byte on the wire; the `parameter` byte that follows it is
/// opcode-dependent. Values in 0xC0..=0xC7 are connection-management
/// opcodes consumed by the connection manager rather than the bridge.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    DataByte = 0x01,
    DataBlock = 0x02,
    DataByteSync = 0x09,
    CommandOff = 0x10,
    CommandOn = 0x11,
    CommandOffSync = 0x18,
    MotorOff = 0x20,
    MotorOn = 0x21,
    ProceedOff = 0x30,
    ProceedOn = 0x31,
    InterruptOff = 0x40,
    InterruptOn = 0x41,
    SpeedChange = 0x80,
    SyncResponse = 0x81,
    DeviceDisconnect = 0xC0,
    DeviceConnect = 0xC1,
    PingRequest = 0xC2,
    PingResponse = 0xC3,
    AliveRequest = 0xC4,
    AliveResponse = 0xC5,
    CreditStatus = 0xC6,
    CreditUpdate = 0xC7,
    WarmReset = 0xFE,
    ColdReset = 0xFF,
}

impl Opcode {
    /// Connection-management opcodes are handled by the connection
    /// manager before the bridge sees them.
    pub fn is_management(self) -> bool {
        matches!(
            self,
            Opcode::DeviceDisconnect
                | Opcode::DeviceConnect
                | Opcode::PingRequest
                | Opcode::PingResponse
                | Opcode::AliveRequest
                | Opcode::AliveResponse
                | Opcode::CreditStatus
                | Opcode::CreditUpdate
        )
    }
}

/// The non-empty body of a `SyncResponse`.
///
/// An empty sync response (no payload at all) is the hub's way of saying
/// no device answered the command; it decodes to `None` on the
/// `SyncResponse` variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncReply {
    pub ack_type: u8,
    pub ack_byte: u8,
    /// Number of host-to-device bytes the hub expects next, 0 if none.
    pub write_size: u16,
}

/// A single NetSIO message, either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    DataByte { byte: u8 },
    DataBlock { data: Bytes },
    DataByteSync { sync: u8, byte: u8 },
    CommandOff,
    CommandOn { device: u8 },
    CommandOffSync { sync: u8 },
    MotorOff,
    MotorOn,
    ProceedOff,
    ProceedOn,
    InterruptOff,
    InterruptOn,
    SpeedChange { baud: u32 },
    SyncResponse { sync: u8, reply: Option<SyncReply> },
    DeviceDisconnect,
    DeviceConnect,
    PingRequest,
    PingResponse,
    AliveRequest,
    AliveResponse,
    CreditStatus,
    CreditUpdate { credits: u16 },
    WarmReset,
    ColdReset,
}

#[derive(Debug, Error)]
pub enum CodecError {
    /// Not enough buffered data for a complete frame. Expected at
    /// runtime on stream transports; never fatal.
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("payload length {0} exceeds maximum of {MAX_PAYLOAD}")]
    PayloadTooLarge(usize),

    #[error("malformed frame: {0}")]
    Framing(&'static str),

    #[error("declared frame length {length} outside {min}..={max}")]
    FrameLength { length: usize, min: usize, max: usize },
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::DataByte { .. } => Opcode::DataByte,
            Message::DataBlock { .. } => Opcode::DataBlock,
            Message::DataByteSync { .. } => Opcode::DataByteSync,
            Message::CommandOff => Opcode::CommandOff,
            Message::CommandOn { .. } => Opcode::CommandOn,
            Message::CommandOffSync { .. } => Opcode::CommandOffSync,
            Message::MotorOff => Opcode::MotorOff,
            Message::MotorOn => Opcode::MotorOn,
            Message::ProceedOff => Opcode::ProceedOff,
            Message::ProceedOn => Opcode::ProceedOn,
            Message::InterruptOff => Opcode::InterruptOff,
            Message::InterruptOn => Opcode::InterruptOn,
            Message::SpeedChange { .. } => Opcode::SpeedChange,
            Message::SyncResponse { .. } => Opcode::SyncResponse,
            Message::DeviceDisconnect => Opcode::DeviceDisconnect,
            Message::DeviceConnect => Opcode::DeviceConnect,
            Message::PingRequest => Opcode::PingRequest,
            Message::PingResponse => Opcode::PingResponse,
            Message::AliveRequest => Opcode::AliveRequest,
            Message::AliveResponse => Opcode::AliveResponse,
            Message::CreditStatus => Opcode::CreditStatus,
            Message::CreditUpdate { .. } => Opcode::CreditUpdate,
            Message::WarmReset => Opcode::WarmReset,
            Message::ColdReset => Opcode::ColdReset,
        }
    }

    /// True for messages that cost one send credit: those stamped with a
    /// sync number the hub must answer. Everything else (handshake
    /// replies, keepalive, the command envelope itself) is free, which
    /// makes one command cost exactly one credit.
    pub fn consumes_credit(&self) -> bool {
        matches!(
            self,
            Message::CommandOffSync { .. } | Message::DataByteSync { .. }
        )
    }

    /// The `parameter` header byte for this message.
    fn parameter(&self) -> u8 {
        match self {
            Message::DataByte { byte } => *byte,
            Message::DataByteSync { sync, .. } => *sync,
            Message::CommandOn { device } => *device,
            Message::CommandOffSync { sync } => *sync,
            Message::SyncResponse { sync, .. } => *sync,
            Message::CreditUpdate { credits } if *credits <= u8::MAX as u16 => *credits as u8,
            _ => 0,
        }
    }

    /// The payload bytes for this message, if any.
    fn payload(&self) -> Result<Bytes, CodecError> {
        let payload = match self {
            Message::DataBlock { data } => data.clone(),
            Message::DataByteSync { byte, .. } => Bytes::copy_from_slice(&[*byte]),
            Message::SpeedChange { baud } => Bytes::copy_from_slice(&baud.to_le_bytes()),
            Message::SyncResponse { reply: Some(r), .. } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u8(r.ack_type);
                buf.put_u8(r.ack_byte);
                buf.put_u16_le(r.write_size);
                buf.freeze()
            }
            // Counts above a byte travel in the payload; small ones ride
            // in the parameter with an empty payload.
            Message::CreditUpdate { credits } if *credits > u8::MAX as u16 => {
                Bytes::copy_from_slice(&credits.to_le_bytes())
            }
            _ => Bytes::new(),
        };
        if payload.len() > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }
        Ok(payload)
    }

    /// Rebuild a message from its decoded wire parts.
    fn from_parts(opcode: Opcode, parameter: u8, payload: Bytes) -> Result<Message, CodecError> {
        let msg = match opcode {
            Opcode::DataByte => Message::DataByte { byte: parameter },
            Opcode::DataBlock => Message::DataBlock { data: payload },
            Opcode::DataByteSync => {
                if payload.is_empty() {
                    return Err(CodecError::Framing("data byte sync without byte"));
                }
                Message::DataByteSync {
                    sync: parameter,
                    byte: payload[0],
                }
            }
            Opcode::CommandOff => Message::CommandOff,
            Opcode::CommandOn => Message::CommandOn { device: parameter },
            Opcode::CommandOffSync => Message::CommandOffSync { sync: parameter },
            Opcode::MotorOff => Message::MotorOff,
            Opcode::MotorOn => Message::MotorOn,
            Opcode::ProceedOff => Message::ProceedOff,
            Opcode::ProceedOn => Message::ProceedOn,
            Opcode::InterruptOff => Message::InterruptOff,
            Opcode::InterruptOn => Message::InterruptOn,
            Opcode::SpeedChange => {
                if payload.len() < 4 {
                    return Err(CodecError::Framing("speed change payload shorter than 4"));
                }
                Message::SpeedChange {
                    baud: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
                }
            }
            Opcode::SyncResponse => {
                let reply = match payload.len() {
                    0 => None,
                    1 => return Err(CodecError::Framing("sync response payload of one byte")),
                    len => Some(SyncReply {
                        ack_type: payload[0],
                        ack_byte: payload[1],
                        write_size: if len >= 4 {
                            u16::from_le_bytes([payload[2], payload[3]])
                        } else {
                            0
                        },
                    }),
                };
                Message::SyncResponse {
                    sync: parameter,
                    reply,
                }
            }
            Opcode::DeviceDisconnect => Message::DeviceDisconnect,
            Opcode::DeviceConnect => Message::DeviceConnect,
            Opcode::PingRequest => Message::PingRequest,
            Opcode::PingResponse => Message::PingResponse,
            Opcode::AliveRequest => Message::AliveRequest,
            Opcode::AliveResponse => Message::AliveResponse,
            Opcode::CreditStatus => Message::CreditStatus,
            Opcode::CreditUpdate => Message::CreditUpdate {
                // The count may ride in the parameter or a LE16 payload;
                // the payload wins when both are present.
                credits: if payload.len() >= 2 {
                    u16::from_le_bytes([payload[0], payload[1]])
                } else {
                    parameter as u16
                },
            },
            Opcode::WarmReset => Message::WarmReset,
            Opcode::ColdReset => Message::ColdReset,
        };
        Ok(msg)
    }

    /// Encode in datagram framing: kind, parameter, payload_len LE16,
    /// payload. One call produces exactly one datagram's contents.
    pub fn encode_datagram(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = self.payload()?;
        buf.reserve(DGRAM_HEADER + payload.len());
        buf.put_u8(self.opcode() as u8);
        buf.put_u8(self.parameter());
        buf.put_u16_le(payload.len() as u16);
        buf.put_slice(&payload);
        Ok(())
    }

    /// Decode one datagram. Trailing bytes beyond the declared payload
    /// length are ignored.
    pub fn decode_datagram(src: &[u8]) -> Result<Message, CodecError> {
        if src.len() < DGRAM_HEADER {
            return Err(CodecError::Incomplete);
        }
        let opcode =
            Opcode::try_from(src[0]).map_err(|_| CodecError::UnknownOpcode(src[0]))?;
        let parameter = src[1];
        let payload_len = u16::from_le_bytes([src[2], src[3]]) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(payload_len));
        }
        if src.len() < DGRAM_HEADER + payload_len {
            return Err(CodecError::Framing("datagram shorter than declared payload"));
        }
        let payload = Bytes::copy_from_slice(&src[DGRAM_HEADER..DGRAM_HEADER + payload_len]);
        Message::from_parts(opcode, parameter, payload)
    }

    /// Encode in Altirra stream framing: total_length LE32 (includes the
    /// 8-byte header), timestamp LE32, kind, parameter, payload.
    pub fn encode_stream(&self, buf: &mut BytesMut, timestamp: u32) -> Result<(), CodecError> {
        let payload = self.payload()?;
        let total = STREAM_HEADER + 2 + payload.len();
        buf.reserve(total);
        buf.put_u32_le(total as u32);
        buf.put_u32_le(timestamp);
        buf.put_u8(self.opcode() as u8);
        buf.put_u8(self.parameter());
        buf.put_slice(&payload);
        Ok(())
    }

    /// Check whether `src` holds a complete Altirra frame. Returns the
    /// frame's total length without consuming anything, so the caller can
    /// decide whether to parse or wait for more bytes.
    pub fn check_stream(src: &mut Cursor<&[u8]>) -> Result<usize, CodecError> {
        if src.remaining() < 4 {
            return Err(CodecError::Incomplete);
        }
        let start = src.position();
        let total = src.get_u32_le() as usize;
        src.set_position(start);

        if !(STREAM_MIN_FRAME..=STREAM_MAX_FRAME).contains(&total) {
            return Err(CodecError::FrameLength {
                length: total,
                min: STREAM_MIN_FRAME,
                max: STREAM_MAX_FRAME,
            });
        }
        if src.remaining() < total {
            return Err(CodecError::Incomplete);
        }
        Ok(total)
    }

    /// Parse one Altirra frame. The frame must already have been
    /// validated with `check_stream`.
    pub fn parse_stream(src: &mut Cursor<&[u8]>) -> Result<Message, CodecError> {
        let total = Self::check_stream(src)?;
        let _total = src.get_u32_le();
        let _timestamp = src.get_u32_le();
        let kind = src.get_u8();
        let opcode = Opcode::try_from(kind).map_err(|_| CodecError::UnknownOpcode(kind))?;
        let parameter = src.get_u8();
        let payload = src.copy_to_bytes(total - STREAM_MIN_FRAME);
        Message::from_parts(opcode, parameter, payload)
    }
}

/// The sync counter stamped on sync-requiring messages.
///
/// Monotone, wrapping, one per bridge. `next()` hands out the current
/// value and post-increments; 0 is a valid counter value.
#[derive(Debug, Default)]
pub struct SyncCounter {
    value: u8,
}

impl SyncCounter {
    pub fn new() -> SyncCounter {
        SyncCounter::default()
    }

    pub fn next(&mut self) -> u8 {
        let current = self.value;
        self.value = self.value.wrapping_add(1);
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_messages() -> Vec<Message> {
        vec![
            Message::DataByte { byte: 0x55 },
            Message::DataBlock {
                data: Bytes::from_static(&[0x53, 0x00, 0x00]),
            },
            Message::DataByteSync { sync: 7, byte: 0x9A },
            Message::CommandOff,
            Message::CommandOn { device: 0x31 },
            Message::CommandOffSync { sync: 42 },
            Message::MotorOff,
            Message::MotorOn,
            Message::ProceedOff,
            Message::ProceedOn,
            Message::InterruptOff,
            Message::InterruptOn,
            Message::SpeedChange { baud: 68_266 },
            Message::SyncResponse {
                sync: 3,
                reply: Some(SyncReply {
                    ack_type: 0x00,
                    ack_byte: b'A',
                    write_size: 128,
                }),
            },
            Message::SyncResponse {
                sync: 4,
                reply: None,
            },
            Message::DeviceDisconnect,
            Message::DeviceConnect,
            Message::PingRequest,
            Message::PingResponse,
            Message::AliveRequest,
            Message::AliveResponse,
            Message::CreditStatus,
            Message::CreditUpdate { credits: 200 },
            Message::CreditUpdate { credits: 1000 },
            Message::WarmReset,
            Message::ColdReset,
        ]
    }

    #[test]
    fn datagram_roundtrip_all_variants() {
        for msg in all_messages() {
            let mut buf = BytesMut::new();
            msg.encode_datagram(&mut buf).unwrap();
            let decoded = Message::decode_datagram(&buf).unwrap();
            assert_eq!(decoded, msg, "datagram roundtrip for {:?}", msg.opcode());
        }
    }

    #[test]
    fn stream_roundtrip_all_variants() {
        for msg in all_messages() {
            let mut buf = BytesMut::new();
            msg.encode_stream(&mut buf, 0xDEAD_BEEF).unwrap();
            let mut cursor = Cursor::new(&buf[..]);
            let decoded = Message::parse_stream(&mut cursor).unwrap();
            assert_eq!(decoded, msg, "stream roundtrip for {:?}", msg.opcode());
            assert_eq!(cursor.position() as usize, buf.len());
        }
    }

    #[test]
    fn datagram_layout_command_on() {
        let mut buf = BytesMut::new();
        Message::CommandOn { device: 0x31 }
            .encode_datagram(&mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x11, 0x31, 0x00, 0x00]);
    }

    #[test]
    fn datagram_layout_sync_response() {
        let mut buf = BytesMut::new();
        Message::SyncResponse {
            sync: 5,
            reply: Some(SyncReply {
                ack_type: 0x00,
                ack_byte: b'A',
                write_size: 0x0102,
            }),
        }
        .encode_datagram(&mut buf)
        .unwrap();
        assert_eq!(&buf[..], &[0x81, 0x05, 0x04, 0x00, 0x00, 0x41, 0x02, 0x01]);
    }

    #[test]
    fn stream_layout_includes_header_in_length() {
        let mut buf = BytesMut::new();
        Message::DataBlock {
            data: Bytes::from_static(b"abc"),
        }
        .encode_stream(&mut buf, 7)
        .unwrap();
        // 8 header + kind + parameter + 3 payload
        assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 13);
        assert_eq!(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]), 7);
        assert_eq!(buf[8], 0x02);
        assert_eq!(&buf[10..], b"abc");
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let err = Message::decode_datagram(&[0x77, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::UnknownOpcode(0x77)));
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let mut frame = vec![0x02, 0x00];
        frame.extend_from_slice(&((MAX_PAYLOAD + 1) as u16).to_le_bytes());
        frame.extend(std::iter::repeat(0u8).take(MAX_PAYLOAD + 1));
        let err = Message::decode_datagram(&frame).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge(_)));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let msg = Message::DataBlock {
            data: Bytes::from(vec![0u8; MAX_PAYLOAD + 1]),
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            msg.encode_datagram(&mut buf),
            Err(CodecError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        // Declares 4 payload bytes, carries 1.
        let err = Message::decode_datagram(&[0x02, 0x00, 0x04, 0x00, 0xAA]).unwrap_err();
        assert!(matches!(err, CodecError::Framing(_)));
    }

    #[test]
    fn check_stream_incomplete_and_bounds() {
        let mut cursor = Cursor::new(&[0x0Du8, 0x00][..]);
        assert!(matches!(
            Message::check_stream(&mut cursor),
            Err(CodecError::Incomplete)
        ));

        // Declared length below the minimum frame.
        let short = 4u32.to_le_bytes();
        let mut cursor = Cursor::new(&short[..]);
        assert!(matches!(
            Message::check_stream(&mut cursor),
            Err(CodecError::FrameLength { .. })
        ));

        // Declared length above the maximum frame.
        let long = ((STREAM_MAX_FRAME + 1) as u32).to_le_bytes();
        let mut cursor = Cursor::new(&long[..]);
        assert!(matches!(
            Message::check_stream(&mut cursor),
            Err(CodecError::FrameLength { .. })
        ));

        // Valid declared length, partial body.
        let mut partial = BytesMut::new();
        Message::PingRequest.encode_stream(&mut partial, 0).unwrap();
        let mut cursor = Cursor::new(&partial[..partial.len() - 1]);
        assert!(matches!(
            Message::check_stream(&mut cursor),
            Err(CodecError::Incomplete)
        ));
    }

    #[test]
    fn credit_update_parameter_and_payload_forms() {
        // Count in the parameter byte.
        let msg = Message::decode_datagram(&[0xC7, 200, 0x00, 0x00]).unwrap();
        assert_eq!(msg, Message::CreditUpdate { credits: 200 });

        // LE16 payload wins over the parameter.
        let msg = Message::decode_datagram(&[0xC7, 1, 0x02, 0x00, 0xE8, 0x03]).unwrap();
        assert_eq!(msg, Message::CreditUpdate { credits: 1000 });
    }

    #[test]
    fn empty_sync_response_decodes_to_no_reply() {
        let msg = Message::decode_datagram(&[0x81, 9, 0x00, 0x00]).unwrap();
        assert_eq!(
            msg,
            Message::SyncResponse {
                sync: 9,
                reply: None
            }
        );
    }

    #[test]
    fn two_byte_sync_response_defaults_write_size() {
        let msg = Message::decode_datagram(&[0x81, 1, 0x02, 0x00, 0x00, 0x41]).unwrap();
        assert_eq!(
            msg,
            Message::SyncResponse {
                sync: 1,
                reply: Some(SyncReply {
                    ack_type: 0x00,
                    ack_byte: b'A',
                    write_size: 0
                })
            }
        );
    }

    #[test]
    fn credit_consumption_marks_only_synced_sends() {
        assert!(Message::CommandOffSync { sync: 0 }.consumes_credit());
        assert!(Message::DataByteSync { sync: 0, byte: 0 }.consumes_credit());
        assert!(!Message::CommandOn { device: 0x31 }.consumes_credit());
        assert!(
            !Message::DataBlock {
                data: Bytes::new()
            }
            .consumes_credit()
        );
        assert!(!Message::PingResponse.consumes_credit());
    }

    #[test]
    fn management_opcodes_are_classified() {
        assert!(Opcode::PingRequest.is_management());
        assert!(Opcode::CreditUpdate.is_management());
        assert!(Opcode::DeviceDisconnect.is_management());
        assert!(!Opcode::DataByte.is_management());
        assert!(!Opcode::SyncResponse.is_management());
        // Resets go to the bus front-end, not the connection manager.
        assert!(!Opcode::ColdReset.is_management());
    }

    #[test]
    fn sync_counter_wraps_and_starts_at_zero() {
        let mut counter = SyncCounter::new();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
        for _ in 2..=u8::MAX {
            counter.next();
        }
        assert_eq!(counter.next(), 0);
    }
}
