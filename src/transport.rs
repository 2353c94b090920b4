// ABOUTME: Provides the network link between the emulator and the peripheral hub
// ABOUTME: Implements datagram (UDP) and Altirra stream (TCP) transports behind one trait

use crate::codec::{CodecError, Message};
use bytes::{Buf, BytesMut};
use std::io::{self, Cursor, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

/// Default hub port for datagram mode.
pub const DEFAULT_UDP_PORT: u16 = 9997;

/// Default hub port for Altirra stream mode.
pub const DEFAULT_TCP_PORT: u16 = 9996;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("no peer to send to")]
    NoPeer,

    #[error("link closed by peer")]
    Closed,

    #[error("timed out waiting for a message")]
    Timeout,
}

impl TransportError {
    /// Errors that invalidate the current session. Framing problems
    /// discard one message; these discard the link.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Io(_) | TransportError::Closed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkMode {
    Datagram,
    Stream,
}

/// Framed message exchange with the hub.
///
/// `poll` never blocks; `recv_deadline` blocks at most until the given
/// deadline. Neither framing variant is allowed to leak onto the other's
/// wire format, so the choice is fixed at construction.
pub trait Transport {
    fn open(&mut self) -> Result<(), TransportError>;
    fn send(&mut self, msg: &Message) -> Result<(), TransportError>;
    fn poll(&mut self) -> Result<Option<Message>, TransportError>;
    fn recv_deadline(&mut self, deadline: Instant) -> Result<Message, TransportError>;
    fn peer(&self) -> Option<SocketAddr>;
    fn mode(&self) -> LinkMode;

    /// Re-establish a broken link. Only meaningful in stream mode; the
    /// datagram transport has nothing to rebuild.
    fn reconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// One NetSIO message per UDP datagram.
///
/// The hub's address may be configured up front or learned from the
/// first datagram it sends us; later address changes are adopted so a
/// hub restart on a new ephemeral port does not strand the session.
#[derive(Debug)]
pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    recv_buf: [u8; 2048],
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr, peer: Option<SocketAddr>) -> UdpTransport {
        UdpTransport {
            bind_addr,
            socket: None,
            peer,
            recv_buf: [0u8; 2048],
        }
    }

    fn socket(&self) -> Result<&UdpSocket, TransportError> {
        self.socket.as_ref().ok_or(TransportError::Closed)
    }
}

impl Transport for UdpTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let socket = UdpSocket::bind(self.bind_addr)?;
        socket.set_nonblocking(true)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let peer = self.peer.ok_or(TransportError::NoPeer)?;
        let mut buf = BytesMut::new();
        msg.encode_datagram(&mut buf)?;
        self.socket()?.send_to(&buf, peer)?;
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<Message>, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        let (len, from) = match socket.recv_from(&mut self.recv_buf) {
            Ok(received) => received,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if self.peer != Some(from) {
            match self.peer {
                Some(old) => info!(%old, new = %from, "hub address changed"),
                None => info!(peer = %from, "hub address learned"),
            }
            self.peer = Some(from);
        }
        let msg = Message::decode_datagram(&self.recv_buf[..len])?;
        Ok(Some(msg))
    }

    fn recv_deadline(&mut self, deadline: Instant) -> Result<Message, TransportError> {
        loop {
            if let Some(msg) = self.poll()? {
                return Ok(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            // Bounded blocking wait instead of a spin.
            let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
            socket.set_read_timeout(Some(deadline - now))?;
            socket.set_nonblocking(false)?;
            let result = socket.recv_from(&mut self.recv_buf);
            let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
            socket.set_nonblocking(true)?;
            socket.set_read_timeout(None)?;
            match result {
                Ok((len, from)) => {
                    self.peer = Some(from);
                    return Ok(Message::decode_datagram(&self.recv_buf[..len])?);
                }
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    return Err(TransportError::Timeout);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn mode(&self) -> LinkMode {
        LinkMode::Datagram
    }
}

/// Altirra stream framing over TCP.
///
/// Incoming bytes accumulate in a read buffer until a whole frame is
/// present; outgoing frames are written to completion even across
/// partial sends.
#[derive(Debug)]
pub struct TcpTransport {
    peer: SocketAddr,
    stream: Option<TcpStream>,
    buffer: BytesMut,
}

impl TcpTransport {
    pub fn new(peer: SocketAddr) -> TcpTransport {
        TcpTransport {
            peer,
            stream: None,
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Pull a frame out of the read buffer if one is complete.
    fn parse_frame(&mut self) -> Result<Option<Message>, TransportError> {
        let mut cursor = Cursor::new(&self.buffer[..]);
        match Message::check_stream(&mut cursor) {
            Ok(total) => {
                cursor.set_position(0);
                let msg = Message::parse_stream(&mut cursor)?;
                self.buffer.advance(total);
                Ok(Some(msg))
            }
            Err(CodecError::Incomplete) => Ok(None),
            Err(e) => {
                // A bad length desynchronizes the stream; there is no way
                // to find the next frame boundary, so drop the buffer.
                self.buffer.clear();
                Err(e.into())
            }
        }
    }

    fn fill_buffer(&mut self) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let mut chunk = [0u8; 2048];
        match stream.read(&mut chunk) {
            Ok(0) => {
                self.stream = None;
                Err(TransportError::Closed)
            }
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.stream = None;
                Err(e.into())
            }
        }
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let stream = TcpStream::connect_timeout(&self.peer, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        self.stream = Some(stream);
        self.buffer.clear();
        Ok(())
    }

    fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let mut buf = BytesMut::new();
        msg.encode_stream(&mut buf, 0)?;
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let mut written = 0;
        // Partial sends loop until the frame is fully on the wire.
        while written < buf.len() {
            match stream.write(&buf[written..]) {
                Ok(0) => {
                    self.stream = None;
                    return Err(TransportError::Closed);
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => {
                    self.stream = None;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<Message>, TransportError> {
        if let Some(msg) = self.parse_frame()? {
            return Ok(Some(msg));
        }
        if self.fill_buffer()? == 0 {
            return Ok(None);
        }
        self.parse_frame()
    }

    fn recv_deadline(&mut self, deadline: Instant) -> Result<Message, TransportError> {
        loop {
            if let Some(msg) = self.parse_frame()? {
                return Ok(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
            stream.set_read_timeout(Some(deadline - now))?;
            stream.set_nonblocking(false)?;
            let mut chunk = [0u8; 2048];
            let result = stream.read(&mut chunk);
            if let Some(stream) = self.stream.as_mut() {
                stream.set_nonblocking(true)?;
                stream.set_read_timeout(None)?;
            }
            match result {
                Ok(0) => {
                    self.stream = None;
                    return Err(TransportError::Closed);
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    return Err(TransportError::Timeout);
                }
                Err(e) => {
                    self.stream = None;
                    return Err(e.into());
                }
            }
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn mode(&self) -> LinkMode {
        LinkMode::Stream
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.stream = None;
        self.open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn udp_roundtrip_and_peer_learning() {
        let mut a = UdpTransport::new(loopback(), None);
        a.open().unwrap();
        let a_addr = a.socket.as_ref().unwrap().local_addr().unwrap();

        let mut b = UdpTransport::new(loopback(), Some(a_addr));
        b.open().unwrap();
        let b_addr = b.socket.as_ref().unwrap().local_addr().unwrap();

        // `a` has no peer yet.
        assert!(matches!(
            a.send(&Message::PingRequest),
            Err(TransportError::NoPeer)
        ));

        b.send(&Message::PingRequest).unwrap();
        let msg = a
            .recv_deadline(Instant::now() + Duration::from_secs(2))
            .unwrap();
        assert_eq!(msg, Message::PingRequest);
        assert_eq!(a.peer(), Some(b_addr));

        // Learned peer makes the reverse direction work.
        a.send(&Message::PingResponse).unwrap();
        let msg = b
            .recv_deadline(Instant::now() + Duration::from_secs(2))
            .unwrap();
        assert_eq!(msg, Message::PingResponse);
    }

    #[test]
    fn udp_poll_does_not_block() {
        let mut a = UdpTransport::new(loopback(), None);
        a.open().unwrap();
        assert!(a.poll().unwrap().is_none());
    }

    #[test]
    fn tcp_roundtrip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpTransport::new(addr);
        client.open().unwrap();
        let (mut server, _) = listener.accept().unwrap();

        client.send(&Message::CommandOn { device: 0x31 }).unwrap();
        client.send(&Message::CommandOffSync { sync: 0 }).unwrap();

        // Read both frames on the raw server side and echo them back.
        let mut echoed = Vec::new();
        server.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        while echoed.len() < 20 {
            let mut chunk = [0u8; 64];
            let n = server.read(&mut chunk).unwrap();
            echoed.extend_from_slice(&chunk[..n]);
        }
        server.write_all(&echoed).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        assert_eq!(
            client.recv_deadline(deadline).unwrap(),
            Message::CommandOn { device: 0x31 }
        );
        assert_eq!(
            client.recv_deadline(deadline).unwrap(),
            Message::CommandOffSync { sync: 0 }
        );
    }

    #[test]
    fn tcp_close_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpTransport::new(addr);
        client.open().unwrap();
        let (server, _) = listener.accept().unwrap();
        drop(server);

        let deadline = Instant::now() + Duration::from_secs(2);
        let err = client.recv_deadline(deadline).unwrap_err();
        assert!(err.is_fatal());
        assert!(!client.is_connected());
    }
}
