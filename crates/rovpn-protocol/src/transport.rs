//! Transport carrier
//!
//! Owns the socket and moves whole session packets. UDP maps one packet
//! per datagram; TCP prefixes each packet with a 2-byte big-endian length
//! and reassembles across reads. Both sides expose non-blocking
//! queue/poll primitives plus an awaitable readability probe, so the
//! protocol engine never blocks inside its state machine.

use bytes::{Buf, Bytes, BytesMut};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use rovpn_config::{ClientConfig, TransportProtocol};

use crate::{ProtocolError, Result};

/// Upper bound on queued outgoing packets before UDP drops
pub const MAX_QUEUED_OUTGOING: usize = 64;

const RECV_BUF_SIZE: usize = 65536;

/// Transport carrier over UDP or TCP
pub enum Carrier {
    /// Datagram carrier
    Udp(UdpCarrier),
    /// Stream carrier with length framing
    Tcp(TcpCarrier),
}

impl Carrier {
    /// Connect the carrier described by the configuration
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let remote = config.remote();
        match config.protocol {
            TransportProtocol::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(&remote).await?;
                tracing::debug!(%remote, "UDP carrier connected");
                Ok(Carrier::Udp(UdpCarrier::new(socket)))
            }
            TransportProtocol::Tcp => {
                let stream = TcpStream::connect(&remote).await?;
                stream.set_nodelay(true)?;
                tracing::debug!(%remote, "TCP carrier connected");
                Ok(Carrier::Tcp(TcpCarrier::new(stream)))
            }
        }
    }

    /// Queue one session packet for sending
    ///
    /// On UDP a full queue silently drops the packet; the reliability
    /// layer retransmits control traffic and data is best-effort anyway.
    pub fn enqueue_outgoing(&mut self, packet: Bytes) {
        match self {
            Carrier::Udp(u) => u.enqueue(packet),
            Carrier::Tcp(t) => t.enqueue(packet),
        }
    }

    /// Push queued packets into the socket without blocking
    pub fn drain_to_socket(&mut self) -> Result<()> {
        match self {
            Carrier::Udp(u) => u.drain(),
            Carrier::Tcp(t) => t.drain(),
        }
    }

    /// Drain the outgoing queue, awaiting socket writability as needed
    pub async fn flush(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            self.drain_to_socket()?;
            if !self.has_queued() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
                ready = self.writable() => ready?,
            }
        }
    }

    /// Pull the next complete incoming session packet, if one is buffered
    pub fn poll_incoming(&mut self) -> Result<Option<BytesMut>> {
        match self {
            Carrier::Udp(u) => u.poll_incoming(),
            Carrier::Tcp(t) => t.poll_incoming(),
        }
    }

    /// Wait until the socket is readable or the token fires
    pub async fn wait_readable(&self, cancel: &CancellationToken) -> Result<()> {
        let readable = async {
            match self {
                Carrier::Udp(u) => u.socket.readable().await,
                Carrier::Tcp(t) => t.stream.readable().await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
            ready = readable => Ok(ready?),
        }
    }

    /// Whether packets are still queued for sending
    pub fn has_queued(&self) -> bool {
        match self {
            Carrier::Udp(u) => !u.outgoing.is_empty(),
            Carrier::Tcp(t) => !t.outgoing.is_empty(),
        }
    }

    async fn writable(&self) -> Result<()> {
        match self {
            Carrier::Udp(u) => u.socket.writable().await?,
            Carrier::Tcp(t) => t.stream.writable().await?,
        }
        Ok(())
    }
}

/// UDP carrier: one session packet per datagram
pub struct UdpCarrier {
    socket: UdpSocket,
    outgoing: std::collections::VecDeque<Bytes>,
    recv_buf: Vec<u8>,
}

impl UdpCarrier {
    /// Wrap a connected UDP socket
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            outgoing: std::collections::VecDeque::new(),
            recv_buf: vec![0u8; RECV_BUF_SIZE],
        }
    }

    fn enqueue(&mut self, packet: Bytes) {
        if self.outgoing.len() >= MAX_QUEUED_OUTGOING {
            tracing::debug!("outgoing queue full, dropping datagram");
            return;
        }
        self.outgoing.push_back(packet);
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(packet) = self.outgoing.front() {
            match self.socket.try_send(packet) {
                Ok(_) => {
                    self.outgoing.pop_front();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn poll_incoming(&mut self) -> Result<Option<BytesMut>> {
        match self.socket.try_recv(&mut self.recv_buf) {
            Ok(n) => Ok(Some(BytesMut::from(&self.recv_buf[..n]))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// TCP carrier: 2-byte big-endian length before every session packet
pub struct TcpCarrier {
    stream: TcpStream,
    outgoing: std::collections::VecDeque<Bytes>,
    /// Offset into the front outgoing element after a partial write
    write_off: usize,
    incoming: BytesMut,
}

impl TcpCarrier {
    /// Wrap a connected TCP stream
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            outgoing: std::collections::VecDeque::new(),
            write_off: 0,
            incoming: BytesMut::with_capacity(RECV_BUF_SIZE),
        }
    }

    fn enqueue(&mut self, packet: Bytes) {
        let Ok(len) = u16::try_from(packet.len()) else {
            tracing::warn!(len = packet.len(), "dropping oversized record");
            return;
        };
        let mut framed = BytesMut::with_capacity(2 + packet.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(&packet);
        self.outgoing.push_back(framed.freeze());
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(packet) = self.outgoing.front() {
            match self.stream.try_write(&packet[self.write_off..]) {
                Ok(0) => return Err(ProtocolError::TransportClosed),
                Ok(n) => {
                    self.write_off += n;
                    if self.write_off == packet.len() {
                        self.outgoing.pop_front();
                        self.write_off = 0;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn poll_incoming(&mut self) -> Result<Option<BytesMut>> {
        loop {
            // A complete record may already be buffered from a prior read
            if let Some(record) = self.take_record()? {
                return Ok(Some(record));
            }

            let mut buf = [0u8; RECV_BUF_SIZE];
            match self.stream.try_read(&mut buf) {
                Ok(0) => return Err(ProtocolError::TransportClosed),
                Ok(n) => self.incoming.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    return Err(ProtocolError::TransportClosed);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take_record(&mut self) -> Result<Option<BytesMut>> {
        if self.incoming.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.incoming[0], self.incoming[1]]) as usize;
        if len == 0 {
            return Err(ProtocolError::Malformed("zero-length TCP record".into()));
        }
        if self.incoming.len() < 2 + len {
            return Ok(None);
        }
        self.incoming.advance(2);
        Ok(Some(self.incoming.split_to(len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(peer_addr).await.unwrap();
        let local_addr = socket.local_addr().unwrap();
        let mut carrier = Carrier::Udp(UdpCarrier::new(socket));

        carrier.enqueue_outgoing(Bytes::from_static(b"one packet"));
        carrier.flush(&CancellationToken::new()).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one packet");
        assert_eq!(from, local_addr);

        peer.send_to(b"reply", local_addr).await.unwrap();
        carrier.wait_readable(&CancellationToken::new()).await.unwrap();
        let got = carrier.poll_incoming().unwrap().unwrap();
        assert_eq!(&got[..], b"reply");
    }

    #[tokio::test]
    async fn test_tcp_framing_across_partial_reads() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        let mut carrier = Carrier::Tcp(TcpCarrier::new(client));

        // Two records, the second split mid-length across writes
        server.write_all(&[0x00, 0x03, b'a', b'b', b'c', 0x00]).await.unwrap();
        server.flush().await.unwrap();
        tokio::task::yield_now().await;

        carrier.wait_readable(&CancellationToken::new()).await.unwrap();
        let first = carrier.poll_incoming().unwrap().unwrap();
        assert_eq!(&first[..], b"abc");
        // Second record still incomplete
        assert!(carrier.poll_incoming().unwrap().is_none());

        server.write_all(&[0x02, b'x', b'y']).await.unwrap();
        server.flush().await.unwrap();
        carrier.wait_readable(&CancellationToken::new()).await.unwrap();
        let second = carrier.poll_incoming().unwrap().unwrap();
        assert_eq!(&second[..], b"xy");
    }

    #[tokio::test]
    async fn test_tcp_close_yields_transport_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let mut carrier = Carrier::Tcp(TcpCarrier::new(client));

        drop(server);
        carrier.wait_readable(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            carrier.poll_incoming(),
            Err(ProtocolError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect("127.0.0.1:9").await.unwrap();
        let carrier = Carrier::Udp(UdpCarrier::new(socket));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            carrier.wait_readable(&cancel).await,
            Err(ProtocolError::Cancelled)
        ));
    }
}
