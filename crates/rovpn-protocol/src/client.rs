//! Protocol driver
//!
//! Wires the envelope, transport, reliability, control wrap, TLS pump,
//! demuxer, key negotiation and data channel into the application-facing
//! engine. The driver is a single-threaded cooperative state machine: the
//! caller pushes it forward through `connect`, `receive`, `send` and
//! `wait_for_data`, which are the only suspension points.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use rovpn_config::ClientConfig;
use rovpn_crypto::{generate_session_id, CipherKind};

use crate::data::{classify_frame, DataChannel, TunnelFrame, PING_PAYLOAD};
use crate::demux::{ConsumerId, SessionDemux};
use crate::keying::{KeyNegotiation, KeyingPhase};
use crate::options::PushOptions;
use crate::packet::{ControlHeader, SessionId, SessionPacket, SessionPacketHeader};
use crate::reliable::{OutgoingControl, ReliableChannel, ReliableConfig};
use crate::tls::{ControlCrypto, TlsClient};
use crate::transport::Carrier;
use crate::wrap::ControlWrap;
use crate::{KeyId, OpCode, ProtocolError, Result};

/// Connection phase of the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Nothing sent yet
    Initial,
    /// Hard reset sent, waiting for the server's
    WaitServerReset,
    /// Driving the TLS handshake inside the control channel
    TlsHandshake,
    /// Exchanging key-method-2 blobs
    KeyExchange,
    /// Awaiting PUSH_REPLY
    PushExchange,
    /// Tunnel is up
    Established,
    /// Structural failure, the session is unusable
    Failed,
}

/// Negotiated session parameters, delivered once as a Connect event
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Everything the server pushed
    pub push: PushOptions,
    /// Data channel cipher in use
    pub cipher: CipherKind,
    /// Peer-id for DataV2 headers
    pub peer_id: u32,
}

/// One item from the driver's inbound queue
#[derive(Debug, Clone)]
pub enum InboundPacket {
    /// Negotiation finished; carries the interpreted PUSH options
    Connect(Box<SessionSettings>),
    /// A decrypted tunnel frame
    Frame(TunnelFrame),
}

/// The protocol engine for one client session
pub struct VpnClient {
    config: ClientConfig,
    carrier: Carrier,
    demux: SessionDemux,
    control_q: ConsumerId,
    data_q: ConsumerId,
    reliable: ReliableChannel,
    wrap: Option<ControlWrap>,
    keying: KeyNegotiation,
    data: Option<DataChannel>,
    state: ClientState,
    key_id: KeyId,
    local_session_id: SessionId,
    remote_session_id: Option<SessionId>,
    inbound: VecDeque<InboundPacket>,
    outbound: VecDeque<Bytes>,
    ping_interval: Option<Duration>,
    last_data_sent: Instant,
}

impl VpnClient {
    /// Connect the transport and build the engine with a rustls client
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let crypto = TlsClient::new(&config.control_crypto, &config.remote_host)?;
        Self::with_control_crypto(config, Box::new(crypto)).await
    }

    /// Build the engine over a caller-supplied control crypto engine
    ///
    /// Tests use this with [`PlainCrypto`](crate::tls::PlainCrypto) to run
    /// the whole protocol without a TLS peer.
    pub async fn with_control_crypto(
        config: ClientConfig,
        crypto: Box<dyn ControlCrypto>,
    ) -> Result<Self> {
        let carrier = Carrier::connect(&config).await?;
        let wrap = config.wrap_key()?.map(|key| ControlWrap::client(&key));
        let keying = KeyNegotiation::new(crypto, &config)?;

        let mut demux = SessionDemux::new();
        let control_q = demux.register(&[
            OpCode::ControlV1,
            OpCode::AckV1,
            OpCode::HardResetClientV2,
            OpCode::HardResetServerV2,
        ])?;
        let data_q = demux.register(&[OpCode::DataV1, OpCode::DataV2])?;

        Ok(Self {
            config,
            carrier,
            demux,
            control_q,
            data_q,
            reliable: ReliableChannel::new(ReliableConfig::default()),
            wrap,
            keying,
            data: None,
            state: ClientState::Initial,
            key_id: KeyId::default(),
            local_session_id: generate_session_id(),
            remote_session_id: None,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            ping_interval: None,
            last_data_sent: Instant::now(),
        })
    }

    /// Replace the reliability tuning (before connecting)
    pub fn with_reliable_config(mut self, config: ReliableConfig) -> Self {
        self.reliable = ReliableChannel::new(config);
        self
    }

    /// Current connection phase
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// This session's local session ID
    pub fn local_session_id(&self) -> &SessionId {
        &self.local_session_id
    }

    /// The server's session ID, once learned
    pub fn remote_session_id(&self) -> Option<&SessionId> {
        self.remote_session_id.as_ref()
    }

    /// Run the handshake until the session is established
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.state {
            ClientState::Initial => {
                self.reliable.write(OpCode::HardResetClientV2, Bytes::new())?;
                self.state = ClientState::WaitServerReset;
                tracing::info!(
                    remote = %self.config.remote(),
                    "initiating session"
                );
            }
            ClientState::Established => return Ok(()),
            ClientState::Failed => {
                return Err(ProtocolError::InvalidState("session already failed"));
            }
            _ => {} // resume an in-flight handshake
        }

        loop {
            self.send(cancel).await?;
            if self.state == ClientState::Established {
                return Ok(());
            }
            self.wait_for_data(cancel).await?;
            self.receive(cancel).await?;
        }
    }

    /// Pull one network batch and advance the state machine
    pub async fn receive(&mut self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        let result = self.receive_inner();
        if let Err(e) = &result {
            self.note_failure(e);
        }
        result
    }

    /// Flush queued control retransmissions, ACKs and data to the wire
    pub async fn send(&mut self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        if let Err(e) = self.queue_outgoing() {
            self.note_failure(&e);
            return Err(e);
        }
        self.carrier.flush(cancel).await
    }

    /// Sleep until the socket is readable or a protocol timer fires
    pub async fn wait_for_data(&mut self, cancel: &CancellationToken) -> Result<()> {
        let now = Instant::now();
        let mut timeout = self.reliable.next_timeout(now);
        if self.negotiating() {
            timeout = min_timeout(timeout, self.keying.next_timeout(now));
        }
        if self.state == ClientState::Established {
            if let Some(interval) = self.ping_interval {
                let due = (self.last_data_sent + interval).saturating_duration_since(now);
                timeout = min_timeout(timeout, Some(due));
            }
        }

        match timeout {
            Some(timeout) if timeout.is_zero() => Ok(()),
            Some(timeout) => {
                tokio::select! {
                    result = self.carrier.wait_readable(cancel) => result,
                    _ = tokio::time::sleep(timeout) => Ok(()),
                }
            }
            None => self.carrier.wait_readable(cancel).await,
        }
    }

    /// Next inbound event, if one is queued
    ///
    /// Frames reference buffers reused across `receive` calls; clone what
    /// must outlive the next call.
    pub fn read(&mut self) -> Option<InboundPacket> {
        self.inbound.pop_front()
    }

    /// Queue an outbound tunnel frame
    pub fn write(&mut self, frame: &[u8]) -> Result<()> {
        if self.state != ClientState::Established {
            return Err(ProtocolError::CipherNotNegotiated);
        }
        self.outbound.push_back(Bytes::copy_from_slice(frame));
        Ok(())
    }

    fn negotiating(&self) -> bool {
        matches!(
            self.state,
            ClientState::TlsHandshake | ClientState::KeyExchange | ClientState::PushExchange
        )
    }

    fn note_failure(&mut self, error: &ProtocolError) {
        if matches!(
            error,
            ProtocolError::TransportClosed
                | ProtocolError::ControlTimeout
                | ProtocolError::AuthFailed(_)
                | ProtocolError::TlsHandshake(_)
        ) {
            tracing::error!(%error, "session failed");
            self.state = ClientState::Failed;
        }
    }

    fn receive_inner(&mut self) -> Result<()> {
        self.ingest()?;
        self.process_control()?;
        self.advance_keying()?;
        self.process_data()
    }

    /// Drain the carrier and route packets to their consumers
    fn ingest(&mut self) -> Result<()> {
        while let Some(raw) = self.carrier.poll_incoming()? {
            if raw.is_empty() {
                continue;
            }
            let opcode = OpCode::from_byte(raw[0])?;

            let bytes = if opcode.is_control() {
                match &mut self.wrap {
                    Some(wrap) => match wrap.unwrap(&raw) {
                        Ok(clear) => clear,
                        Err(ProtocolError::WrapAuthFailed | ProtocolError::WrapReplay) => {
                            tracing::warn!(%opcode, "dropping control packet failing wrap check");
                            continue;
                        }
                        Err(e) => return Err(e),
                    },
                    None => raw.freeze(),
                }
            } else {
                raw.freeze()
            };

            let packet = SessionPacket::parse(&bytes)?;
            self.demux.dispatch(packet)?;
        }
        Ok(())
    }

    fn process_control(&mut self) -> Result<()> {
        while let Some(packet) = self.demux.pop(self.control_q) {
            let SessionPacketHeader::Control(header) = &packet.header else {
                continue;
            };

            match header.opcode {
                OpCode::HardResetClientV2 => {
                    return Err(ProtocolError::Malformed(
                        "client hard reset received from server".into(),
                    ));
                }
                OpCode::HardResetServerV2 => {
                    if self.state == ClientState::Initial {
                        return Err(ProtocolError::InvalidState("server reset before connect"));
                    }
                    match self.remote_session_id {
                        None => self.remote_session_id = Some(header.session_id),
                        Some(known) if known != header.session_id => {
                            tracing::warn!("ignoring hard reset from unknown session");
                            continue;
                        }
                        Some(_) => {}
                    }
                    self.reliable.on_incoming(header, packet.payload.clone());
                }
                OpCode::ControlV1 | OpCode::AckV1 => {
                    if let Some(known) = self.remote_session_id {
                        if known != header.session_id {
                            tracing::warn!("ignoring control packet from unknown session");
                            continue;
                        }
                    }
                    self.reliable.on_incoming(header, packet.payload.clone());
                }
                _ => {}
            }
        }

        while let Some((opcode, payload)) = self.reliable.read() {
            match opcode {
                OpCode::HardResetServerV2 => {
                    if self.state == ClientState::WaitServerReset {
                        tracing::info!("server reset received, starting TLS");
                        self.state = ClientState::TlsHandshake;
                    }
                }
                OpCode::ControlV1 => self.keying.on_control_payload(&payload)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn advance_keying(&mut self) -> Result<()> {
        if !self.negotiating() {
            return Ok(());
        }
        if let Some(push) = self.keying.advance(Instant::now(), &self.config)? {
            return self.establish(push);
        }
        self.state = match self.keying.phase() {
            KeyingPhase::TlsHandshake => ClientState::TlsHandshake,
            KeyingPhase::KeyExchange => ClientState::KeyExchange,
            KeyingPhase::PushExchange => ClientState::PushExchange,
            KeyingPhase::Established => ClientState::Established,
        };
        Ok(())
    }

    fn establish(&mut self, push: PushOptions) -> Result<()> {
        let supported = self.config.supported_data_ciphers();
        let cipher = match &push.cipher {
            Some(name) => {
                CipherKind::from_name(name).map_err(|_| ProtocolError::CipherNotNegotiated)?
            }
            None => supported
                .first()
                .copied()
                .ok_or(ProtocolError::CipherNotNegotiated)?,
        };
        if !supported.contains(&cipher) {
            return Err(ProtocolError::CipherNotNegotiated);
        }

        let peer_id = push
            .peer_id
            .ok_or_else(|| ProtocolError::OptionsFormat("peer-id missing".into()))?;
        let remote_session_id = self
            .remote_session_id
            .ok_or(ProtocolError::InvalidState("no remote session id"))?;

        let use_ekm = self.config.control_crypto.use_key_material_exporters && push.tls_ekm();
        let (encrypt_key, decrypt_key) = self.keying.derive_data_keys(
            use_ekm,
            cipher,
            &self.local_session_id,
            &remote_session_id,
        )?;
        self.data = Some(DataChannel::new(self.key_id, peer_id, &encrypt_key, &decrypt_key));

        self.ping_interval = push
            .ping
            .and_then(|seconds| u64::try_from(seconds).ok())
            .filter(|&seconds| seconds > 0)
            .map(Duration::from_secs);
        self.last_data_sent = Instant::now();

        tracing::info!(%cipher, peer_id, ekm = use_ekm, "session established");
        self.inbound.push_back(InboundPacket::Connect(Box::new(SessionSettings {
            push,
            cipher,
            peer_id,
        })));
        self.state = ClientState::Established;
        Ok(())
    }

    fn process_data(&mut self) -> Result<()> {
        while let Some(packet) = self.demux.pop(self.data_q) {
            let SessionPacketHeader::Data(header) = &packet.header else {
                continue;
            };
            let Some(channel) = &mut self.data else {
                return Err(ProtocolError::CipherNotNegotiated);
            };

            match channel.decrypt_read(header, &packet.payload) {
                Ok(plaintext) => {
                    let frame = classify_frame(self.config.device, plaintext);
                    self.inbound.push_back(InboundPacket::Frame(frame));
                }
                Err(ProtocolError::Replay) => {
                    tracing::debug!(drops = channel.replay_drops(), "replayed data packet dropped");
                }
                Err(ProtocolError::AuthTagMismatch) => {
                    tracing::debug!(
                        failures = channel.auth_failures(),
                        "unauthentic data packet dropped"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn queue_outgoing(&mut self) -> Result<()> {
        let now = Instant::now();

        if self.negotiating() || self.state == ClientState::Established {
            self.keying.pump_outgoing(&mut self.reliable)?;
        }

        while let Some(out) = self.reliable.poll_transmit(now)? {
            if out.retransmit {
                tracing::debug!(message_id = out.message_id, "retransmitting control packet");
            }
            let packet = self.control_packet(out)?;
            self.enqueue_control(&packet)?;
        }

        if let Some(acks) = self.reliable.poll_ack() {
            let packet = self.ack_packet(acks)?;
            self.enqueue_control(&packet)?;
        }

        if self.state == ClientState::Established {
            while let Some(frame) = self.outbound.pop_front() {
                let channel = self.data.as_mut().ok_or(ProtocolError::CipherNotNegotiated)?;
                let bytes = channel.encrypt_write(&frame)?;
                self.carrier.enqueue_outgoing(bytes);
                self.last_data_sent = now;
            }

            if let Some(interval) = self.ping_interval {
                if now.duration_since(self.last_data_sent) >= interval {
                    let channel =
                        self.data.as_mut().ok_or(ProtocolError::CipherNotNegotiated)?;
                    let bytes = channel.encrypt_write(&PING_PAYLOAD)?;
                    self.carrier.enqueue_outgoing(bytes);
                    self.last_data_sent = now;
                    tracing::trace!("keepalive ping sent");
                }
            }
        }

        self.carrier.drain_to_socket()
    }

    fn control_packet(&self, out: OutgoingControl) -> Result<SessionPacket> {
        let remote_session_id = if out.acks.is_empty() {
            None
        } else {
            Some(self.remote_session_id.ok_or(ProtocolError::InvalidState(
                "acks pending before remote session id known",
            ))?)
        };

        Ok(SessionPacket {
            header: SessionPacketHeader::Control(ControlHeader {
                opcode: out.opcode,
                key_id: self.key_id,
                session_id: self.local_session_id,
                acks: out.acks,
                remote_session_id,
                message_id: Some(out.message_id),
            }),
            payload: out.payload,
        })
    }

    fn ack_packet(&self, acks: Vec<u32>) -> Result<SessionPacket> {
        let remote_session_id = Some(self.remote_session_id.ok_or(
            ProtocolError::InvalidState("acks pending before remote session id known"),
        )?);

        Ok(SessionPacket {
            header: SessionPacketHeader::Control(ControlHeader {
                opcode: OpCode::AckV1,
                key_id: self.key_id,
                session_id: self.local_session_id,
                acks,
                remote_session_id,
                message_id: None,
            }),
            payload: Bytes::new(),
        })
    }

    fn enqueue_control(&mut self, packet: &SessionPacket) -> Result<()> {
        let bytes = packet.serialize()?;
        let bytes = match &mut self.wrap {
            Some(wrap) => wrap.wrap(&bytes)?,
            None => bytes,
        };
        self.carrier.enqueue_outgoing(bytes);
        Ok(())
    }
}

fn min_timeout(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::PlainCrypto;

    fn test_config() -> ClientConfig {
        ClientConfig::from_toml_str(
            r#"
                remote_host = "127.0.0.1"
                remote_port = 1194

                [control_crypto]
                certificate = "CERT"
                private_key = "KEY"
                ca = "CA"
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_before_established_fails() {
        let mut client =
            VpnClient::with_control_crypto(test_config(), Box::new(PlainCrypto::new()))
                .await
                .unwrap();

        assert_eq!(client.state(), ClientState::Initial);
        assert!(matches!(
            client.write(b"frame"),
            Err(ProtocolError::CipherNotNegotiated)
        ));
        assert!(client.read().is_none());
    }

    #[tokio::test]
    async fn test_receive_honors_cancellation() {
        let mut client =
            VpnClient::with_control_crypto(test_config(), Box::new(PlainCrypto::new()))
                .await
                .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            client.receive(&cancel).await,
            Err(ProtocolError::Cancelled)
        ));
        assert!(matches!(
            client.send(&cancel).await,
            Err(ProtocolError::Cancelled)
        ));
    }
}
