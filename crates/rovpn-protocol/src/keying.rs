//! Key negotiation
//!
//! Runs the exchange that happens inside the TLS tunnel once the control
//! channel is up: the key-method-2 blobs carrying key source material and
//! the OCC options string, then PUSH_REQUEST/PUSH_REPLY. Data channel
//! keys come from the TLS exporter when both peers negotiated `tls-ekm`,
//! otherwise from the legacy PRF over the exchanged randoms.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use zeroize::Zeroizing;

use rovpn_config::ClientConfig;
use rovpn_crypto::{
    derive_master_secret, random_bytes, CipherKind, DataKey, KeyBlock, EXPORTER_LABEL,
    KEY_EXPANSION_SIZE,
};

use crate::codec::{PacketReader, PacketWriter};
use crate::options::{build_occ_string, build_peer_info, PushOptions, PUSH_REPLY_PREFIX};
use crate::reliable::ReliableChannel;
use crate::tls::ControlCrypto;
use crate::{OpCode, ProtocolError, Result};

/// Interval between PUSH_REQUEST resends while awaiting the reply
const PUSH_REQUEST_INTERVAL: Duration = Duration::from_secs(5);

/// Largest control payload handed to the reliability layer at once
pub const MAX_CONTROL_PAYLOAD: usize = 1024;

const KEY_METHOD: u8 = 2;
const PUSH_REQUEST: &[u8] = b"PUSH_REQUEST\0";
const AUTH_FAILED_PREFIX: &str = "AUTH_FAILED";

/// Fixed-size prefix of a key-method-2 blob without pre-master:
/// marker(4) + method(1) + random1(32) + random2(32) + options length(2)
const SERVER_KM2_PREFIX: usize = 4 + 1 + 32 + 32 + 2;

/// Where the negotiation currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyingPhase {
    /// Driving the TLS handshake
    TlsHandshake,
    /// TLS is up, exchanging key-method-2 blobs
    KeyExchange,
    /// Awaiting PUSH_REPLY
    PushExchange,
    /// Negotiation finished
    Established,
}

/// Client-generated key source material
struct KeySource {
    pre_master: Zeroizing<[u8; 48]>,
    random1: Zeroizing<[u8; 32]>,
    random2: Zeroizing<[u8; 32]>,
}

impl KeySource {
    fn generate() -> Self {
        Self {
            pre_master: Zeroizing::new(random_bytes()),
            random1: Zeroizing::new(random_bytes()),
            random2: Zeroizing::new(random_bytes()),
        }
    }
}

/// Server half of the key-method-2 exchange
struct ServerKeyMethod2 {
    random1: Zeroizing<[u8; 32]>,
    random2: Zeroizing<[u8; 32]>,
    options: String,
}

/// Key negotiation state machine
pub struct KeyNegotiation {
    crypto: Box<dyn ControlCrypto>,
    phase: KeyingPhase,
    source: KeySource,
    server_key: Option<ServerKeyMethod2>,
    app_in: BytesMut,
    occ_cipher: CipherKind,
    next_push_request: Option<Instant>,
}

impl KeyNegotiation {
    /// Create negotiation state over the given control crypto engine
    pub fn new(crypto: Box<dyn ControlCrypto>, config: &ClientConfig) -> Result<Self> {
        let occ_cipher = config
            .supported_data_ciphers()
            .first()
            .copied()
            .ok_or(ProtocolError::CipherNotNegotiated)?;

        Ok(Self {
            crypto,
            phase: KeyingPhase::TlsHandshake,
            source: KeySource::generate(),
            server_key: None,
            app_in: BytesMut::new(),
            occ_cipher,
            next_push_request: None,
        })
    }

    /// Current phase
    pub fn phase(&self) -> KeyingPhase {
        self.phase
    }

    /// Feed a control payload delivered in order by the reliability layer
    pub fn on_control_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.crypto.write_output(payload)
    }

    /// Move pending wire bytes from the crypto engine into the send window
    pub fn pump_outgoing(&mut self, reliable: &mut ReliableChannel) -> Result<()> {
        let mut chunk = [0u8; MAX_CONTROL_PAYLOAD];
        while reliable.can_write() {
            let n = self.crypto.read_output(&mut chunk)?;
            if n == 0 {
                break;
            }
            reliable.write(OpCode::ControlV1, Bytes::copy_from_slice(&chunk[..n]))?;
        }
        Ok(())
    }

    /// Advance the negotiation
    ///
    /// Returns the parsed PUSH options once the exchange completes; `None`
    /// until then. `AUTH_FAILED` from the server surfaces as an error.
    pub fn advance(&mut self, now: Instant, config: &ClientConfig) -> Result<Option<PushOptions>> {
        if self.phase == KeyingPhase::TlsHandshake && !self.crypto.is_handshaking() {
            let occ = build_occ_string(config, self.occ_cipher)?;
            let blob = encode_key_method2(&self.source, &occ, config)?;
            self.crypto.write_input(&blob)?;
            tracing::debug!(occ = %occ, "TLS established, key material sent");
            self.phase = KeyingPhase::KeyExchange;
        }

        self.drain_incoming()?;

        if self.phase == KeyingPhase::KeyExchange {
            self.check_auth_failed()?;
            if let Some((consumed, server)) = try_parse_server_key_method2(&self.app_in)? {
                let _ = self.app_in.split_to(consumed);
                tracing::debug!(options = %server.options, "server key material received");
                self.server_key = Some(server);
                self.crypto.write_input(PUSH_REQUEST)?;
                self.next_push_request = Some(now + PUSH_REQUEST_INTERVAL);
                self.phase = KeyingPhase::PushExchange;
            }
        }

        if self.phase == KeyingPhase::PushExchange {
            while let Some(message) = self.take_message()? {
                if message.starts_with(PUSH_REPLY_PREFIX) {
                    let options = PushOptions::parse(&message)?;
                    self.phase = KeyingPhase::Established;
                    self.next_push_request = None;
                    return Ok(Some(options));
                } else if message.starts_with(AUTH_FAILED_PREFIX) {
                    return Err(auth_failed_error(&message));
                }
                tracing::debug!(%message, "ignoring control channel message");
            }

            if let Some(at) = self.next_push_request {
                if now >= at {
                    self.crypto.write_input(PUSH_REQUEST)?;
                    self.next_push_request = Some(now + PUSH_REQUEST_INTERVAL);
                }
            }
        }

        Ok(None)
    }

    /// Time until the next PUSH_REQUEST resend, if one is scheduled
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.next_push_request
            .map(|at| at.saturating_duration_since(now))
    }

    /// Derive the data channel keys: (encrypt, decrypt) for the client role
    pub fn derive_data_keys(
        &self,
        use_ekm: bool,
        cipher: CipherKind,
        client_session_id: &[u8; 8],
        server_session_id: &[u8; 8],
    ) -> Result<(DataKey, DataKey)> {
        let block = if use_ekm {
            let exported =
                self.crypto
                    .export_key_material(EXPORTER_LABEL, None, KEY_EXPANSION_SIZE)?;
            let mut bytes = [0u8; KEY_EXPANSION_SIZE];
            bytes.copy_from_slice(&exported);
            KeyBlock::from_bytes(bytes)
        } else {
            let server = self
                .server_key
                .as_ref()
                .ok_or(ProtocolError::InvalidState("server key material not received"))?;
            let master =
                derive_master_secret(&self.source.pre_master, &self.source.random1, &server.random1)?;
            KeyBlock::from_master(
                &master,
                &self.source.random2,
                &server.random2,
                client_session_id,
                server_session_id,
            )?
        };

        Ok((block.client_key(cipher)?, block.server_key(cipher)?))
    }

    fn drain_incoming(&mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let n = self.crypto.read_input(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            self.app_in.extend_from_slice(&buf[..n]);
        }
    }

    /// Pop the next NUL-terminated control channel message, if complete
    fn take_message(&mut self) -> Result<Option<String>> {
        let Some(pos) = self.app_in.iter().position(|&b| b == 0) else {
            return Ok(None);
        };
        let raw = self.app_in.split_to(pos + 1);
        String::from_utf8(raw[..pos].to_vec())
            .map(Some)
            .map_err(|_| ProtocolError::Malformed("control message is not UTF-8".into()))
    }

    fn check_auth_failed(&mut self) -> Result<()> {
        if self.app_in.starts_with(AUTH_FAILED_PREFIX.as_bytes()) {
            if let Some(message) = self.take_message()? {
                return Err(auth_failed_error(&message));
            }
        }
        Ok(())
    }
}

fn auth_failed_error(message: &str) -> ProtocolError {
    let reason = message
        .strip_prefix(AUTH_FAILED_PREFIX)
        .map(|r| r.trim_start_matches([',', ':', ' ']))
        .filter(|r| !r.is_empty())
        .unwrap_or("server rejected authentication");
    ProtocolError::AuthFailed(reason.to_string())
}

fn encode_key_method2(source: &KeySource, occ: &str, config: &ClientConfig) -> Result<Bytes> {
    let mut w = PacketWriter::with_capacity(256 + occ.len());
    w.write_u32(0); // key-method 2 marker
    w.write_u8(KEY_METHOD);
    w.write_bytes(&source.pre_master[..]);
    w.write_bytes(&source.random1[..]);
    w.write_bytes(&source.random2[..]);
    write_wire_string(&mut w, Some(occ))?;
    match &config.credentials {
        Some(c) => {
            write_wire_string(&mut w, Some(&c.username))?;
            write_wire_string(&mut w, Some(&c.password))?;
        }
        None => {
            write_wire_string(&mut w, None)?;
            write_wire_string(&mut w, None)?;
        }
    }
    write_wire_string(&mut w, Some(&build_peer_info(config)))?;
    Ok(w.freeze())
}

/// Parse the server's key-method-2 blob if it is fully buffered
///
/// Returns `Ok(None)` while bytes are still missing, the parsed blob and
/// the number of bytes consumed once complete.
fn try_parse_server_key_method2(data: &[u8]) -> Result<Option<(usize, ServerKeyMethod2)>> {
    if data.len() < SERVER_KM2_PREFIX {
        return Ok(None);
    }

    let mut r = PacketReader::new(data);
    if r.read_u32()? != 0 {
        return Err(ProtocolError::Malformed("bad key-method marker".into()));
    }
    let method = r.read_u8()?;
    if method != KEY_METHOD {
        return Err(ProtocolError::Malformed(format!(
            "unsupported key method {method}"
        )));
    }
    let random1 = Zeroizing::new(r.read_array::<32>()?);
    let random2 = Zeroizing::new(r.read_array::<32>()?);

    let options_len = r.read_u16()? as usize;
    if r.remaining() < options_len {
        return Ok(None);
    }
    let options = parse_wire_string(r.read_bytes(options_len)?)?;

    Ok(Some((
        SERVER_KM2_PREFIX + options_len,
        ServerKeyMethod2 {
            random1,
            random2,
            options,
        },
    )))
}

/// Length-prefixed NUL-terminated string; the u16 length includes the NUL
fn write_wire_string(w: &mut PacketWriter, s: Option<&str>) -> Result<()> {
    match s {
        None | Some("") => w.write_u16(0),
        Some(s) => {
            let bytes = s.as_bytes();
            let len = u16::try_from(bytes.len() + 1)
                .map_err(|_| ProtocolError::Malformed("wire string over 64 KiB".into()))?;
            w.write_u16(len);
            w.write_bytes(bytes);
            w.write_u8(0);
        }
    }
    Ok(())
}

fn parse_wire_string(raw: &[u8]) -> Result<String> {
    let body = match raw.last() {
        Some(0) => &raw[..raw.len() - 1],
        _ => raw,
    };
    String::from_utf8(body.to_vec())
        .map_err(|_| ProtocolError::Malformed("wire string is not UTF-8".into()))
}
