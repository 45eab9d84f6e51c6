//! Data channel
//!
//! AEAD encryption of tunneled frames. Outbound frames become DataV2
//! packets: `opcode_keyid(1) | peer_id(3) | packet_id(4) | ciphertext`,
//! with the opcode/key-id byte as associated data and the nonce built
//! from the packet-id plus the key's implicit IV. Inbound packets are
//! checked against the peer-id and a replay window before decryption.

use bytes::Bytes;

use rovpn_config::DeviceType;
use rovpn_crypto::{AeadCipher, CryptoError, DataKey, ReplayWindow};

use crate::codec::{PacketReader, PacketWriter};
use crate::packet::DataHeader;
use crate::{KeyId, OpCode, ProtocolError, Result};

/// The 16-byte OpenVPN ping frame
pub const PING_PAYLOAD: [u8; 16] = [
    0x2A, 0x18, 0x7B, 0xF3, 0x64, 0x1E, 0xB4, 0xCB, 0x07, 0xED, 0x2D, 0x0A, 0x98, 0x1F, 0xC7,
    0x48,
];

/// A decrypted inner frame, tagged by family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelFrame {
    /// Keepalive ping
    Ping,
    /// IPv4 packet (tun devices)
    Ipv4(Bytes),
    /// IPv6 packet (tun devices)
    Ipv6(Bytes),
    /// Ethernet frame (tap devices)
    Ethernet(Bytes),
    /// Frame with an unrecognized version nibble
    Unknown(Bytes),
}

/// Tag a decrypted payload by device family and version nibble
pub fn classify_frame(device: DeviceType, payload: Bytes) -> TunnelFrame {
    if payload[..] == PING_PAYLOAD {
        return TunnelFrame::Ping;
    }
    match device {
        DeviceType::Tap => TunnelFrame::Ethernet(payload),
        DeviceType::Tun => match payload.first().map(|b| b >> 4) {
            Some(4) => TunnelFrame::Ipv4(payload),
            Some(6) => TunnelFrame::Ipv6(payload),
            _ => TunnelFrame::Unknown(payload),
        },
    }
}

/// One negotiated key slot's data channel state
pub struct DataChannel {
    key_id: KeyId,
    peer_id: u32,
    encrypt: AeadCipher,
    decrypt: AeadCipher,
    next_packet_id: u32,
    replay: ReplayWindow,
    replay_drops: u64,
    auth_failures: u64,
}

impl DataChannel {
    /// Create a data channel from the negotiated keys
    pub fn new(key_id: KeyId, peer_id: u32, encrypt_key: &DataKey, decrypt_key: &DataKey) -> Self {
        Self {
            key_id,
            peer_id,
            encrypt: encrypt_key.cipher(),
            decrypt: decrypt_key.cipher(),
            next_packet_id: 1,
            replay: ReplayWindow::new(),
            replay_drops: 0,
            auth_failures: 0,
        }
    }

    /// The key slot this channel serves
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Packets dropped by the replay window so far
    pub fn replay_drops(&self) -> u64 {
        self.replay_drops
    }

    /// Packets dropped for a bad authentication tag so far
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures
    }

    /// Encrypt a frame into a complete DataV2 packet
    pub fn encrypt_write(&mut self, payload: &[u8]) -> Result<Bytes> {
        let packet_id = self.next_packet_id;
        self.next_packet_id = self
            .next_packet_id
            .checked_add(1)
            .ok_or(CryptoError::EncryptionFailed("data packet-id exhausted"))?;

        let first = OpCode::DataV2.to_byte(self.key_id);
        let ciphertext = self.encrypt.seal(packet_id, &[first], payload)?;

        let mut w = PacketWriter::with_capacity(8 + ciphertext.len());
        w.write_u8(first);
        w.write_u24(self.peer_id);
        w.write_u32(packet_id);
        w.write_bytes(&ciphertext);
        Ok(w.freeze())
    }

    /// Decrypt an inbound data packet's payload
    ///
    /// `payload` is everything after the peer-id on the wire: the 4-byte
    /// packet-id followed by the ciphertext.
    pub fn decrypt_read(&mut self, header: &DataHeader, payload: &[u8]) -> Result<Bytes> {
        if header.key_id != self.key_id {
            return Err(ProtocolError::CipherNotNegotiated);
        }
        if header.opcode == OpCode::DataV2 {
            match header.peer_id {
                Some(peer_id) if peer_id == self.peer_id => {}
                Some(peer_id) => return Err(ProtocolError::UnknownPeerId(peer_id)),
                None => return Err(ProtocolError::Malformed("DataV2 without peer-id".into())),
            }
        }

        let mut r = PacketReader::new(payload);
        let packet_id = r.read_u32()?;
        let ciphertext = r.rest();

        if !self.replay.check(packet_id as u64) {
            self.replay_drops += 1;
            return Err(ProtocolError::Replay);
        }

        let first = header.opcode.to_byte(header.key_id);
        match self.decrypt.open(packet_id, &[first], ciphertext) {
            Ok(plaintext) => {
                // The window only advances for authenticated packets, so a
                // forged packet-id cannot block the genuine one.
                self.replay.check_and_update(packet_id as u64);
                Ok(Bytes::from(plaintext))
            }
            Err(CryptoError::AuthTagMismatch) => {
                self.auth_failures += 1;
                Err(ProtocolError::AuthTagMismatch)
            }
            Err(e) => Err(e.into()),
        }
    }
}
