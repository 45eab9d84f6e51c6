//! Control channel wrap (tls-crypt)
//!
//! When enabled, every control packet is transformed at the transport
//! boundary: the opcode/key-id byte and session ID stay in the clear,
//! followed by a 64-bit wrap packet-id, the 32-byte HMAC tag and the
//! encrypted remainder of the packet. Wire layout per wrapped packet:
//!
//! `opcode_keyid(1) | session_id(8) | wrap_id(8) | hmac(32) | ciphertext`

use bytes::Bytes;

use rovpn_crypto::{ReplayWindow, StaticKey, TlsCryptKey};

use crate::codec::{PacketReader, PacketWriter};
use crate::{ProtocolError, Result};

/// Cleartext bytes preceding the tag: opcode/key-id, session id, wrap id
pub const WRAP_HEADER_SIZE: usize = 1 + 8 + 8;

/// Stateful tls-crypt wrapper for one peer
pub struct ControlWrap {
    seal_key: TlsCryptKey,
    open_key: TlsCryptKey,
    next_wrap_id: u64,
    replay: ReplayWindow,
}

impl ControlWrap {
    /// Wrap state for the client role
    pub fn client(key: &StaticKey) -> Self {
        let (seal_key, open_key) = key.client_wrap_keys();
        Self::new(seal_key, open_key)
    }

    /// Wrap state for the server role (used by tests and tooling)
    pub fn server(key: &StaticKey) -> Self {
        let (seal_key, open_key) = key.server_wrap_keys();
        Self::new(seal_key, open_key)
    }

    fn new(seal_key: TlsCryptKey, open_key: TlsCryptKey) -> Self {
        Self {
            seal_key,
            open_key,
            next_wrap_id: 1,
            replay: ReplayWindow::new(),
        }
    }

    /// Wrap a serialized control packet for the wire
    pub fn wrap(&mut self, packet: &[u8]) -> Result<Bytes> {
        if packet.len() < 9 {
            return Err(ProtocolError::Truncated {
                expected: 9,
                got: packet.len(),
            });
        }

        let wrap_id = self.next_wrap_id;
        self.next_wrap_id = self
            .next_wrap_id
            .checked_add(1)
            .ok_or(ProtocolError::Malformed("wrap packet-id exhausted".into()))?;

        let mut header = [0u8; WRAP_HEADER_SIZE];
        header[..9].copy_from_slice(&packet[..9]);
        header[9..].copy_from_slice(&wrap_id.to_be_bytes());

        let (tag, ciphertext) = self.seal_key.seal(&header, &packet[9..]);

        let mut w = PacketWriter::with_capacity(WRAP_HEADER_SIZE + tag.len() + ciphertext.len());
        w.write_bytes(&header);
        w.write_bytes(&tag);
        w.write_bytes(&ciphertext);
        Ok(w.freeze())
    }

    /// Unwrap a packet from the wire back into a cleartext control packet
    ///
    /// Fails with `WrapAuthFailed` on a bad tag and `WrapReplay` for a
    /// wrap packet-id already seen or older than the window.
    pub fn unwrap(&mut self, packet: &[u8]) -> Result<Bytes> {
        let mut r = PacketReader::new(packet);
        let header = r.read_bytes(WRAP_HEADER_SIZE)?;
        let tag = r.read_bytes(TlsCryptKey::TAG_SIZE)?;
        let ciphertext = r.rest();

        let wrap_id = u64::from_be_bytes(header[9..].try_into().expect("fixed header split"));

        let plaintext = self
            .open_key
            .open(header, tag, ciphertext)
            .map_err(|_| ProtocolError::WrapAuthFailed)?;

        if !self.replay.check_and_update(wrap_id) {
            return Err(ProtocolError::WrapReplay);
        }

        let mut w = PacketWriter::with_capacity(9 + plaintext.len());
        w.write_bytes(&header[..9]);
        w.write_bytes(&plaintext);
        Ok(w.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_key() -> StaticKey {
        let mut bytes = [0u8; 256];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        StaticKey::from_bytes(bytes)
    }

    fn sample_packet() -> Vec<u8> {
        // ControlV1 with session id and a small payload
        let mut packet = vec![0x20];
        packet.extend_from_slice(&[0x0A; 8]);
        packet.extend_from_slice(b"\x00\x00\x00\x00\x01tls bytes");
        packet
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let key = static_key();
        let mut client = ControlWrap::client(&key);
        let mut server = ControlWrap::server(&key);

        let packet = sample_packet();
        let wrapped = client.wrap(&packet).unwrap();
        assert_ne!(&wrapped[..], &packet[..]);
        // Cleartext prefix survives for demuxing
        assert_eq!(&wrapped[..9], &packet[..9]);
        // First wrap packet-id is 1
        assert_eq!(&wrapped[9..17], &1u64.to_be_bytes());

        let unwrapped = server.unwrap(&wrapped).unwrap();
        assert_eq!(&unwrapped[..], &packet[..]);
    }

    #[test]
    fn test_unwrap_rejects_corruption_anywhere() {
        let key = static_key();
        let mut client = ControlWrap::client(&key);
        let packet = sample_packet();
        let wrapped = client.wrap(&packet).unwrap();

        for i in 0..wrapped.len() {
            let mut server = ControlWrap::server(&key);
            let mut bad = wrapped.to_vec();
            bad[i] ^= 0x01;
            assert!(
                matches!(server.unwrap(&bad), Err(ProtocolError::WrapAuthFailed)),
                "corruption at byte {i} not detected"
            );
        }
    }

    #[test]
    fn test_unwrap_rejects_replay() {
        let key = static_key();
        let mut client = ControlWrap::client(&key);
        let mut server = ControlWrap::server(&key);

        let wrapped = client.wrap(&sample_packet()).unwrap();
        assert!(server.unwrap(&wrapped).is_ok());
        assert!(matches!(
            server.unwrap(&wrapped),
            Err(ProtocolError::WrapReplay)
        ));
    }

    #[test]
    fn test_wrap_ids_increment() {
        let key = static_key();
        let mut client = ControlWrap::client(&key);
        let mut server = ControlWrap::server(&key);

        for expected in 1u64..=3 {
            let wrapped = client.wrap(&sample_packet()).unwrap();
            assert_eq!(&wrapped[9..17], &expected.to_be_bytes());
            server.unwrap(&wrapped).unwrap();
        }
    }

    #[test]
    fn test_wrap_rejects_short_packet() {
        let key = static_key();
        let mut client = ControlWrap::client(&key);
        assert!(client.wrap(&[0x20, 0x01]).is_err());
    }
}
