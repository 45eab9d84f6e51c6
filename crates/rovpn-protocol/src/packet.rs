//! Session packet envelope
//!
//! Serialization and parsing of the header shared by every packet on the
//! session: the opcode/key-id byte, then per-family fields. Control
//! packets carry the 8-byte session ID, an ACK vector and a message ID;
//! data packets carry at most a 3-byte peer-id before the ciphertext.

use bytes::Bytes;

use crate::codec::{PacketReader, PacketWriter};
use crate::{KeyId, OpCode, ProtocolError, Result};

/// Session ID (8 random bytes chosen per endpoint)
pub type SessionId = [u8; 8];

/// Maximum ACK ids carried by one control packet
pub const MAX_ACKS: usize = 8;

/// Header fields of a control channel packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlHeader {
    /// Control opcode (ControlV1, AckV1 or a hard reset)
    pub opcode: OpCode,
    /// Key slot
    pub key_id: KeyId,
    /// Sender's session ID
    pub session_id: SessionId,
    /// Acknowledged message IDs, at most [`MAX_ACKS`]
    pub acks: Vec<u32>,
    /// Peer's session ID, present exactly when `acks` is non-empty
    pub remote_session_id: Option<SessionId>,
    /// This packet's message ID; absent for AckV1
    pub message_id: Option<u32>,
}

/// Header fields of a data channel packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Data opcode (DataV1 or DataV2)
    pub opcode: OpCode,
    /// Key slot
    pub key_id: KeyId,
    /// Peer-id assigned by the server, present exactly for DataV2
    pub peer_id: Option<u32>,
}

/// Parsed session packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPacketHeader {
    /// Control channel family
    Control(ControlHeader),
    /// Data channel family
    Data(DataHeader),
}

impl SessionPacketHeader {
    /// Get the opcode
    pub fn opcode(&self) -> OpCode {
        match self {
            SessionPacketHeader::Control(h) => h.opcode,
            SessionPacketHeader::Data(h) => h.opcode,
        }
    }

    /// Get the key ID
    pub fn key_id(&self) -> KeyId {
        match self {
            SessionPacketHeader::Control(h) => h.key_id,
            SessionPacketHeader::Data(h) => h.key_id,
        }
    }
}

/// A session packet: header plus opaque payload
///
/// The payload is `Bytes`, so fanning one packet out to several consumers
/// is an explicit, cheap clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPacket {
    /// Parsed header
    pub header: SessionPacketHeader,
    /// Payload following the header fields
    pub payload: Bytes,
}

impl SessionPacket {
    /// Parse a session packet from the wire
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(data);
        let first = r.read_u8()?;
        let opcode = OpCode::from_byte(first)?;
        let key_id = KeyId::from_byte(first);

        if opcode.is_data() {
            let peer_id = if opcode == OpCode::DataV2 {
                Some(r.read_u24()?)
            } else {
                None
            };
            return Ok(Self {
                header: SessionPacketHeader::Data(DataHeader {
                    opcode,
                    key_id,
                    peer_id,
                }),
                payload: Bytes::copy_from_slice(r.rest()),
            });
        }

        let session_id: SessionId = r.read_array()?;

        let ack_count = r.read_u8()? as usize;
        if ack_count > MAX_ACKS {
            return Err(ProtocolError::Malformed(format!(
                "ack count {ack_count} exceeds {MAX_ACKS}"
            )));
        }
        let mut acks = Vec::with_capacity(ack_count);
        for _ in 0..ack_count {
            acks.push(r.read_u32()?);
        }
        let remote_session_id = if ack_count > 0 {
            Some(r.read_array()?)
        } else {
            None
        };

        let message_id = if opcode == OpCode::AckV1 {
            None
        } else {
            Some(r.read_u32()?)
        };

        Ok(Self {
            header: SessionPacketHeader::Control(ControlHeader {
                opcode,
                key_id,
                session_id,
                acks,
                remote_session_id,
                message_id,
            }),
            payload: Bytes::copy_from_slice(r.rest()),
        })
    }

    /// Parse only if the leading opcode matches `expected`
    ///
    /// Returns `Ok(None)` when the packet is well-formed enough to carry a
    /// different opcode, letting callers peek-then-commit without treating
    /// a mismatch as an error.
    pub fn try_parse_expecting(expected: OpCode, data: &[u8]) -> Result<Option<Self>> {
        let first = *data.first().ok_or(ProtocolError::Truncated {
            expected: 1,
            got: 0,
        })?;
        if OpCode::from_byte(first)? != expected {
            return Ok(None);
        }
        Self::parse(data).map(Some)
    }

    /// Serialize the packet for the wire
    pub fn serialize(&self) -> Result<Bytes> {
        let mut w = PacketWriter::with_capacity(32 + self.payload.len());

        match &self.header {
            SessionPacketHeader::Control(h) => {
                if h.acks.len() > MAX_ACKS {
                    return Err(ProtocolError::Malformed(format!(
                        "ack count {} exceeds {MAX_ACKS}",
                        h.acks.len()
                    )));
                }
                if !h.acks.is_empty() && h.remote_session_id.is_none() {
                    return Err(ProtocolError::Malformed(
                        "acks present without remote session id".into(),
                    ));
                }

                w.write_u8(h.opcode.to_byte(h.key_id));
                w.write_bytes(&h.session_id);
                w.write_u8(h.acks.len() as u8);
                for ack in &h.acks {
                    w.write_u32(*ack);
                }
                if !h.acks.is_empty() {
                    if let Some(remote) = &h.remote_session_id {
                        w.write_bytes(remote);
                    }
                }
                if let Some(id) = h.message_id {
                    w.write_u32(id);
                }
            }
            SessionPacketHeader::Data(h) => {
                w.write_u8(h.opcode.to_byte(h.key_id));
                if let Some(peer_id) = h.peer_id {
                    w.write_u24(peer_id);
                }
            }
        }

        w.write_bytes(&self.payload);
        Ok(w.freeze())
    }

    /// Get the opcode
    pub fn opcode(&self) -> OpCode {
        self.header.opcode()
    }
}
