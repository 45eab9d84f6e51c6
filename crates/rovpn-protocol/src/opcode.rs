//! Session packet opcodes
//!
//! The first byte of every session packet packs the opcode into the high
//! 5 bits and the key ID into the low 3.

use crate::{ProtocolError, Result};

/// Combine an opcode and key ID into the leading packet byte
///
/// Only the low 5 bits of `opcode` and the low 3 bits of `key_id` are used.
#[inline(always)]
pub const fn combine(opcode: u8, key_id: u8) -> u8 {
    ((opcode & 0x1F) << 3) | (key_id & 0x07)
}

/// Split the leading packet byte into (opcode, key_id)
#[inline(always)]
pub const fn split(byte: u8) -> (u8, u8) {
    (byte >> 3, byte & 0x07)
}

/// Session packet opcode (high 5 bits of the first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Control channel packet with reliability layer (P_CONTROL_V1)
    ControlV1 = 4,

    /// Acknowledgment packet (P_ACK_V1)
    AckV1 = 5,

    /// Data channel packet without peer-id (P_DATA_V1)
    DataV1 = 6,

    /// Hard reset from client v2 (P_CONTROL_HARD_RESET_CLIENT_V2)
    HardResetClientV2 = 7,

    /// Hard reset from server v2 (P_CONTROL_HARD_RESET_SERVER_V2)
    HardResetServerV2 = 8,

    /// Data channel packet with peer-id (P_DATA_V2)
    DataV2 = 9,
}

impl OpCode {
    /// Parse the opcode from the leading packet byte
    pub fn from_byte(byte: u8) -> Result<Self> {
        let (opcode, _) = split(byte);
        match opcode {
            4 => Ok(OpCode::ControlV1),
            5 => Ok(OpCode::AckV1),
            6 => Ok(OpCode::DataV1),
            7 => Ok(OpCode::HardResetClientV2),
            8 => Ok(OpCode::HardResetServerV2),
            9 => Ok(OpCode::DataV2),
            _ => Err(ProtocolError::UnknownOpcode(opcode)),
        }
    }

    /// Build the leading packet byte for this opcode and key ID
    pub const fn to_byte(self, key_id: KeyId) -> u8 {
        combine(self as u8, key_id.0)
    }

    /// Whether this opcode travels on the control channel
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            OpCode::ControlV1 | OpCode::AckV1 | OpCode::HardResetClientV2 | OpCode::HardResetServerV2
        )
    }

    /// Whether this opcode travels on the data channel
    pub fn is_data(&self) -> bool {
        matches!(self, OpCode::DataV1 | OpCode::DataV2)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpCode::ControlV1 => write!(f, "P_CONTROL_V1"),
            OpCode::AckV1 => write!(f, "P_ACK_V1"),
            OpCode::DataV1 => write!(f, "P_DATA_V1"),
            OpCode::HardResetClientV2 => write!(f, "P_CONTROL_HARD_RESET_CLIENT_V2"),
            OpCode::HardResetServerV2 => write!(f, "P_CONTROL_HARD_RESET_SERVER_V2"),
            OpCode::DataV2 => write!(f, "P_DATA_V2"),
        }
    }
}

/// Key ID (low 3 bits of the first byte)
///
/// Identifies the key slot a packet belongs to, allowing renegotiation
/// without interrupting traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyId(pub u8);

impl KeyId {
    /// Create a new key ID (masked to 3 bits)
    pub const fn new(id: u8) -> Self {
        Self(id & 0x07)
    }

    /// Parse the key ID from the leading packet byte
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte & 0x07)
    }

    /// Get the next key ID (wraps around)
    pub const fn next(&self) -> Self {
        Self((self.0 + 1) & 0x07)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_split_exhaustive() {
        for opcode in 0..=31u8 {
            for key_id in 0..=7u8 {
                assert_eq!(split(combine(opcode, key_id)), (opcode, key_id));
            }
        }
    }

    #[test]
    fn test_opcode_roundtrip() {
        let key_id = KeyId::new(3);

        for opcode in [
            OpCode::ControlV1,
            OpCode::AckV1,
            OpCode::DataV1,
            OpCode::HardResetClientV2,
            OpCode::HardResetServerV2,
            OpCode::DataV2,
        ] {
            let byte = opcode.to_byte(key_id);
            assert_eq!(OpCode::from_byte(byte).unwrap(), opcode);
            assert_eq!(KeyId::from_byte(byte), key_id);
        }
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(matches!(
            OpCode::from_byte(combine(1, 0)),
            Err(ProtocolError::UnknownOpcode(1))
        ));
    }

    #[test]
    fn test_key_id_wrap() {
        assert_eq!(KeyId::new(7).next(), KeyId::new(0));
    }
}
