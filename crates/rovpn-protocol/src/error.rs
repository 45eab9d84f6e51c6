//! Protocol error types

use thiserror::Error;

use crate::OpCode;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket IO failure
    #[error("transport IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected EOF or connection reset on the carrier
    #[error("transport closed by peer")]
    TransportClosed,

    /// A read ran past the end of the packet
    #[error("packet truncated: expected at least {expected} more bytes, got {got}")]
    Truncated {
        /// Bytes the field needed
        expected: usize,
        /// Bytes left in the buffer
        got: usize,
    },

    /// Malformed header or field
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Unknown opcode
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),

    /// Operation not allowed in the current protocol phase
    #[error("invalid protocol state: {0}")]
    InvalidState(&'static str),

    /// An opcode was claimed by two demuxer consumers
    #[error("opcode already registered: {0}")]
    OpcodeAlreadyRegistered(OpCode),

    /// Control channel send window is saturated
    #[error("control send window full")]
    WindowFull,

    /// Control channel retransmission budget exhausted
    #[error("control channel timed out")]
    ControlTimeout,

    /// tls-crypt authentication failure
    #[error("control wrap authentication failed")]
    WrapAuthFailed,

    /// tls-crypt replay detected
    #[error("control wrap replay detected")]
    WrapReplay,

    /// TLS handshake failure
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Server rejected our credentials
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Missing or unparseable negotiation option
    #[error("options error: {0}")]
    OptionsFormat(String),

    /// Data packet-id replayed or older than the window
    #[error("data packet replay detected")]
    Replay,

    /// Data packet failed AEAD authentication
    #[error("data packet authentication tag mismatch")]
    AuthTagMismatch,

    /// Data packet carried an unexpected peer-id
    #[error("unknown peer-id: {0}")]
    UnknownPeerId(u32),

    /// Data channel used before keys were negotiated
    #[error("data cipher not negotiated")]
    CipherNotNegotiated,

    /// Caller cancelled a suspending operation
    #[error("operation cancelled")]
    Cancelled,

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] rovpn_crypto::CryptoError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] rovpn_config::ConfigError),
}
