//! Cryptographic error types

use thiserror::Error;

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Cryptographic errors
///
/// Uses `&'static str` for error messages on hot paths to avoid allocations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        got: usize,
    },

    /// Encryption failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(&'static str),

    /// Decryption failed (authentication tag mismatch)
    #[error("decryption failed: authentication tag mismatch")]
    AuthTagMismatch,

    /// HMAC verification failed
    #[error("HMAC verification failed")]
    HmacVerificationFailed,

    /// Replay attack detected
    #[error("replay detected: packet ID already seen or too old")]
    ReplayDetected,

    /// Key derivation failed
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(&'static str),

    /// Cipher name not supported
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// Invalid OpenVPN static key
    #[error("invalid static key: {0}")]
    InvalidStaticKey(String),
}
