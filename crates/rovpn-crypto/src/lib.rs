//! rovpn cryptographic primitives
//!
//! This crate provides the cryptographic foundation for rovpn, using only
//! audited, pure-Rust implementations. No OpenSSL dependency.
//!
//! # Security Principles
//! - All key material implements `Zeroize` for secure memory clearing
//! - Constant-time comparisons for all authentication operations
//! - No custom cryptography - only well-audited implementations

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cipher;
pub mod error;
pub mod kdf;
pub mod static_key;

pub use cipher::{AeadCipher, CipherKind, DataKey, ReplayWindow};
pub use error::{CryptoError, Result};
pub use kdf::{derive_master_secret, openvpn_prf, KeyBlock, EXPORTER_LABEL, KEY_EXPANSION_SIZE};
pub use static_key::{StaticKey, TlsCryptKey, STATIC_KEY_SIZE};

/// Securely generate random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut buf);
    buf
}

/// Generate a cryptographically secure session ID
pub fn generate_session_id() -> [u8; 8] {
    random_bytes()
}
