//! AEAD ciphers for the data channel
//!
//! Supports AES-256-GCM, AES-128-GCM and ChaCha20-Poly1305. Nonces are
//! built from the 4-byte data packet-id followed by an 8-byte implicit IV
//! taken from the negotiated key material, so no nonce travels on the wire
//! beyond the packet-id itself.

use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// Negotiable data channel cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherKind {
    /// AES-256-GCM - hardware accelerated on modern CPUs
    #[default]
    Aes256Gcm,
    /// AES-128-GCM
    Aes128Gcm,
    /// ChaCha20-Poly1305 - preferred for software implementations
    ChaCha20Poly1305,
}

impl CipherKind {
    /// Nonce size in bytes (96 bits for all suites)
    pub const NONCE_SIZE: usize = 12;
    /// Authentication tag size in bytes (128 bits for all suites)
    pub const TAG_SIZE: usize = 16;

    /// Key size in bytes for this cipher
    #[inline(always)]
    pub const fn key_size(&self) -> usize {
        match self {
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
            CipherKind::Aes128Gcm => 16,
        }
    }

    /// Key size in bits, as advertised in the OCC options string
    #[inline(always)]
    pub const fn key_bits(&self) -> usize {
        self.key_size() * 8
    }

    /// Parse an OpenVPN cipher name
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AES-256-GCM" => Ok(CipherKind::Aes256Gcm),
            "AES-128-GCM" => Ok(CipherKind::Aes128Gcm),
            "CHACHA20-POLY1305" => Ok(CipherKind::ChaCha20Poly1305),
            _ => Err(CryptoError::UnsupportedCipher(name.to_string())),
        }
    }

    /// OpenVPN cipher name
    pub const fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes256Gcm => "AES-256-GCM",
            CipherKind::Aes128Gcm => "AES-128-GCM",
            CipherKind::ChaCha20Poly1305 => "CHACHA20-POLY1305",
        }
    }
}

impl std::fmt::Display for CipherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One direction's data channel key: AEAD key plus implicit IV tail
pub struct DataKey {
    key: [u8; 32],
    implicit_iv: [u8; 8],
    kind: CipherKind,
}

impl DataKey {
    /// Create a data key, checking the key length against the cipher
    pub fn new(kind: CipherKind, key: &[u8], implicit_iv: [u8; 8]) -> Result<Self> {
        if key.len() < kind.key_size() {
            return Err(CryptoError::InvalidKeyLength {
                expected: kind.key_size(),
                got: key.len(),
            });
        }
        let mut buf = [0u8; 32];
        buf[..kind.key_size()].copy_from_slice(&key[..kind.key_size()]);
        Ok(Self {
            key: buf,
            implicit_iv,
            kind,
        })
    }

    /// Get the cipher this key is for
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Create a cipher instance for this key
    pub fn cipher(&self) -> AeadCipher {
        AeadCipher::new(self)
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.key.zeroize();
        self.implicit_iv.zeroize();
    }
}

enum CipherInner {
    Aes256(Box<Aes256Gcm>),
    Aes128(Box<Aes128Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

/// AEAD cipher bound to one direction's key and implicit IV
pub struct AeadCipher {
    inner: CipherInner,
    implicit_iv: [u8; 8],
    kind: CipherKind,
}

impl AeadCipher {
    /// Create a cipher instance from a data key
    pub fn new(key: &DataKey) -> Self {
        let inner = match key.kind {
            CipherKind::Aes256Gcm => {
                CipherInner::Aes256(Box::new(Aes256Gcm::new((&key.key).into())))
            }
            CipherKind::Aes128Gcm => {
                let mut short = [0u8; 16];
                short.copy_from_slice(&key.key[..16]);
                let cipher = Aes128Gcm::new((&short).into());
                short.zeroize();
                CipherInner::Aes128(Box::new(cipher))
            }
            CipherKind::ChaCha20Poly1305 => {
                CipherInner::ChaCha(Box::new(ChaCha20Poly1305::new((&key.key).into())))
            }
        };
        Self {
            inner,
            implicit_iv: key.implicit_iv,
            kind: key.kind,
        }
    }

    /// Get the cipher kind
    #[inline(always)]
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    #[inline]
    fn nonce(&self, packet_id: u32) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&packet_id.to_be_bytes());
        nonce[4..].copy_from_slice(&self.implicit_iv);
        nonce
    }

    /// Encrypt plaintext for the given packet-id
    ///
    /// Returns ciphertext with the authentication tag appended.
    #[inline]
    pub fn seal(&self, packet_id: u32, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        use aes_gcm::aead::{Aead, Payload};

        let nonce = self.nonce(packet_id);
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        match &self.inner {
            CipherInner::Aes256(cipher) => cipher.encrypt((&nonce).into(), payload),
            CipherInner::Aes128(cipher) => cipher.encrypt((&nonce).into(), payload),
            CipherInner::ChaCha(cipher) => cipher.encrypt((&nonce).into(), payload),
        }
        .map_err(|_| CryptoError::EncryptionFailed("AEAD encryption failed"))
    }

    /// Decrypt ciphertext for the given packet-id
    ///
    /// Verifies the authentication tag and returns the plaintext.
    #[inline]
    pub fn open(&self, packet_id: u32, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        use aes_gcm::aead::{Aead, Payload};

        let nonce = self.nonce(packet_id);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        match &self.inner {
            CipherInner::Aes256(cipher) => cipher.decrypt((&nonce).into(), payload),
            CipherInner::Aes128(cipher) => cipher.decrypt((&nonce).into(), payload),
            CipherInner::ChaCha(cipher) => cipher.decrypt((&nonce).into(), payload),
        }
        .map_err(|_| CryptoError::AuthTagMismatch)
    }
}

/// Sliding window for replay protection
///
/// A 64-bit bitmap tracks the last 64 packet IDs relative to the highest
/// seen. All operations are O(1).
#[derive(Debug, Default)]
pub struct ReplayWindow {
    /// Highest seen packet ID
    highest: u64,
    /// Bitmap of recently seen packets, bit 0 = highest
    bitmap: u64,
}

impl ReplayWindow {
    /// Window size in packets
    pub const WINDOW_SIZE: u64 = 64;

    /// Create an empty window
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a packet ID would be accepted, without recording it
    ///
    /// Callers that authenticate after the replay check use this first and
    /// call [`check_and_update`](Self::check_and_update) once the packet
    /// verifies, so forged packet IDs cannot poison the window.
    #[inline]
    pub fn check(&self, packet_id: u64) -> bool {
        if packet_id == 0 {
            return false;
        }
        if packet_id > self.highest {
            return true;
        }
        let diff = self.highest - packet_id;
        diff < Self::WINDOW_SIZE && self.bitmap & (1u64 << diff) == 0
    }

    /// Check whether a packet ID is fresh and record it
    ///
    /// Returns true if the packet should be processed, false if it is a
    /// replay or older than the window.
    #[inline]
    pub fn check_and_update(&mut self, packet_id: u64) -> bool {
        // Packet ID 0 is never valid, counters start at 1
        if packet_id == 0 {
            return false;
        }

        if packet_id > self.highest {
            let shift = packet_id - self.highest;
            if shift >= Self::WINDOW_SIZE {
                self.bitmap = 1;
            } else {
                self.bitmap = (self.bitmap << shift) | 1;
            }
            self.highest = packet_id;
            true
        } else {
            let diff = self.highest - packet_id;
            if diff >= Self::WINDOW_SIZE {
                return false; // Too old
            }
            let mask = 1u64 << diff;
            if self.bitmap & mask != 0 {
                return false; // Replay
            }
            self.bitmap |= mask;
            true
        }
    }

    /// Reset the window, e.g. when a key slot is retired
    pub fn reset(&mut self) {
        self.highest = 0;
        self.bitmap = 0;
    }
}
