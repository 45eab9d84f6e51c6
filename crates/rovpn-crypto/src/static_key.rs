//! OpenVPN "Static key V1" material and the tls-crypt primitive
//!
//! The static key file carries 256 bytes, hex-encoded between PEM-style
//! markers. tls-crypt splits it into two 128-byte halves, one per
//! direction: the client encrypts with the first half and decrypts with
//! the second, the server the reverse. Each half contributes an
//! AES-256-CTR key and an HMAC-SHA256 key.

use aes::Aes256;
use aes::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

use crate::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// Size of the decoded static key
pub const STATIC_KEY_SIZE: usize = 256;

const PEM_HEADER: &str = "-----BEGIN OpenVPN Static key V1-----";
const PEM_FOOTER: &str = "-----END OpenVPN Static key V1-----";

/// A 2048-bit OpenVPN static key
#[derive(ZeroizeOnDrop)]
pub struct StaticKey {
    bytes: [u8; STATIC_KEY_SIZE],
}

impl StaticKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; STATIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Parse the OpenVPN "Static key V1" PEM-style block
    ///
    /// The body between the markers is hex, conventionally 16 lines of 32
    /// bytes each. Comment lines before the header are ignored.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let start = pem
            .find(PEM_HEADER)
            .ok_or_else(|| CryptoError::InvalidStaticKey("missing header".to_string()))?
            + PEM_HEADER.len();
        let end = pem[start..]
            .find(PEM_FOOTER)
            .ok_or_else(|| CryptoError::InvalidStaticKey("missing footer".to_string()))?
            + start;

        let mut bytes = [0u8; STATIC_KEY_SIZE];
        let mut n = 0;
        let mut hi: Option<u8> = None;

        for c in pem[start..end].chars() {
            if c.is_ascii_whitespace() {
                continue;
            }
            let nibble = c
                .to_digit(16)
                .ok_or_else(|| CryptoError::InvalidStaticKey(format!("non-hex character {c:?}")))?
                as u8;
            match hi.take() {
                None => hi = Some(nibble),
                Some(h) => {
                    if n == STATIC_KEY_SIZE {
                        return Err(CryptoError::InvalidStaticKey("key longer than 256 bytes".to_string()));
                    }
                    bytes[n] = (h << 4) | nibble;
                    n += 1;
                }
            }
        }

        if hi.is_some() {
            return Err(CryptoError::InvalidStaticKey("odd number of hex digits".to_string()));
        }
        if n != STATIC_KEY_SIZE {
            return Err(CryptoError::InvalidStaticKey(format!(
                "expected {STATIC_KEY_SIZE} bytes, got {n}"
            )));
        }

        Ok(Self { bytes })
    }

    /// Raw key length in bytes
    pub fn len(&self) -> usize {
        STATIC_KEY_SIZE
    }

    /// Static keys are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// tls-crypt keys for the client role: (encrypt, decrypt)
    pub fn client_wrap_keys(&self) -> (TlsCryptKey, TlsCryptKey) {
        (self.half_key(0), self.half_key(1))
    }

    /// tls-crypt keys for the server role: (encrypt, decrypt)
    pub fn server_wrap_keys(&self) -> (TlsCryptKey, TlsCryptKey) {
        (self.half_key(1), self.half_key(0))
    }

    fn half_key(&self, half: usize) -> TlsCryptKey {
        let base = half * 128;
        let mut cipher_key = [0u8; 32];
        let mut hmac_key = [0u8; 32];
        cipher_key.copy_from_slice(&self.bytes[base..base + 32]);
        hmac_key.copy_from_slice(&self.bytes[base + 64..base + 96]);
        TlsCryptKey {
            cipher_key,
            hmac_key,
        }
    }
}

/// One direction of tls-crypt: AES-256-CTR + HMAC-SHA256
///
/// The construction is SIV-like: the HMAC is computed over the cleartext
/// packet header and the plaintext, and its first 16 bytes serve as the
/// CTR IV. The tag therefore doubles as the nonce and must travel with
/// the packet.
#[derive(ZeroizeOnDrop)]
pub struct TlsCryptKey {
    cipher_key: [u8; 32],
    hmac_key: [u8; 32],
}

impl TlsCryptKey {
    /// HMAC tag size in bytes
    pub const TAG_SIZE: usize = 32;

    /// Create from raw keys
    pub fn new(cipher_key: [u8; 32], hmac_key: [u8; 32]) -> Self {
        Self {
            cipher_key,
            hmac_key,
        }
    }

    fn mac(&self, header: &[u8], plaintext: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key)
            .expect("HMAC key size is always valid");
        mac.update(header);
        mac.update(plaintext);
        mac.finalize().into_bytes().into()
    }

    fn keystream(&self, tag: &[u8; 32], buf: &mut [u8]) {
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&tag[..16]);
        let mut ctr = Aes256Ctr::new((&self.cipher_key).into(), (&iv).into());
        ctr.apply_keystream(buf);
    }

    /// Authenticate and encrypt a control packet body
    ///
    /// Returns the 32-byte tag and the ciphertext; the caller places them
    /// after the cleartext header on the wire. The tag doubles as the CTR
    /// IV, so it must reach the peer unmodified.
    pub fn seal(&self, header: &[u8], plaintext: &[u8]) -> ([u8; 32], Vec<u8>) {
        let tag = self.mac(header, plaintext);

        let mut ciphertext = plaintext.to_vec();
        self.keystream(&tag, &mut ciphertext);

        (tag, ciphertext)
    }

    /// Decrypt a control packet body and verify its tag (constant-time)
    pub fn open(&self, header: &[u8], tag: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let tag: [u8; 32] = tag
            .try_into()
            .map_err(|_| CryptoError::HmacVerificationFailed)?;

        let mut plaintext = ciphertext.to_vec();
        self.keystream(&tag, &mut plaintext);

        let computed = self.mac(header, &plaintext);
        if bool::from(computed.ct_eq(&tag)) {
            Ok(plaintext)
        } else {
            Err(CryptoError::HmacVerificationFailed)
        }
    }
}
