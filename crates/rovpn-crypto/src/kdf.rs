//! OpenVPN data-channel key derivation
//!
//! Key material comes from one of two sources: the TLS keying-material
//! exporter (when both peers negotiated `tls-ekm`), or the legacy PRF over
//! the key-method-2 pre-master secret and client/server randoms. Both
//! yield a 256-byte expansion split into per-direction key blocks.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{CipherKind, CryptoError, DataKey, Result};

type HmacSha256 = Hmac<Sha256>;

/// RFC 5705 exporter label for OpenVPN data keys
pub const EXPORTER_LABEL: &[u8] = b"EXPORTER-OpenVPN-datakeys";

/// Size of the master secret
pub const MASTER_SECRET_SIZE: usize = 48;

/// Size of the full key expansion
pub const KEY_EXPANSION_SIZE: usize = 256;

const MASTER_LABEL: &[u8] = b"OpenVPN master secret";
const EXPANSION_LABEL: &[u8] = b"OpenVPN key expansion";

/// PRF for OpenVPN key expansion
///
/// P_SHA256(secret, seed) = HMAC_SHA256(secret, A(1) + seed) +
///                          HMAC_SHA256(secret, A(2) + seed) + ...
/// where A(0) = label + seed, A(i) = HMAC_SHA256(secret, A(i-1))
pub fn openvpn_prf(secret: &[u8], label: &[u8], seed: &[u8], output_len: usize) -> Result<Vec<u8>> {
    let mut combined_seed = Vec::with_capacity(label.len() + seed.len());
    combined_seed.extend_from_slice(label);
    combined_seed.extend_from_slice(seed);

    let mut output = Vec::with_capacity(output_len);
    let mut a = combined_seed.clone();

    while output.len() < output_len {
        // A(i) = HMAC(secret, A(i-1))
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| CryptoError::KeyDerivationFailed("invalid HMAC key"))?;
        mac.update(&a);
        a = mac.finalize().into_bytes().to_vec();

        // P_hash = HMAC(secret, A(i) + seed)
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| CryptoError::KeyDerivationFailed("invalid HMAC key"))?;
        mac.update(&a);
        mac.update(&combined_seed);
        output.extend_from_slice(&mac.finalize().into_bytes());
    }

    output.truncate(output_len);
    Ok(output)
}

/// Derive the 48-byte master secret from the key-method-2 material
pub fn derive_master_secret(
    pre_master: &[u8; 48],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<Zeroizing<[u8; MASTER_SECRET_SIZE]>> {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(client_random);
    seed[32..].copy_from_slice(server_random);

    let mut prf = openvpn_prf(pre_master, MASTER_LABEL, &seed, MASTER_SECRET_SIZE)?;

    let mut master = Zeroizing::new([0u8; MASTER_SECRET_SIZE]);
    master.copy_from_slice(&prf);
    prf.zeroize();
    seed.zeroize();
    Ok(master)
}

/// The 256-byte key expansion: four 64-byte blocks
///
/// Layout follows OpenVPN's `key2`: client cipher key, client HMAC key,
/// server cipher key, server HMAC key. For AEAD ciphers the HMAC blocks
/// only donate the 8-byte implicit IV.
#[derive(ZeroizeOnDrop)]
pub struct KeyBlock {
    bytes: [u8; KEY_EXPANSION_SIZE],
}

impl KeyBlock {
    /// Wrap exporter output as a key block
    pub fn from_bytes(bytes: [u8; KEY_EXPANSION_SIZE]) -> Self {
        Self { bytes }
    }

    /// Derive the key block from the master secret
    pub fn from_master(
        master: &[u8; MASTER_SECRET_SIZE],
        client_random: &[u8; 32],
        server_random: &[u8; 32],
        client_session_id: &[u8; 8],
        server_session_id: &[u8; 8],
    ) -> Result<Self> {
        let mut seed = [0u8; 80];
        seed[..32].copy_from_slice(client_random);
        seed[32..64].copy_from_slice(server_random);
        seed[64..72].copy_from_slice(client_session_id);
        seed[72..].copy_from_slice(server_session_id);

        let mut prf = openvpn_prf(master, EXPANSION_LABEL, &seed, KEY_EXPANSION_SIZE)?;

        let mut bytes = [0u8; KEY_EXPANSION_SIZE];
        bytes.copy_from_slice(&prf);
        prf.zeroize();
        seed.zeroize();
        Ok(Self { bytes })
    }

    /// Client-direction data key (client encrypts with this)
    pub fn client_key(&self, kind: CipherKind) -> Result<DataKey> {
        self.direction_key(kind, 0)
    }

    /// Server-direction data key (server encrypts with this)
    pub fn server_key(&self, kind: CipherKind) -> Result<DataKey> {
        self.direction_key(kind, 1)
    }

    fn direction_key(&self, kind: CipherKind, dir: usize) -> Result<DataKey> {
        let cipher_off = dir * 128;
        let hmac_off = cipher_off + 64;

        let mut iv = [0u8; 8];
        iv.copy_from_slice(&self.bytes[hmac_off..hmac_off + 8]);

        DataKey::new(kind, &self.bytes[cipher_off..cipher_off + kind.key_size()], iv)
    }
}
