use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
};

use crate::{Error, Result};

pub const FRAMING_VERSION: u8 = 0x02;
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 24;
pub const SALT_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const FRAMING_OVERHEAD_BYTES: usize = 1 + SALT_LEN + TAG_LEN;

/// Parts and metadata blobs are encrypted in memory, so a single plaintext is
/// bounded well below what the cipher itself allows.
pub const MAX_PLAINTEXT_BYTES: u64 = 64 * 1024 * 1024;

/// Symmetric encryption keyed by a derived key + iv pair.
pub trait Encoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn max_plaintext_size(&self) -> u64;

    fn encrypt(&self, key: &[u8], iv: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, key: &[u8], iv: &[u8], aad: &[u8], framed: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XChaChaEncoder;

impl Encoder for XChaChaEncoder {
    fn name(&self) -> &'static str {
        "xchacha20poly1305"
    }

    fn max_plaintext_size(&self) -> u64 {
        MAX_PLAINTEXT_BYTES
    }

    fn encrypt(&self, key: &[u8], iv: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() as u64 > self.max_plaintext_size() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "plaintext too large: {} > {} bytes",
                    plaintext.len(),
                    self.max_plaintext_size()
                ),
            });
        }
        encrypt_framed(key, iv, aad, plaintext)
    }

    fn decrypt(&self, key: &[u8], iv: &[u8], aad: &[u8], framed: &[u8]) -> Result<Vec<u8>> {
        decrypt_framed(key, iv, aad, framed)
    }
}

/// Frame: `version || salt || ciphertext+tag`. The nonce is `iv XOR salt`, so a
/// deterministic iv never repeats a nonce across encryptions.
pub fn encrypt_framed(key: &[u8], iv: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let salt: XNonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let nonce = nonce_for(iv, salt.as_slice())?;

    let mut buffer = plaintext.to_vec();
    cipher
        .encrypt_in_place(&nonce, aad, &mut buffer)
        .map_err(|_| Error::Crypto)?;

    let mut out = Vec::with_capacity(1 + SALT_LEN + buffer.len());
    out.push(FRAMING_VERSION);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&buffer);
    Ok(out)
}

pub fn decrypt_framed(key: &[u8], iv: &[u8], aad: &[u8], framed: &[u8]) -> Result<Vec<u8>> {
    if framed.len() < FRAMING_OVERHEAD_BYTES {
        return Err(Error::Crypto);
    }
    if framed[0] != FRAMING_VERSION {
        return Err(Error::Crypto);
    }

    let cipher = cipher_for(key)?;
    let nonce = nonce_for(iv, &framed[1..1 + SALT_LEN])?;

    let mut buffer = framed[1 + SALT_LEN..].to_vec();
    cipher
        .decrypt_in_place(&nonce, aad, &mut buffer)
        .map_err(|_| Error::Crypto)?;
    Ok(buffer)
}

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305> {
    XChaCha20Poly1305::new_from_slice(key).map_err(|_| Error::Crypto)
}

fn nonce_for(iv: &[u8], salt: &[u8]) -> Result<XNonce> {
    if iv.len() != IV_LEN || salt.len() != SALT_LEN {
        return Err(Error::Crypto);
    }
    let mut nonce = [0u8; IV_LEN];
    for (i, byte) in nonce.iter_mut().enumerate() {
        *byte = iv[i] ^ salt[i];
    }
    Ok(XNonce::clone_from_slice(&nonce))
}
