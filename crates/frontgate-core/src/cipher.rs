//! AES address cipher.
//!
//! Backend addresses travel as encrypted tokens. Both modes pad the plaintext
//! to the AES block size with PKCS#7-style padding (a full extra block when
//! the input is already aligned) and run the block primitive over every
//! block independently:
//!
//! - [`CipherMode::Chained`]: the secret's raw bytes are the key and the
//!   ciphertext is carried as standard base64.
//! - [`CipherMode::Ecb`]: the secret is hex text and so is the ciphertext.
//!   Empty plaintext is refused.

use crate::error::{GateError, GateResult};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// How address tokens are keyed and transported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherMode {
    /// Raw-byte key, base64 ciphertext.
    #[default]
    Chained,
    /// Hex key, hex ciphertext.
    Ecb,
}

impl std::str::FromStr for CipherMode {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chained" => Ok(CipherMode::Chained),
            "ecb" => Ok(CipherMode::Ecb),
            other => Err(GateError::Config(format!("unknown cipher mode: {other}"))),
        }
    }
}

/// The block primitive, sized by key length.
enum BlockKey {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl BlockKey {
    fn new(key: &[u8]) -> GateResult<Self> {
        let invalid = |_| GateError::Config(format!("invalid AES key length: {}", key.len()));
        match key.len() {
            16 => Aes128::new_from_slice(key).map(BlockKey::Aes128).map_err(invalid),
            24 => Aes192::new_from_slice(key).map(BlockKey::Aes192).map_err(invalid),
            32 => Aes256::new_from_slice(key).map(BlockKey::Aes256).map_err(invalid),
            n => Err(GateError::Config(format!(
                "invalid AES key length: {n} (expected 16, 24 or 32 bytes)"
            ))),
        }
    }

    /// Encrypt `buf` in place. `buf.len()` must be a multiple of [`BLOCK_SIZE`].
    fn encrypt_blocks(&self, buf: &mut [u8]) {
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                BlockKey::Aes128(c) => c.encrypt_block(block),
                BlockKey::Aes192(c) => c.encrypt_block(block),
                BlockKey::Aes256(c) => c.encrypt_block(block),
            }
        }
    }

    /// Decrypt `buf` in place. `buf.len()` must be a multiple of [`BLOCK_SIZE`].
    fn decrypt_blocks(&self, buf: &mut [u8]) {
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                BlockKey::Aes128(c) => c.decrypt_block(block),
                BlockKey::Aes192(c) => c.decrypt_block(block),
                BlockKey::Aes256(c) => c.decrypt_block(block),
            }
        }
    }
}

/// Encrypts and decrypts backend address tokens with a fixed key.
pub struct AddressCipher {
    mode: CipherMode,
    key: BlockKey,
}

impl std::fmt::Debug for AddressCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressCipher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl AddressCipher {
    /// Build a cipher from the configured secret.
    ///
    /// In [`CipherMode::Chained`] the secret's bytes are used directly; in
    /// [`CipherMode::Ecb`] the secret is hex-decoded first. The resulting key
    /// must be 16, 24 or 32 bytes long.
    pub fn new(mode: CipherMode, secret: &str) -> GateResult<Self> {
        let key_bytes = match mode {
            CipherMode::Chained => secret.as_bytes().to_vec(),
            CipherMode::Ecb => hex::decode(secret.trim()).map_err(|_| {
                GateError::Config("key error, ECB mode expects a hex AES key".into())
            })?,
        };
        Ok(Self {
            mode,
            key: BlockKey::new(&key_bytes)?,
        })
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Encrypt a plaintext address into its transport form.
    pub fn encrypt(&self, plaintext: &str) -> GateResult<String> {
        if self.mode == CipherMode::Ecb && plaintext.is_empty() {
            return Err(GateError::Format("plaintext is empty".into()));
        }

        let mut buf = pad(plaintext.as_bytes());
        self.key.encrypt_blocks(&mut buf);

        Ok(match self.mode {
            CipherMode::Chained => BASE64.encode(&buf),
            CipherMode::Ecb => hex::encode(&buf),
        })
    }

    /// Decrypt a transport-form token back into the plaintext address.
    ///
    /// Every malformed input is an error value: bad base64/hex, a ciphertext
    /// that is empty or not block aligned, an out-of-range pad count, or a
    /// plaintext that is not UTF-8.
    pub fn decrypt(&self, ciphertext: &[u8]) -> GateResult<String> {
        let mut buf = match self.mode {
            CipherMode::Chained => BASE64
                .decode(ciphertext)
                .map_err(|e| GateError::Format(format!("invalid base64 ciphertext: {e}")))?,
            CipherMode::Ecb => hex::decode(ciphertext)
                .map_err(|e| GateError::Format(format!("invalid hex ciphertext: {e}")))?,
        };

        if buf.is_empty() || buf.len() % BLOCK_SIZE != 0 {
            return Err(GateError::Format(format!(
                "input not full blocks: {} bytes",
                buf.len()
            )));
        }

        self.key.decrypt_blocks(&mut buf);
        let plain = unpad(buf)?;

        String::from_utf8(plain)
            .map_err(|_| GateError::Decrypt("plaintext is not valid UTF-8".into()))
    }
}

/// Pad to a whole number of blocks; the pad byte is the pad length.
fn pad(data: &[u8]) -> Vec<u8> {
    let padding = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + padding);
    out.extend_from_slice(data);
    out.resize(data.len() + padding, padding as u8);
    out
}

/// Strip padding using the trailing byte as the pad count.
fn unpad(mut data: Vec<u8>) -> GateResult<Vec<u8>> {
    let padding = match data.last() {
        Some(&b) => b as usize,
        None => return Err(GateError::Decrypt("empty plaintext".into())),
    };
    if padding == 0 || padding > BLOCK_SIZE || padding > data.len() {
        return Err(GateError::Decrypt(format!("invalid padding length {padding}")));
    }
    data.truncate(data.len() - padding);
    Ok(data)
}
