//! Encrypted credential vault.
//!
//! Session credentials for the chat socket are stored as ciphertext only.
//! Each encryption derives a fresh 256-bit key from the process master key
//! via Argon2id with a random salt, then seals the blob with
//! ChaCha20-Poly1305 (96-bit nonce, 128-bit tag). The on-wire form is
//! `salt:nonce:tag:ciphertext`, each part base64.
//!
//! Two encryptions of the same plaintext never produce the same output:
//! both the salt and the nonce are drawn fresh per call.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use std::fs;
use std::path::Path;

/// Argon2id salt length in bytes.
const SALT_LEN: usize = 16;

/// ChaCha20-Poly1305 nonce length in bytes (96-bit).
const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag length in bytes (128-bit).
const TAG_LEN: usize = 16;

/// Derived key length in bytes (256-bit).
const KEY_LEN: usize = 32;

/// Separator between the base64 parts of the on-wire form.
const SEP: char = ':';

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Ciphertext is structurally invalid and was rejected before any
    /// decryption attempt.
    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    /// Authentication failed: wrong master key or tampered data.
    #[error("decryption failed: wrong key or tampered data")]
    Integrity,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Process-wide vault. The master key is loaded once at boot and read-only
/// afterwards.
#[derive(Clone)]
pub struct CredentialVault {
    master_key: Vec<u8>,
}

impl CredentialVault {
    pub fn new(master_key: Vec<u8>) -> Self {
        Self { master_key }
    }

    /// Load the master key from `key_path`, creating a random one on first
    /// boot. The file is written with owner-only permissions on Unix.
    pub fn load_or_create(key_path: &Path) -> Result<Self> {
        let master_key = if key_path.exists() {
            let raw = fs::read_to_string(key_path).context("Failed to read vault key file")?;
            B64.decode(raw.trim()).context("Vault key file is corrupt")?
        } else {
            let mut key = vec![0u8; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            if let Some(parent) = key_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(key_path, B64.encode(&key)).context("Failed to write vault key file")?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))
                    .context("Failed to set vault key file permissions")?;
            }

            key
        };
        Ok(Self { master_key })
    }

    /// Encrypt an opaque credential blob. Returns `salt:nonce:tag:ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let key = self.derive_key(&salt)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| VaultError::Integrity)?;

        // The AEAD output is ciphertext ‖ tag; the wire form keeps them apart.
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}{SEP}{}{SEP}{}{SEP}{}",
            B64.encode(salt),
            B64.encode(nonce),
            B64.encode(tag),
            B64.encode(body),
        ))
    }

    /// Decrypt a value produced by [`encrypt`](Self::encrypt). Malformed or
    /// truncated input is rejected before any decryption attempt.
    pub fn decrypt(&self, value: &str) -> Result<Vec<u8>, VaultError> {
        let (salt, nonce, tag, body) = parse_wire(value)?;

        let key = self.derive_key(&salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

        let mut sealed = body;
        sealed.extend_from_slice(&tag);

        cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map_err(|_| VaultError::Integrity)
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_LEN], VaultError> {
        let mut key = [0u8; KEY_LEN];
        argon2::Argon2::default()
            .hash_password_into(&self.master_key, salt, &mut key)
            .map_err(|e| VaultError::Other(anyhow::anyhow!("key derivation failed: {e}")))?;
        Ok(key)
    }
}

/// Split and validate the `salt:nonce:tag:ciphertext` wire form.
fn parse_wire(value: &str) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>), VaultError> {
    let parts: Vec<&str> = value.split(SEP).collect();
    if parts.len() != 4 {
        return Err(VaultError::Malformed(format!(
            "expected 4 parts, got {}",
            parts.len()
        )));
    }

    let decode = |label: &str, part: &str| {
        B64.decode(part)
            .map_err(|_| VaultError::Malformed(format!("{label} is not valid base64")))
    };

    let salt = decode("salt", parts[0])?;
    let nonce = decode("nonce", parts[1])?;
    let tag = decode("tag", parts[2])?;
    let body = decode("ciphertext", parts[3])?;

    if salt.len() != SALT_LEN {
        return Err(VaultError::Malformed(format!(
            "salt must be {SALT_LEN} bytes, got {}",
            salt.len()
        )));
    }
    if nonce.len() != NONCE_LEN {
        return Err(VaultError::Malformed(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }
    if tag.len() != TAG_LEN {
        return Err(VaultError::Malformed(format!(
            "tag must be {TAG_LEN} bytes, got {}",
            tag.len()
        )));
    }

    Ok((salt, nonce, tag, body))
}
