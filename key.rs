//! 256-bit symmetric keys for the block-cipher filter.
//!
//! ## Security Features
//!
//! - Key bytes are zeroized on drop (via `Zeroize` trait)
//! - Key files are created with Unix permissions 0600 (owner read/write only)
//! - Cryptographically secure random generation via `OsRng`

use anyhow::{bail, Context, Result};
use rand_core::{OsRng, RngCore};
use std::fmt;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::error::StreamError;

/// Key length shared by AES-256-GCM and ChaCha20-Poly1305
pub const KEY_LEN: usize = 32;

/// Key material handed to a cipher filter once at construction.
pub struct SymmetricKey {
    key_bytes: [u8; KEY_LEN],
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.key_bytes.zeroize();
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut key_bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key_bytes);
        Self { key_bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, StreamError> {
        let key_bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| StreamError::InvalidKey {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self { key_bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key_bytes
    }

    /// Loads the key stored at `path`, generating and persisting a new one
    /// if the file does not exist.
    pub async fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if fs::try_exists(path)
            .await
            .with_context(|| format!("checking existence of {}", path.display()))?
        {
            info!(path = %path.display(), "loading existing key");
            let mut data = fs::read(path)
                .await
                .with_context(|| format!("reading key from {}", path.display()))?;
            if data.len() != KEY_LEN {
                warn!(path = %path.display(), found_bytes = data.len(), "invalid key size");
                let found = data.len();
                data.zeroize();
                bail!(
                    "expected {}-byte key at {} but found {} bytes",
                    KEY_LEN,
                    path.display(),
                    found
                );
            }
            let key = Self::from_slice(&data)?;
            data.zeroize();
            return Ok(key);
        }

        info!(path = %path.display(), "generating new key");
        let key = Self::generate();

        #[cfg(unix)]
        {
            let path_buf = path.to_path_buf();
            let key_bytes = key.key_bytes;
            tokio::task::spawn_blocking(move || {
                use std::fs::OpenOptions;
                use std::io::Write;
                use std::os::unix::fs::OpenOptionsExt;

                let mut key_bytes = key_bytes;
                let written = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(&path_buf)
                    .and_then(|mut f| f.write_all(&key_bytes));
                key_bytes.zeroize();
                written
            })
            .await?
            .with_context(|| format!("writing key to {}", path.display()))?;
        }
        #[cfg(not(unix))]
        {
            fs::write(path, key.as_bytes())
                .await
                .with_context(|| format!("writing key to {}", path.display()))?;
        }

        Ok(key)
    }
}
