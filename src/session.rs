//! Session identifier issuance and sandbox mapping.
//!
//! A session identifier is a capability token: possession of a valid one is
//! the only authorization this service knows about. Identifiers are 256 bits
//! of RNG output rendered as 64 lowercase hex characters, and are validated
//! before any filesystem path is derived from them.

use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::error::ApiError;

/// Raw entropy per identifier, in bytes. Doubles when rendered as hex.
const SESSION_ID_BYTES: usize = 32;

/// Length of a rendered session identifier.
pub const SESSION_ID_LEN: usize = SESSION_ID_BYTES * 2;

/// Subtree of a sandbox that holds staged files.
const OUTPUT_DIR: &str = "output";

/// Issues session identifiers and maps them to sandbox directories under a
/// single staging root. The directory named after an identifier is the only
/// record of the session; there is no side table.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    root: PathBuf,
}

impl SessionRegistry {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mint a fresh identifier: 32 random bytes, hex-encoded.
    pub fn issue(&self) -> String {
        let mut raw = [0u8; SESSION_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        hex::encode(raw)
    }

    /// A well-formed identifier is exactly 64 lowercase hex characters.
    pub fn is_valid_id(id: &str) -> bool {
        id.len() == SESSION_ID_LEN && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Map a validated identifier to its sandbox directory.
    ///
    /// Malformed identifiers are rejected here, before any I/O; the sandbox
    /// path is derived from nothing but the staging root and the identifier.
    pub fn sandbox_path(&self, id: &str) -> Result<PathBuf, ApiError> {
        if !Self::is_valid_id(id) {
            return Err(ApiError::invalid(format!(
                "malformed session identifier ({} chars)",
                id.len()
            )));
        }
        Ok(self.root.join(id))
    }

    /// The `output/` subtree of a session sandbox, where staged files land.
    pub fn output_dir(&self, id: &str) -> Result<PathBuf, ApiError> {
        Ok(self.sandbox_path(id)?.join(OUTPUT_DIR))
    }

    /// Create the `output/` subtree if absent. Idempotent.
    pub async fn ensure_output_dir(&self, id: &str) -> Result<PathBuf, ApiError> {
        let dir = self.output_dir(id)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}
