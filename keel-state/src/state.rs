//! State documents and the store interface
//!
//! A state document is an opaque JSON blob. The only field this crate reads
//! is the top-level `serial`, the writer's own monotonic version counter.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::backend::{BackendError, BackendResult};

/// Storage for the current state document of one scope
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the current state
    ///
    /// Returns `None` if no state exists (first-time use)
    async fn get(&self) -> BackendResult<Option<Vec<u8>>>;

    /// Store a new state
    ///
    /// The document's serial should be incremented before calling this
    async fn put(&self, state: &[u8]) -> BackendResult<()>;
}

#[derive(Deserialize)]
struct SerialHeader {
    serial: u64,
}

/// Read the embedded `serial` of a state document
pub fn parse_serial(state: &[u8]) -> BackendResult<u64> {
    let header: SerialHeader = serde_json::from_slice(state).map_err(|e| {
        BackendError::InvalidState(format!("Failed to read serial from state: {}", e))
    })?;
    Ok(header.serial)
}

/// Lowercase hex SHA-256 of a state document
pub fn sha256_hex(state: &[u8]) -> String {
    format!("{:x}", Sha256::digest(state))
}
