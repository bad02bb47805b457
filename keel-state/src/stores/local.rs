//! Local file state store
//!
//! Keeps the state in a single `terraform.tfstate` file next to the
//! configuration, for operators who have not moved a scope to remote storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{BackendError, BackendResult};
use crate::state::StateStore;

/// Single-file state store
pub struct LocalStateStore {
    /// Path to the state file
    state_path: PathBuf,
}

impl LocalStateStore {
    /// Default state file name
    pub const STATE_FILENAME: &'static str = "terraform.tfstate";

    /// Create a store for the state file inside `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self::with_path(dir.as_ref().join(Self::STATE_FILENAME))
    }

    /// Create a store for a specific state file path
    pub fn with_path(state_path: PathBuf) -> Self {
        Self { state_path }
    }

    /// Get the state file path
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Check whether the state file exists
    pub fn exists(&self) -> bool {
        self.state_path.exists()
    }

    /// Remove the state file; a missing file is not an error
    pub fn delete(&self) -> BackendResult<()> {
        if !self.exists() {
            return Ok(());
        }

        std::fs::remove_file(&self.state_path)
            .map_err(|e| BackendError::Io(format!("Failed to remove state file: {}", e)))?;
        debug!(path = %self.state_path.display(), "Removed local state file");
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get(&self) -> BackendResult<Option<Vec<u8>>> {
        if !self.exists() {
            return Ok(None);
        }

        let content = std::fs::read(&self.state_path)
            .map_err(|e| BackendError::Io(format!("Failed to read state file: {}", e)))?;

        Ok(Some(content))
    }

    async fn put(&self, state: &[u8]) -> BackendResult<()> {
        std::fs::write(&self.state_path, state)
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;

        debug!(path = %self.state_path.display(), "Wrote local state file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_store_read_write() {
        let dir = tempdir().unwrap();
        let store = LocalStateStore::new(dir.path());

        // Initially no state
        assert!(store.get().await.unwrap().is_none());
        assert!(!store.exists());

        store.put(br#"{"serial": 1}"#).await.unwrap();
        assert!(store.exists());
        assert_eq!(
            store.get().await.unwrap(),
            Some(br#"{"serial": 1}"#.to_vec())
        );
    }

    #[tokio::test]
    async fn test_local_store_delete() {
        let dir = tempdir().unwrap();
        let store = LocalStateStore::new(dir.path());

        // Deleting a missing file is fine
        store.delete().unwrap();

        store.put(b"{}").await.unwrap();
        store.delete().unwrap();
        assert!(!store.exists());
        assert!(store.get().await.unwrap().is_none());
    }

    #[test]
    fn test_local_store_path() {
        let store = LocalStateStore::new("infra/prod");
        assert_eq!(
            store.state_path(),
            Path::new("infra/prod/terraform.tfstate")
        );
    }

    #[tokio::test]
    async fn test_local_store_write_into_missing_dir() {
        let dir = tempdir().unwrap();
        let store = LocalStateStore::new(dir.path().join("missing"));

        let result = store.put(b"{}").await;
        assert!(matches!(result, Err(BackendError::Io(_))));
    }
}
