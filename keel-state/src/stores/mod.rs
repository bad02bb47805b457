//! State store selection and migration
//!
//! A scope uses local state while a local state file exists, and the remote
//! versioned store otherwise. The migrations below move a snapshot between
//! the two. Callers must hold the scope's lock while migrating; nothing here
//! takes it.

mod local;
mod remote;

pub use local::LocalStateStore;
pub use remote::VersionedStateStore;

use async_trait::async_trait;
use tracing::info;

use crate::backend::BackendResult;
use crate::state::StateStore;

/// The store chosen for a scope
pub enum SelectedStore {
    Local(LocalStateStore),
    Remote(VersionedStateStore),
}

impl SelectedStore {
    pub fn is_local(&self) -> bool {
        matches!(self, SelectedStore::Local(_))
    }

    fn store(&self) -> &dyn StateStore {
        match self {
            SelectedStore::Local(store) => store,
            SelectedStore::Remote(store) => store,
        }
    }
}

#[async_trait]
impl StateStore for SelectedStore {
    async fn get(&self) -> BackendResult<Option<Vec<u8>>> {
        self.store().get().await
    }

    async fn put(&self, state: &[u8]) -> BackendResult<()> {
        self.store().put(state).await
    }
}

/// Pick local state if its file exists, remote state otherwise
pub fn select_store(local: LocalStateStore, remote: VersionedStateStore) -> SelectedStore {
    if local.exists() {
        SelectedStore::Local(local)
    } else {
        SelectedStore::Remote(remote)
    }
}

/// Move local state to the remote store and remove the local file
///
/// Returns whether there was any local state to move.
pub async fn use_remote_state(
    local: &LocalStateStore,
    remote: &dyn StateStore,
) -> BackendResult<bool> {
    let state = local.get().await?;
    if let Some(state) = &state {
        remote.put(state).await?;
        info!(path = %local.state_path().display(), "Moved local state to remote storage");
    }
    local.delete()?;
    Ok(state.is_some())
}

/// Copy the latest remote state into the local state file
///
/// Remote history is append-only and stays in place. Returns whether there
/// was any remote state to copy.
pub async fn use_local_state(
    local: &LocalStateStore,
    remote: &dyn StateStore,
) -> BackendResult<bool> {
    let state = remote.get().await?;
    if let Some(state) = &state {
        local.put(state).await?;
        info!(path = %local.state_path().display(), "Copied remote state to local file");
    }
    Ok(state.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::backends::MemoryBackend;
    use crate::kv::KvBackend;
    use crate::provision::ProvisioningBackend;
    use std::sync::Arc;
    use tempfile::tempdir;

    const TABLE: &str = "keel-state";

    fn remote() -> VersionedStateStore {
        let backend: Arc<dyn KvBackend> = Arc::new(
            ProvisioningBackend::new(MemoryBackend::new())
                .with_table(VersionedStateStore::table_spec(TABLE)),
        );
        VersionedStateStore::new(backend, TABLE, "infra/prod.rb")
    }

    #[tokio::test]
    async fn test_select_remote_without_local_file() {
        let dir = tempdir().unwrap();
        let store = select_store(LocalStateStore::new(dir.path()), remote());
        assert!(!store.is_local());
        assert!(store.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_select_local_with_local_file() {
        let dir = tempdir().unwrap();
        let local = LocalStateStore::new(dir.path());
        local.put(br#"{"serial": 2}"#).await.unwrap();

        let store = select_store(local, remote());
        assert!(store.is_local());
        assert_eq!(store.get().await.unwrap(), Some(br#"{"serial": 2}"#.to_vec()));
    }

    #[tokio::test]
    async fn test_use_remote_state_moves_and_deletes() {
        let dir = tempdir().unwrap();
        let local = LocalStateStore::new(dir.path());
        let remote = remote();
        local.put(br#"{"serial": 4}"#).await.unwrap();

        assert!(use_remote_state(&local, &remote).await.unwrap());

        assert!(!local.exists());
        assert_eq!(remote.get().await.unwrap(), Some(br#"{"serial": 4}"#.to_vec()));
    }

    #[tokio::test]
    async fn test_use_remote_state_without_local_state() {
        let dir = tempdir().unwrap();
        let local = LocalStateStore::new(dir.path());
        let remote = remote();

        assert!(!use_remote_state(&local, &remote).await.unwrap());
        assert!(remote.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_use_remote_state_keeps_local_file_on_conflict() {
        let dir = tempdir().unwrap();
        let local = LocalStateStore::new(dir.path());
        let remote = remote();
        remote.put(br#"{"serial": 4, "a": 1}"#).await.unwrap();
        local.put(br#"{"serial": 4, "a": 2}"#).await.unwrap();

        let result = use_remote_state(&local, &remote).await;
        assert!(matches!(result, Err(BackendError::StateConflict { serial: 4, .. })));
        assert!(local.exists());
    }

    #[tokio::test]
    async fn test_use_local_state_copies_latest() {
        let dir = tempdir().unwrap();
        let local = LocalStateStore::new(dir.path());
        let remote = remote();
        remote.put(br#"{"serial": 1}"#).await.unwrap();
        remote.put(br#"{"serial": 2}"#).await.unwrap();

        assert!(use_local_state(&local, &remote).await.unwrap());

        assert_eq!(local.get().await.unwrap(), Some(br#"{"serial": 2}"#.to_vec()));
        // Remote history stays
        assert_eq!(remote.get().await.unwrap(), Some(br#"{"serial": 2}"#.to_vec()));
    }

    #[tokio::test]
    async fn test_use_local_state_without_remote_state() {
        let dir = tempdir().unwrap();
        let local = LocalStateStore::new(dir.path());

        assert!(!use_local_state(&local, &remote()).await.unwrap());
        assert!(!local.exists());
    }
}
