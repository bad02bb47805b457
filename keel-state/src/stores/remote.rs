//! Versioned state store over a key-value table
//!
//! Every state is written as its own record keyed by `(scope, serial)`, so an
//! update is always an append. A writer racing a newer update can only
//! succeed if its content is byte-identical to what is already stored at that
//! serial; otherwise it gets [`BackendError::StateConflict`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::{BackendError, BackendResult};
use crate::kv::{AttributeValue, Condition, Item, KeyAttribute, KvBackend, KvError, TableSpec};
use crate::state::{StateStore, parse_serial, sha256_hex};

const SCOPE_ATTR: &str = "scope";
const SERIAL_ATTR: &str = "serial";
const SHA256_ATTR: &str = "sha256";
const STATE_ATTR: &str = "state";

/// Append-only state history for one scope
pub struct VersionedStateStore {
    backend: Arc<dyn KvBackend>,
    table: String,
    scope: String,
}

impl VersionedStateStore {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        table: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            table: table.into(),
            scope: scope.into(),
        }
    }

    /// Schema of the state table
    pub fn table_spec(table: &str) -> TableSpec {
        TableSpec::new(table, KeyAttribute::string(SCOPE_ATTR))
            .with_sort_key(KeyAttribute::number(SERIAL_ATTR))
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

#[async_trait]
impl StateStore for VersionedStateStore {
    async fn get(&self) -> BackendResult<Option<Vec<u8>>> {
        let latest = self
            .backend
            .query_latest(&self.table, SCOPE_ATTR, &self.scope.as_str().into())
            .await?;

        let Some(item) = latest else {
            debug!(scope = %self.scope, "No remote state");
            return Ok(None);
        };

        let state = item
            .get(STATE_ATTR)
            .and_then(AttributeValue::as_str)
            .ok_or_else(|| {
                BackendError::InvalidState(format!(
                    "State record for {} has no state attribute",
                    self.scope
                ))
            })?;

        Ok(Some(state.as_bytes().to_vec()))
    }

    async fn put(&self, state: &[u8]) -> BackendResult<()> {
        let serial = parse_serial(state)?;
        let sha256 = sha256_hex(state);
        let text = std::str::from_utf8(state)
            .map_err(|e| BackendError::InvalidState(format!("State is not UTF-8: {}", e)))?;

        let mut item = Item::new();
        item.insert(SCOPE_ATTR.to_string(), self.scope.as_str().into());
        item.insert(SERIAL_ATTR.to_string(), serial.into());
        item.insert(SHA256_ATTR.to_string(), sha256.as_str().into());
        item.insert(STATE_ATTR.to_string(), text.into());

        let condition = Condition::attribute_not_exists(SERIAL_ATTR)
            .or(Condition::equals(SHA256_ATTR, sha256.as_str()));

        match self
            .backend
            .put_item(&self.table, item, Some(&condition))
            .await
        {
            Ok(()) => {
                info!(scope = %self.scope, serial, "State stored");
                Ok(())
            }
            Err(KvError::ConditionFailed) => Err(BackendError::StateConflict {
                scope: self.scope.clone(),
                serial,
            }),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::provision::ProvisioningBackend;

    const TABLE: &str = "keel-state";
    const SCOPE: &str = "infra/prod.rb";

    fn setup() -> (Arc<MemoryBackend>, VersionedStateStore) {
        let memory = Arc::new(MemoryBackend::new());
        let backend: Arc<dyn KvBackend> = Arc::new(
            ProvisioningBackend::new(memory.clone())
                .with_table(VersionedStateStore::table_spec(TABLE)),
        );
        (memory, VersionedStateStore::new(backend, TABLE, SCOPE))
    }

    fn state(serial: u64, body: &str) -> Vec<u8> {
        format!(r#"{{"version":3,"serial":{},"resources":"{}"}}"#, serial, body).into_bytes()
    }

    #[tokio::test]
    async fn test_get_never_written() {
        let (memory, store) = setup();
        assert!(store.get().await.unwrap().is_none());
        // Reading bootstraps the table too
        assert!(memory.has_table(TABLE).await);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_, store) = setup();
        let doc = state(1, "a");
        store.put(&doc).await.unwrap();
        assert_eq!(store.get().await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn test_identical_rewrite_is_idempotent() {
        let (memory, store) = setup();
        let doc = state(5, "a");
        store.put(&doc).await.unwrap();
        store.put(&doc).await.unwrap();

        assert_eq!(memory.scan(TABLE).await.unwrap().len(), 1);
        assert_eq!(store.get().await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn test_divergent_write_conflicts() {
        let (_, store) = setup();
        let original = state(5, "a");
        store.put(&original).await.unwrap();

        match store.put(&state(5, "b")).await {
            Err(BackendError::StateConflict { scope, serial }) => {
                assert_eq!(scope, SCOPE);
                assert_eq!(serial, 5);
            }
            other => panic!("Expected StateConflict, got {:?}", other),
        }

        // The stored version is untouched
        assert_eq!(store.get().await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn test_get_returns_highest_serial() {
        let orders: [[u64; 3]; 3] = [[3, 7, 5], [7, 5, 3], [5, 3, 7]];
        for order in orders {
            let (memory, store) = setup();
            for serial in order {
                store.put(&state(serial, &serial.to_string())).await.unwrap();
            }

            assert_eq!(store.get().await.unwrap(), Some(state(7, "7")));
            // Older versions are kept
            assert_eq!(memory.scan(TABLE).await.unwrap().len(), 3);
        }
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let (memory, prod) = setup();
        let backend: Arc<dyn KvBackend> = Arc::new(
            ProvisioningBackend::new(memory.clone())
                .with_table(VersionedStateStore::table_spec(TABLE)),
        );
        let staging = VersionedStateStore::new(backend, TABLE, "infra/staging.rb");

        prod.put(&state(9, "prod")).await.unwrap();
        staging.put(&state(1, "staging")).await.unwrap();

        assert_eq!(prod.get().await.unwrap(), Some(state(9, "prod")));
        assert_eq!(staging.get().await.unwrap(), Some(state(1, "staging")));
    }

    #[tokio::test]
    async fn test_put_without_serial_writes_nothing() {
        let (memory, store) = setup();
        let result = store.put(br#"{"version":3}"#).await;

        assert!(matches!(result, Err(BackendError::InvalidState(_))));
        assert!(!memory.has_table(TABLE).await);
    }

    #[tokio::test]
    async fn test_record_layout() {
        let (memory, store) = setup();
        let doc = state(4, "a");
        store.put(&doc).await.unwrap();

        let item = &memory.scan(TABLE).await.unwrap()[0];
        assert_eq!(item.get(SCOPE_ATTR), Some(&AttributeValue::from(SCOPE)));
        assert_eq!(item.get(SERIAL_ATTR), Some(&AttributeValue::N(4)));
        assert_eq!(
            item.get(SHA256_ATTR),
            Some(&AttributeValue::from(sha256_hex(&doc)))
        );
    }
}
