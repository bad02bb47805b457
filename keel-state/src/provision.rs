//! Create-on-demand table bootstrap
//!
//! The lock and state tables are provisioned lazily: the first operation
//! that finds its table missing creates it and runs once more. This is
//! bootstrap idempotence, not a retry policy. Contention errors and any
//! failure after creation are returned as-is.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use tracing::info;

use crate::kv::{AttributeValue, Condition, Item, KvBackend, KvError, KvResult, TableSpec};

/// Run `op`; if its table does not exist, create it from `spec` and run `op` exactly once more
pub async fn ensure_table_then_run<B, F, Fut, T>(
    backend: &B,
    spec: &TableSpec,
    op: F,
) -> KvResult<T>
where
    B: KvBackend + ?Sized,
    F: Fn() -> Fut,
    Fut: Future<Output = KvResult<T>>,
{
    match op().await {
        Err(KvError::TableNotFound(table)) => {
            info!(table = %table, "Table does not exist, creating it");
            backend.create_table(spec).await?;
            op().await
        }
        other => other,
    }
}

/// Decorator that provisions registered tables on first use
///
/// Operations against tables without a registered [`TableSpec`] are passed
/// straight to the wrapped backend.
pub struct ProvisioningBackend<B> {
    inner: B,
    tables: HashMap<String, TableSpec>,
}

impl<B: KvBackend> ProvisioningBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            tables: HashMap::new(),
        }
    }

    /// Register a table to be created on demand
    pub fn with_table(mut self, spec: TableSpec) -> Self {
        self.tables.insert(spec.name.clone(), spec);
        self
    }

    /// Get the wrapped backend
    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn run<F, Fut, T>(&self, table: &str, op: F) -> KvResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = KvResult<T>>,
    {
        match self.tables.get(table) {
            Some(spec) => ensure_table_then_run(&self.inner, spec, op).await,
            None => op().await,
        }
    }
}

#[async_trait]
impl<B: KvBackend> KvBackend for ProvisioningBackend<B> {
    async fn get_item(&self, table: &str, key: &Item) -> KvResult<Option<Item>> {
        let inner = &self.inner;
        self.run(table, move || inner.get_item(table, key)).await
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<&Condition>,
    ) -> KvResult<()> {
        let inner = &self.inner;
        self.run(table, move || inner.put_item(table, item.clone(), condition))
            .await
    }

    async fn delete_item(
        &self,
        table: &str,
        key: &Item,
        condition: Option<&Condition>,
    ) -> KvResult<()> {
        let inner = &self.inner;
        self.run(table, move || inner.delete_item(table, key, condition))
            .await
    }

    async fn query_latest(
        &self,
        table: &str,
        partition_key: &str,
        partition_value: &AttributeValue,
    ) -> KvResult<Option<Item>> {
        let inner = &self.inner;
        self.run(table, move || {
            inner.query_latest(table, partition_key, partition_value)
        })
        .await
    }

    async fn create_table(&self, spec: &TableSpec) -> KvResult<()> {
        self.inner.create_table(spec).await
    }
}
