//! In-process key-value backend
//!
//! Mirrors the conditional-write and missing-table behaviour of DynamoDB so
//! the lock and state store can be exercised without AWS. Tables start out
//! absent and are created with [`KvBackend::create_table`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::kv::{AttributeValue, Condition, Item, KvBackend, KvError, KvResult, TableSpec};

struct MemoryTable {
    spec: TableSpec,
    /// Primary key -> item
    items: BTreeMap<Item, Item>,
}

/// Key-value backend held entirely in memory
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a table has been created
    pub async fn has_table(&self, name: &str) -> bool {
        self.tables.lock().await.contains_key(name)
    }

    /// All items of a table, in primary key order
    pub async fn scan(&self, table: &str) -> KvResult<Vec<Item>> {
        let tables = self.tables.lock().await;
        let table = tables
            .get(table)
            .ok_or_else(|| KvError::TableNotFound(table.to_string()))?;
        Ok(table.items.values().cloned().collect())
    }
}

fn table_mut<'a>(
    tables: &'a mut HashMap<String, MemoryTable>,
    name: &str,
) -> KvResult<&'a mut MemoryTable> {
    tables
        .get_mut(name)
        .ok_or_else(|| KvError::TableNotFound(name.to_string()))
}

fn check(condition: Option<&Condition>, existing: Option<&Item>) -> KvResult<()> {
    match condition {
        Some(condition) if !condition.evaluate(existing) => Err(KvError::ConditionFailed),
        _ => Ok(()),
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get_item(&self, table: &str, key: &Item) -> KvResult<Option<Item>> {
        let mut tables = self.tables.lock().await;
        let table = table_mut(&mut tables, table)?;
        Ok(table.items.get(key).cloned())
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<&Condition>,
    ) -> KvResult<()> {
        let mut tables = self.tables.lock().await;
        let table = table_mut(&mut tables, table)?;
        let key = table.spec.key_of(&item).ok_or_else(|| {
            KvError::Service(format!(
                "Item is missing key attributes of table {}",
                table.spec.name
            ))
        })?;

        check(condition, table.items.get(&key))?;
        table.items.insert(key, item);
        Ok(())
    }

    async fn delete_item(
        &self,
        table: &str,
        key: &Item,
        condition: Option<&Condition>,
    ) -> KvResult<()> {
        let mut tables = self.tables.lock().await;
        let table = table_mut(&mut tables, table)?;

        check(condition, table.items.get(key))?;
        table.items.remove(key);
        Ok(())
    }

    async fn query_latest(
        &self,
        table: &str,
        partition_key: &str,
        partition_value: &AttributeValue,
    ) -> KvResult<Option<Item>> {
        let mut tables = self.tables.lock().await;
        let table = table_mut(&mut tables, table)?;
        let sort_key = table.spec.sort_key.as_ref().map(|k| k.name.as_str());

        let latest = table
            .items
            .values()
            .filter(|item| item.get(partition_key) == Some(partition_value))
            .max_by(|a, b| match sort_key {
                Some(name) => a.get(name).cmp(&b.get(name)),
                None => std::cmp::Ordering::Equal,
            });

        Ok(latest.cloned())
    }

    async fn create_table(&self, spec: &TableSpec) -> KvResult<()> {
        let mut tables = self.tables.lock().await;
        tables
            .entry(spec.name.clone())
            .or_insert_with(|| MemoryTable {
                spec: spec.clone(),
                items: BTreeMap::new(),
            });
        Ok(())
    }
}
