//! Backend-neutral key-value model
//!
//! Items, conditional expressions and the [`KvBackend`] trait implemented by
//! every storage backend. A backend only has to offer single-row conditional
//! writes; the lock and the versioned state store are built on top of that.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// A single attribute value stored in an item
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttributeValue {
    /// String attribute
    S(String),
    /// Number attribute
    N(u64),
    /// Nested map attribute
    M(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            AttributeValue::N(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, AttributeValue>> {
        match self {
            AttributeValue::M(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::S(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::S(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        AttributeValue::N(value)
    }
}

/// A stored row: attribute name to value
pub type Item = BTreeMap<String, AttributeValue>;

/// Scalar type of a key attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    String,
    Number,
}

/// A key attribute in a table's key schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAttribute {
    pub name: String,
    pub scalar_type: ScalarType,
}

impl KeyAttribute {
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scalar_type: ScalarType::String,
        }
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scalar_type: ScalarType::Number,
        }
    }
}

/// Everything needed to create a table on demand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name
    pub name: String,
    /// Partition (hash) key
    pub partition_key: KeyAttribute,
    /// Optional sort (range) key
    pub sort_key: Option<KeyAttribute>,
    /// Provisioned read capacity units
    pub read_capacity: i64,
    /// Provisioned write capacity units
    pub write_capacity: i64,
}

impl TableSpec {
    /// Coordination metadata is low-QPS; one unit each way is enough
    pub const DEFAULT_CAPACITY: i64 = 1;

    pub fn new(name: impl Into<String>, partition_key: KeyAttribute) -> Self {
        Self {
            name: name.into(),
            partition_key,
            sort_key: None,
            read_capacity: Self::DEFAULT_CAPACITY,
            write_capacity: Self::DEFAULT_CAPACITY,
        }
    }

    pub fn with_sort_key(mut self, sort_key: KeyAttribute) -> Self {
        self.sort_key = Some(sort_key);
        self
    }

    /// Extract the primary key attributes of an item
    ///
    /// Returns `None` if the item is missing any key attribute.
    pub fn key_of(&self, item: &Item) -> Option<Item> {
        let mut key = Item::new();
        let partition = item.get(&self.partition_key.name)?;
        key.insert(self.partition_key.name.clone(), partition.clone());
        if let Some(sort_key) = &self.sort_key {
            let sort = item.get(&sort_key.name)?;
            key.insert(sort_key.name.clone(), sort.clone());
        }
        Some(key)
    }
}

/// Condition attached to a write, evaluated against the stored item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// The attribute is absent (an absent item has no attributes)
    AttributeNotExists(String),
    /// The attribute exists and equals the value
    Equals(String, AttributeValue),
    /// Either condition holds
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn attribute_not_exists(name: impl Into<String>) -> Self {
        Condition::AttributeNotExists(name.into())
    }

    pub fn equals(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Condition::Equals(name.into(), value.into())
    }

    pub fn or(self, other: Condition) -> Self {
        Condition::Or(Box::new(self), Box::new(other))
    }

    /// Evaluate the condition against the currently stored item
    pub fn evaluate(&self, existing: Option<&Item>) -> bool {
        match self {
            Condition::AttributeNotExists(name) => {
                existing.is_none_or(|item| !item.contains_key(name))
            }
            Condition::Equals(name, value) => {
                existing.and_then(|item| item.get(name)) == Some(value)
            }
            Condition::Or(left, right) => left.evaluate(existing) || right.evaluate(existing),
        }
    }
}

/// Errors reported by a key-value backend
#[derive(Debug, Error)]
pub enum KvError {
    /// The write condition evaluated to false
    #[error("Conditional check failed")]
    ConditionFailed,

    /// The table does not exist (yet)
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Any other backend failure: network, permissions, schema
    #[error("Service error: {0}")]
    Service(String),
}

/// Result type for key-value operations
pub type KvResult<T> = Result<T, KvError>;

/// A table-oriented key-value store with atomic conditional writes
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Strongly consistent read of a single item
    async fn get_item(&self, table: &str, key: &Item) -> KvResult<Option<Item>>;

    /// Replace an item, optionally only if `condition` holds
    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<&Condition>,
    ) -> KvResult<()>;

    /// Delete an item, optionally only if `condition` holds
    async fn delete_item(
        &self,
        table: &str,
        key: &Item,
        condition: Option<&Condition>,
    ) -> KvResult<()>;

    /// The item with the greatest sort key in a partition
    async fn query_latest(
        &self,
        table: &str,
        partition_key: &str,
        partition_value: &AttributeValue,
    ) -> KvResult<Option<Item>>;

    /// Create a table; returns once it accepts reads and writes
    async fn create_table(&self, spec: &TableSpec) -> KvResult<()>;
}

#[async_trait]
impl<T: KvBackend + ?Sized> KvBackend for Arc<T> {
    async fn get_item(&self, table: &str, key: &Item) -> KvResult<Option<Item>> {
        (**self).get_item(table, key).await
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<&Condition>,
    ) -> KvResult<()> {
        (**self).put_item(table, item, condition).await
    }

    async fn delete_item(
        &self,
        table: &str,
        key: &Item,
        condition: Option<&Condition>,
    ) -> KvResult<()> {
        (**self).delete_item(table, key, condition).await
    }

    async fn query_latest(
        &self,
        table: &str,
        partition_key: &str,
        partition_value: &AttributeValue,
    ) -> KvResult<Option<Item>> {
        (**self)
            .query_latest(table, partition_key, partition_value)
            .await
    }

    async fn create_table(&self, spec: &TableSpec) -> KvResult<()> {
        (**self).create_table(spec).await
    }
}
