//! Named locks for state backend locking
//!
//! A lock is one record per scope in the lock table; the record existing is
//! what "locked" means. Ownership is proven by the random token written on
//! acquire/steal, and only that token can delete the record. Locks never
//! expire: a crashed holder's lock stays until someone steals it.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, BackendResult};
use crate::kv::{AttributeValue, Condition, Item, KeyAttribute, KvBackend, KvError, TableSpec};

const NAME_ATTR: &str = "name";
const LOCK_ID_ATTR: &str = "lock_id";
const LOCKED_AT_ATTR: &str = "locked_at";
const METADATA_ATTR: &str = "metadata";
const OWNER_KEY: &str = "owner";

/// Conditional writes attempted by `acquire` when the lock frees up mid-call
const ACQUIRE_ATTEMPTS: u32 = 2;

/// Opaque credential returned by acquire/steal
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Generate a fresh random token
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who holds a lock and since when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    /// When the lock was taken (RFC 3339)
    pub locked_at: String,
    /// Identity of the acquirer
    pub owner: String,
}

/// Result of inspecting a lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LockStatus {
    Locked(LockHolder),
    Unlocked,
}

impl LockStatus {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockStatus::Locked(_))
    }

    pub fn holder(&self) -> Option<&LockHolder> {
        match self {
            LockStatus::Locked(holder) => Some(holder),
            LockStatus::Unlocked => None,
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockStatus::Locked(holder) => {
                write!(f, "locked by {} since {}", holder.owner, holder.locked_at)
            }
            LockStatus::Unlocked => f.write_str("unlocked"),
        }
    }
}

/// Whether to take a lock normally or force it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquireMode {
    /// Fail if the lock is held
    #[default]
    Acquire,
    /// Overwrite whatever lock is held
    Steal,
}

/// Mutual exclusion for one scope
#[async_trait]
pub trait Lock: Send + Sync {
    /// The scope this lock protects
    fn scope(&self) -> &str;

    /// Inspect the current holder without changing anything
    async fn status(&self) -> BackendResult<LockStatus>;

    /// Take the lock if nobody holds it
    ///
    /// Fails immediately with [`BackendError::LockHeld`] otherwise; never waits.
    async fn acquire(&self) -> BackendResult<LockToken>;

    /// Take the lock unconditionally, invalidating the previous holder's token
    async fn steal(&self) -> BackendResult<LockToken>;

    /// Release the lock, which must still be held with `token`
    async fn release(&self, token: &LockToken) -> BackendResult<()>;
}

/// Lock stored as a record in a key-value table
///
/// The backend is expected to provision the lock table on demand (see
/// [`crate::provision::ProvisioningBackend`] and [`NamedLock::table_spec`]).
pub struct NamedLock {
    backend: Arc<dyn KvBackend>,
    table: String,
    scope: String,
    owner: String,
}

impl NamedLock {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        table: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            table: table.into(),
            scope: scope.into(),
            owner: default_owner(),
        }
    }

    /// Record a specific owner identity instead of `user@hostname`
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Schema of the lock table
    pub fn table_spec(table: &str) -> TableSpec {
        TableSpec::new(table, KeyAttribute::string(NAME_ATTR))
    }

    fn key(&self) -> Item {
        let mut key = Item::new();
        key.insert(NAME_ATTR.to_string(), self.scope.as_str().into());
        key
    }

    async fn write(&self, condition: Option<&Condition>) -> Result<LockToken, KvError> {
        let token = LockToken::generate();

        let mut metadata = BTreeMap::new();
        metadata.insert(OWNER_KEY.to_string(), self.owner.as_str().into());

        let mut item = self.key();
        item.insert(LOCK_ID_ATTR.to_string(), token.as_str().into());
        item.insert(LOCKED_AT_ATTR.to_string(), Utc::now().to_rfc3339().into());
        item.insert(METADATA_ATTR.to_string(), AttributeValue::M(metadata));

        self.backend.put_item(&self.table, item, condition).await?;
        Ok(token)
    }
}

#[async_trait]
impl Lock for NamedLock {
    fn scope(&self) -> &str {
        &self.scope
    }

    async fn status(&self) -> BackendResult<LockStatus> {
        let item = self.backend.get_item(&self.table, &self.key()).await?;
        Ok(match item {
            Some(item) => LockStatus::Locked(holder_from_item(&item)),
            None => LockStatus::Unlocked,
        })
    }

    async fn acquire(&self) -> BackendResult<LockToken> {
        let condition = Condition::attribute_not_exists(LOCK_ID_ATTR);
        let mut attempt = 1;
        loop {
            match self.write(Some(&condition)).await {
                Ok(token) => {
                    info!(scope = %self.scope, owner = %self.owner, "Lock acquired");
                    return Ok(token);
                }
                Err(KvError::ConditionFailed) => {
                    let status = self.status().await?;
                    // The holder released between our write and the read
                    if !status.is_locked() && attempt < ACQUIRE_ATTEMPTS {
                        debug!(scope = %self.scope, attempt, "Lock freed during acquire, retrying");
                        attempt += 1;
                        continue;
                    }
                    return Err(BackendError::LockHeld {
                        scope: self.scope.clone(),
                        status,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn steal(&self) -> BackendResult<LockToken> {
        // Only read for the log line; a failed read must not block recovery
        let previous = match self.status().await {
            Ok(status) => status.to_string(),
            Err(err) => format!("unknown ({})", err),
        };
        let token = self.write(None).await?;
        warn!(scope = %self.scope, owner = %self.owner, previous = %previous, "Lock stolen");
        Ok(token)
    }

    async fn release(&self, token: &LockToken) -> BackendResult<()> {
        let condition = Condition::equals(LOCK_ID_ATTR, token.as_str());
        match self
            .backend
            .delete_item(&self.table, &self.key(), Some(&condition))
            .await
        {
            Ok(()) => {
                info!(scope = %self.scope, "Lock released");
                Ok(())
            }
            Err(KvError::ConditionFailed) => Err(BackendError::LockMismatch {
                scope: self.scope.clone(),
                status: self.status().await?,
            }),
            Err(err) => Err(err.into()),
        }
    }
}

fn holder_from_item(item: &Item) -> LockHolder {
    let locked_at = item
        .get(LOCKED_AT_ATTR)
        .and_then(AttributeValue::as_str)
        .unwrap_or("unknown")
        .to_string();
    let owner = item
        .get(METADATA_ATTR)
        .and_then(AttributeValue::as_map)
        .and_then(|m| m.get(OWNER_KEY))
        .and_then(AttributeValue::as_str)
        .unwrap_or("unknown")
        .to_string();

    LockHolder { locked_at, owner }
}

/// Lock that coordinates nothing, for single-operator workflows
pub struct NullLock {
    scope: String,
}

impl NullLock {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }
}

#[async_trait]
impl Lock for NullLock {
    fn scope(&self) -> &str {
        &self.scope
    }

    async fn status(&self) -> BackendResult<LockStatus> {
        Ok(LockStatus::Unlocked)
    }

    async fn acquire(&self) -> BackendResult<LockToken> {
        debug!(scope = %self.scope, "Locking disabled");
        Ok(LockToken::new(""))
    }

    async fn steal(&self) -> BackendResult<LockToken> {
        Ok(LockToken::new(""))
    }

    async fn release(&self, _token: &LockToken) -> BackendResult<()> {
        Ok(())
    }
}

/// Run `op` while holding `lock`
///
/// The lock is released only when `op` succeeds. When `op` fails the lock
/// stays held: the failed operation may have partially changed real
/// infrastructure, and the next mutation must wait for a human to reconcile
/// and then release or steal it.
pub async fn with_lock<L, F, Fut, T, E>(lock: &L, mode: AcquireMode, op: F) -> Result<T, E>
where
    L: Lock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<BackendError>,
{
    let token = match mode {
        AcquireMode::Acquire => lock.acquire().await?,
        AcquireMode::Steal => lock.steal().await?,
    };

    match op().await {
        Ok(value) => {
            lock.release(&token).await?;
            Ok(value)
        }
        Err(err) => {
            warn!(scope = lock.scope(), "Operation failed, lock left held");
            Err(err)
        }
    }
}

/// Get the lock owner string (username@hostname)
fn default_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}
