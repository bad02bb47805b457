//! Keel State Management
//!
//! This crate provides the coordination layer that lets several operators
//! change the same infrastructure safely. It stores infrastructure state in
//! a key-value backend (currently DynamoDB) with locking support for safe
//! concurrent access.
//!
//! # Overview
//!
//! The state management system consists of:
//!
//! - **KvBackend**: A table-oriented key-value store with conditional writes
//! - **ProvisioningBackend**: Creates missing tables on first use
//! - **NamedLock**: Per-scope mutual exclusion with token-checked release
//! - **VersionedStateStore**: Append-only state history keyed by serial
//! - **LocalStateStore**: A single local state file, selectable per scope
//!
//! # Example
//!
//! ```ignore
//! use keel_state::{
//!     create_backend, with_lock, AcquireMode, BackendConfig, Config, NamedLock, StateStore,
//!     VersionedStateStore,
//! };
//!
//! let tables = Config::default();
//! let backend = create_backend(&BackendConfig::new("dynamodb"), &tables).await?;
//!
//! let lock = NamedLock::new(backend.clone(), &tables.lock_table, "infra/prod.rb");
//! let store = VersionedStateStore::new(backend, &tables.state_table, "infra/prod.rb");
//!
//! with_lock(&lock, AcquireMode::Acquire, || async {
//!     // Read current state
//!     let state = store.get().await?;
//!
//!     // ... run terraform, bump the serial ...
//!
//!     // Write updated state
//!     store.put(&new_state).await
//! })
//! .await?;
//! ```

pub mod backend;
pub mod backends;
pub mod config;
pub mod kv;
pub mod lock;
pub mod provision;
pub mod state;
pub mod stores;

// Re-export main types for convenience
pub use backend::{BackendConfig, BackendError, BackendResult};
pub use backends::create_backend;
pub use config::Config;
pub use kv::{KvBackend, KvError};
pub use lock::{
    AcquireMode, Lock, LockHolder, LockStatus, LockToken, NamedLock, NullLock, with_lock,
};
pub use provision::{ProvisioningBackend, ensure_table_then_run};
pub use state::StateStore;
pub use stores::{
    LocalStateStore, SelectedStore, VersionedStateStore, select_store, use_local_state,
    use_remote_state,
};
