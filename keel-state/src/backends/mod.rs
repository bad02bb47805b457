//! Key-value backend implementations

mod dynamodb;
mod memory;

pub use dynamodb::DynamoDbBackend;
pub use memory::MemoryBackend;

use std::sync::Arc;

use crate::backend::{BackendConfig, BackendError, BackendResult};
use crate::config::Config;
use crate::kv::KvBackend;
use crate::lock::NamedLock;
use crate::provision::ProvisioningBackend;
use crate::stores::VersionedStateStore;

/// Create a backend from configuration
///
/// This function dispatches to the appropriate backend implementation
/// based on the backend_type in the configuration. The result provisions
/// the lock and state tables named in `tables` on first use.
pub async fn create_backend(
    config: &BackendConfig,
    tables: &Config,
) -> BackendResult<Arc<dyn KvBackend>> {
    match config.backend_type.as_str() {
        "dynamodb" => {
            let backend = DynamoDbBackend::from_config(config).await;
            Ok(Arc::new(provisioned(backend, tables)))
        }
        "memory" => Ok(Arc::new(provisioned(MemoryBackend::new(), tables))),
        other => Err(BackendError::unsupported_backend(other)),
    }
}

fn provisioned<B: KvBackend>(backend: B, tables: &Config) -> ProvisioningBackend<B> {
    ProvisioningBackend::new(backend)
        .with_table(NamedLock::table_spec(&tables.lock_table))
        .with_table(VersionedStateStore::table_spec(&tables.state_table))
}
