//! CPI lifecycle operations
//!
//! Each manager owns a [`ClientProvider`] and the deadlines it needs. Calls
//! decode their CIDs, obtain a client for the CID's context, mutate objects
//! and wait on the readiness watcher where the cluster reconciles
//! asynchronously.
//!
//! - [`VmManager`] - create, delete, find and label VMs
//! - [`DiskManager`] - create, delete, find and label disks, list a VM's disks
//! - [`VolumeManager`] - attach and detach disks by recreating the VM's pod

mod disk;
mod stemcell;
mod vm;
mod volume;

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::debug;

use crate::kubecluster::ClusterClient;
use crate::Result;

pub use disk::DiskManager;
pub use stemcell::{create_stemcell, delete_stemcell};
pub use vm::VmManager;
pub use volume::{update_volumes, VolumeManager, VolumeOp};

/// Static CPI information returned by `info`
pub fn info() -> Value {
    json!({ "api_version": "1.0" })
}

/// Generate a fresh object id
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Create the client's namespace unless it already exists
pub(crate) async fn ensure_namespace(client: &dyn ClusterClient) -> Result<()> {
    if client.namespace_exists().await? {
        return Ok(());
    }

    match client.create_namespace().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_already_exists() => {
            debug!(namespace = %client.namespace(), "namespace created concurrently");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Treat a 404 from a delete as success
pub(crate) fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Single-entry label map
pub(crate) fn single_label(key: &str, value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), value.to_string())])
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::kubecluster::{ClusterClient, MockClientProvider, MockClusterClient};
    use crate::Error;

    /// API error with the given status code and reason
    pub fn api_error(code: u16, reason: &str) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} error"),
            reason: reason.to_string(),
            code,
        }))
    }

    /// Mock client reporting the given context and a `bosh` namespace
    pub fn client_for(context: &'static str) -> MockClusterClient {
        let mut client = MockClusterClient::new();
        client.expect_context().return_const(context.to_string());
        client.expect_namespace().return_const("bosh".to_string());
        client
    }

    /// Provider that hands out `client` for `context` exactly once
    pub fn provider_for(context: &'static str, client: MockClusterClient) -> MockClientProvider {
        let client: Arc<dyn ClusterClient> = Arc::new(client);
        let mut provider = MockClientProvider::new();
        provider
            .expect_client()
            .withf(move |c| c == context)
            .times(1)
            .returning(move |_| Ok(client.clone()));
        provider
    }

    /// Provider that must never be asked for a client
    pub fn unused_provider() -> MockClientProvider {
        let mut provider = MockClientProvider::new();
        provider.expect_client().never();
        provider
    }
}
