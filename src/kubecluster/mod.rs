//! Control-plane access
//!
//! The CPI never talks to `kube::Api` directly. Every operation goes through
//! [`ClusterClient`], a namespaced view of one kubeconfig context, obtained
//! from a [`ClientProvider`]. Both traits are mocked in unit tests.

mod client;
mod provider;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;

use crate::Result;

pub use client::KubeClusterClient;
pub use provider::KubeConfigProvider;

/// One notification from a watch stream
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectEvent<K> {
    /// An object matching the selector appeared
    Added(K),
    /// A matching object changed
    Modified(K),
    /// A matching object was removed
    Deleted(K),
    /// Progress marker without an object
    Bookmark,
    /// The server reported an error on the stream
    Error(String),
}

impl<K> ObjectEvent<K> {
    /// Event type name as the API server spells it
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectEvent::Added(_) => "ADDED",
            ObjectEvent::Modified(_) => "MODIFIED",
            ObjectEvent::Deleted(_) => "DELETED",
            ObjectEvent::Bookmark => "BOOKMARK",
            ObjectEvent::Error(_) => "ERROR",
        }
    }
}

impl<K> fmt::Display for ObjectEvent<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectEvent::Error(message) => write!(f, "ERROR ({message})"),
            other => f.write_str(other.type_name()),
        }
    }
}

/// Stream of watch events; dropping it closes the server-side watch
pub type EventStream<K> = BoxStream<'static, Result<ObjectEvent<K>>>;

/// Namespaced operations against one cluster context
///
/// Names are object names within [`ClusterClient::namespace`]. Selectors are
/// label selector strings. Deletes use a zero grace period.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Resolved context name (never empty)
    fn context(&self) -> String;

    /// Namespace every object is created in
    fn namespace(&self) -> String;

    /// Whether the namespace exists
    async fn namespace_exists(&self) -> Result<bool>;

    /// Create the namespace
    async fn create_namespace(&self) -> Result<()>;

    /// Fetch a config map
    async fn get_config_map(&self, name: &str) -> Result<ConfigMap>;

    /// Create a config map
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;

    /// Replace a config map
    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;

    /// Delete a config map
    async fn delete_config_map(&self, name: &str) -> Result<()>;

    /// Fetch a pod
    async fn get_pod(&self, name: &str) -> Result<Pod>;

    /// List pods matching a selector
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>>;

    /// Create a pod
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;

    /// Delete a pod immediately
    async fn delete_pod(&self, name: &str) -> Result<()>;

    /// Merge labels into a pod's metadata
    async fn patch_pod_labels(&self, name: &str, labels: &BTreeMap<String, String>)
        -> Result<()>;

    /// Watch pods matching a selector, starting after `resource_version`
    async fn watch_pods(&self, selector: &str, resource_version: &str)
        -> Result<EventStream<Pod>>;

    /// Fetch a claim
    async fn get_claim(&self, name: &str) -> Result<PersistentVolumeClaim>;

    /// List claims matching a selector
    async fn list_claims(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>>;

    /// Create a claim
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// Replace a claim
    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// Delete a claim immediately
    async fn delete_claim(&self, name: &str) -> Result<()>;

    /// Watch claims matching a selector, starting after `resource_version`
    async fn watch_claims(
        &self,
        selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<PersistentVolumeClaim>>;

    /// Create a deployment
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    /// Delete a deployment immediately
    async fn delete_deployment(&self, name: &str) -> Result<()>;

    /// Watch deployments matching a selector, starting after `resource_version`
    async fn watch_deployments(
        &self,
        selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<Deployment>>;

    /// Whether a service exists
    async fn service_exists(&self, name: &str) -> Result<bool>;

    /// Create a service
    async fn create_service(&self, service: &Service) -> Result<Service>;

    /// List services matching a selector
    async fn list_services(&self, selector: &str) -> Result<Vec<Service>>;

    /// Delete a service immediately
    async fn delete_service(&self, name: &str) -> Result<()>;

    /// Create an ingress
    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress>;

    /// Whether a secret exists
    async fn secret_exists(&self, name: &str) -> Result<bool>;

    /// Create a secret
    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;
}

/// Builds clients for kubeconfig contexts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Client for `context`; the empty string selects the current context
    async fn client(&self, context: &str) -> Result<Arc<dyn ClusterClient>>;
}
