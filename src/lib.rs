//! Kubernetes CPI - BOSH cloud provider interface backed by a Kubernetes cluster
//!
//! Director lifecycle verbs (create a VM, attach a disk, ...) are translated
//! into pods, persistent volume claims, config maps, deployments, services
//! and secrets. Anything the cluster reconciles asynchronously is awaited
//! through a label-scoped watch before the verb returns.
//!
//! # Modules
//!
//! - [`cid`] - `context:id` handles for VMs and disks
//! - [`watch`] - Wait for a watched object to satisfy a readiness predicate
//! - [`agent`] - Guest agent settings document and its builder
//! - [`actions`] - VM, disk and volume lifecycle operations
//! - [`kubecluster`] - Control-plane client seam (mocked in tests)
//! - [`cpi`] - Request envelope, verb decoding and dispatch
//! - [`config`] - Agent and cluster configuration
//! - [`validation`] - Label key/value, selector and quantity validation
//! - [`error`] - Error types for the CPI

#![deny(missing_docs)]

pub mod actions;
pub mod agent;
pub mod cid;
pub mod config;
pub mod cpi;
pub mod error;
pub mod kubecluster;
pub mod validation;
pub mod watch;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Object naming and correlation labels
// =============================================================================
// Every object the CPI creates is named after the raw id portion of a CID and
// carries a label with that id, which scopes every list and watch call.

/// Domain prefix for labels the CPI owns
pub const LABEL_PREFIX: &str = "bosh.cloudfoundry.org/";

/// Label carrying a VM's agent id on its pod, deployment and config map
pub const AGENT_ID_LABEL: &str = "bosh.cloudfoundry.org/agent-id";

/// Label carrying a disk id on its claim
pub const DISK_ID_LABEL: &str = "bosh.cloudfoundry.org/disk-id";

/// Pod annotation recording the VM's static IP
pub const IP_ADDRESS_ANNOTATION: &str = "bosh.cloudfoundry.org/ip-address";

/// Name of the container running the BOSH agent and jobs
pub const BOSH_JOB_CONTAINER: &str = "bosh-job";

/// Pod, deployment and config map name for an agent id
pub fn vm_object_name(agent_id: &str) -> String {
    format!("agent-{agent_id}")
}

/// Claim name (also the pod volume name) for a disk id
pub fn claim_name(disk_id: &str) -> String {
    format!("disk-{disk_id}")
}

/// `key=value` selector for a single label
pub fn label_selector(key: &str, value: &str) -> String {
    format!("{key}={value}")
}
