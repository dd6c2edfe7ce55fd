//! Process configuration
//!
//! The CPI is configured once at start-up from two JSON files (guest agent
//! settings and cluster credentials) plus timeouts from the command line.
//! The resulting [`CpiConfig`] is handed to each component constructor.

mod kubernetes;

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use kubernetes::{AuthInfo, Cluster, Context, KubeConfig};

/// How long to wait for a new claim to be bound
pub const DEFAULT_DISK_READY_TIMEOUT: Duration = Duration::from_secs(600);
/// How long to wait for a recreated pod to report ready
pub const DEFAULT_POD_READY_TIMEOUT: Duration = Duration::from_secs(300);
/// How long to wait for a deployment to reach its replica count
pub const DEFAULT_DEPLOYMENT_READY_TIMEOUT: Duration = Duration::from_secs(300);
/// Grace delay after a pod recreate for the in-pod agent to start
pub const DEFAULT_POST_RECREATE_DELAY: Duration = Duration::from_secs(15);

/// Blobstore endpoint handed to the guest agent
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Blobstore {
    /// Blobstore provider (e.g. "dav", "s3")
    pub provider: String,
    /// Provider specific options
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Static guest agent configuration copied into every VM's settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Blobstore the agent fetches packages from
    pub blobstore: Blobstore,
    /// Message bus URL
    pub mbus: String,
    /// NTP servers
    #[serde(default)]
    pub ntp: Vec<String>,
}

/// Deadlines for every readiness wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Claim binding deadline
    pub disk_ready: Duration,
    /// Recreated pod readiness deadline
    pub pod_ready: Duration,
    /// Deployment availability deadline
    pub deployment_ready: Duration,
    /// Fixed sleep after a recreated pod is ready
    pub post_recreate_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            disk_ready: DEFAULT_DISK_READY_TIMEOUT,
            pod_ready: DEFAULT_POD_READY_TIMEOUT,
            deployment_ready: DEFAULT_DEPLOYMENT_READY_TIMEOUT,
            post_recreate_delay: DEFAULT_POST_RECREATE_DELAY,
        }
    }
}

/// Everything the CPI needs, built once per process
#[derive(Clone, Debug)]
pub struct CpiConfig {
    /// Guest agent configuration
    pub agent: AgentConfig,
    /// Cluster credentials keyed by context
    pub kubernetes: KubeConfig,
    /// Readiness deadlines
    pub timeouts: Timeouts,
}

impl CpiConfig {
    /// Load the agent and kubernetes config files
    pub fn load(agent_path: &Path, kube_path: &Path, timeouts: Timeouts) -> Result<Self> {
        Ok(Self {
            agent: load_json(agent_path)?,
            kubernetes: load_json(kube_path)?,
            timeouts,
        })
    }
}

/// Read and decode a JSON config file
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("opening {}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::config(format!("decoding {}: {}", path.display(), e)))
}
