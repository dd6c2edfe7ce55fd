//! Guest agent settings
//!
//! The agent running inside each pod reads its configuration from a JSON
//! document mounted out of the VM's config map. This module owns the shape
//! of that document and the builder that fills it in at VM creation.
//!
//! The only field the CPI touches after creation is the persistent disk
//! map, which attach/detach rewrites through [`Settings::attach_persistent`]
//! and [`Settings::detach_persistent`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cid::DiskCid;
use crate::config::{AgentConfig, Blobstore};
use crate::cpi::{Environment, Networks};
use crate::{Error, Result};

/// Config map key holding the serialized settings
pub const INSTANCE_SETTINGS_KEY: &str = "instance_settings";

/// File name the settings are projected to inside the pod
pub const INSTANCE_SETTINGS_FILE: &str = "instance_settings.json";

/// Mount path of a persistent disk inside the pod
pub fn disk_mount_path(disk_id: &str) -> String {
    format!("/mnt/{disk_id}")
}

/// Network configuration as the agent understands it
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    /// "manual", "dynamic" or "vip"
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
    /// Static IP
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
    /// Netmask
    #[serde(skip_serializing_if = "String::is_empty")]
    pub netmask: String,
    /// Gateway
    #[serde(skip_serializing_if = "String::is_empty")]
    pub gateway: String,
    /// Whether the agent already resolved a dynamic address
    pub resolved: bool,
    /// Whether the agent should run DHCP
    pub use_dhcp: bool,
    /// Properties this network is the default for ("dns", "gateway")
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub default: Vec<String>,
    /// DNS servers
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    /// MAC address
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mac: String,
    /// Network is configured by the platform, not by the agent
    pub preconfigured: bool,
    /// Provider specific properties
    #[serde(skip_serializing_if = "Value::is_null")]
    pub cloud_properties: Value,
}

/// Disk layout known to the agent
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Disks {
    /// System disk device
    #[serde(skip_serializing_if = "String::is_empty")]
    pub system: String,
    /// Ephemeral disk device
    #[serde(skip_serializing_if = "Value::is_null")]
    pub ephemeral: Value,
    /// Disk CID to mount path
    pub persistent: BTreeMap<String, String>,
}

/// VM identity
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    /// VM name
    pub name: String,
}

/// The settings document read by the guest agent
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Agent identifier
    pub agent_id: String,
    /// Blobstore endpoint
    pub blobstore: Blobstore,
    /// Disks
    #[serde(default)]
    pub disks: Disks,
    /// Director supplied environment
    #[serde(default)]
    pub env: Environment,
    /// Networks by name
    #[serde(default)]
    pub networks: BTreeMap<String, Network>,
    /// NTP servers
    #[serde(default)]
    pub ntp: Vec<String>,
    /// Message bus URL
    pub mbus: String,
    /// VM identity
    #[serde(default)]
    pub vm: Vm,
}

impl Settings {
    /// Record a persistent disk mount
    pub fn attach_persistent(&mut self, disk_cid: &DiskCid, disk_id: &str) {
        self.disks
            .persistent
            .insert(disk_cid.to_string(), disk_mount_path(disk_id));
    }

    /// Forget a persistent disk mount
    pub fn detach_persistent(&mut self, disk_cid: &DiskCid) {
        self.disks.persistent.remove(disk_cid.as_str());
    }

    /// Decode the settings stored in a VM's config map
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self> {
        let raw = cm
            .data
            .as_ref()
            .and_then(|d| d.get(INSTANCE_SETTINGS_KEY))
            .ok_or_else(|| {
                Error::serialization(format!(
                    "config map has no {INSTANCE_SETTINGS_KEY} key"
                ))
            })?;
        serde_json::from_str(raw)
            .map_err(|e| Error::wrap("Unmarshalling instance settings", e))
    }

    /// Serialize for storage in a config map
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::wrap("Marshalling instance settings", e))
    }
}

/// Builds the initial settings document for a new VM
#[derive(Clone, Debug)]
pub struct SettingsBuilder {
    agent: AgentConfig,
}

impl SettingsBuilder {
    /// Create a builder around the process-wide agent configuration
    pub fn new(agent: AgentConfig) -> Self {
        Self { agent }
    }

    /// Build settings for `agent_id`
    ///
    /// Every network is marked preconfigured since the cluster network
    /// assigns addresses itself. The persistent disk map starts empty.
    pub fn build(&self, agent_id: &str, networks: &Networks, env: &Environment) -> Result<Settings> {
        let mut agent_networks = BTreeMap::new();
        for (name, network) in networks {
            let mut agent_network: Network = remarshal(network)
                .map_err(|e| Error::wrap(format!("Remarshalling network {name}"), e))?;
            agent_network.preconfigured = true;
            agent_networks.insert(name.clone(), agent_network);
        }

        Ok(Settings {
            agent_id: agent_id.to_string(),
            blobstore: self.agent.blobstore.clone(),
            disks: Disks::default(),
            env: env.clone(),
            networks: agent_networks,
            ntp: self.agent.ntp.clone(),
            mbus: self.agent.mbus.clone(),
            vm: Vm {
                name: agent_id.to_string(),
            },
        })
    }
}

/// Convert between two serde shapes through JSON
fn remarshal<S: Serialize, T: serde::de::DeserializeOwned>(source: &S) -> Result<T> {
    let value = serde_json::to_value(source)?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpi::Network as CpiNetwork;
    use serde_json::json;

    fn agent_config() -> AgentConfig {
        AgentConfig {
            blobstore: Blobstore {
                provider: "dav".to_string(),
                options: json!({"endpoint": "http://blobstore"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            },
            mbus: "nats://mbus".to_string(),
            ntp: vec!["0.pool.ntp.org".to_string()],
        }
    }

    fn networks() -> Networks {
        let mut networks = Networks::new();
        networks.insert(
            "default".to_string(),
            CpiNetwork {
                type_: "manual".to_string(),
                ip: "10.0.0.5".to_string(),
                netmask: "255.255.255.0".to_string(),
                gateway: "10.0.0.1".to_string(),
                dns: vec!["8.8.8.8".to_string()],
                default: vec!["dns".to_string(), "gateway".to_string()],
                ..Default::default()
            },
        );
        networks
    }

    fn env() -> Environment {
        json!({"bosh": {"password": "secret"}})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_build_copies_static_agent_config() {
        let settings = SettingsBuilder::new(agent_config())
            .build("agent-id", &networks(), &env())
            .unwrap();

        assert_eq!(settings.blobstore, agent_config().blobstore);
        assert_eq!(settings.mbus, "nats://mbus");
        assert_eq!(settings.ntp, vec!["0.pool.ntp.org".to_string()]);
    }

    #[test]
    fn test_build_sets_identity_and_env() {
        let settings = SettingsBuilder::new(agent_config())
            .build("agent-id", &networks(), &env())
            .unwrap();

        assert_eq!(settings.agent_id, "agent-id");
        assert_eq!(settings.vm.name, "agent-id");
        assert_eq!(settings.env, env());
        assert!(settings.disks.persistent.is_empty());
    }

    #[test]
    fn test_build_marks_networks_preconfigured() {
        let settings = SettingsBuilder::new(agent_config())
            .build("agent-id", &networks(), &env())
            .unwrap();

        let network = &settings.networks["default"];
        assert!(network.preconfigured);
        assert_eq!(network.type_, "manual");
        assert_eq!(network.ip, "10.0.0.5");
        assert_eq!(network.netmask, "255.255.255.0");
        assert_eq!(network.gateway, "10.0.0.1");
        assert_eq!(network.dns, vec!["8.8.8.8".to_string()]);
        assert_eq!(network.default, vec!["dns".to_string(), "gateway".to_string()]);
    }

    #[test]
    fn test_build_fails_when_a_network_cannot_be_remarshalled() {
        let mut networks = networks();
        if let Some(network) = networks.get_mut("default") {
            network.extra.insert("use_dhcp".to_string(), json!("sometimes"));
        }

        let err = SettingsBuilder::new(agent_config())
            .build("agent-id", &networks, &env())
            .unwrap_err();
        assert!(err.to_string().contains("Remarshalling network default"));
    }

    #[test]
    fn test_attach_then_detach_restores_disk_map() {
        let mut settings = SettingsBuilder::new(agent_config())
            .build("agent-id", &networks(), &env())
            .unwrap();
        settings
            .disks
            .persistent
            .insert("bosh:existing".to_string(), "/mnt/existing".to_string());
        let before = settings.disks.persistent.clone();

        let cid = DiskCid::new("bosh", "disk-guid");
        settings.attach_persistent(&cid, "disk-guid");
        assert_eq!(
            settings.disks.persistent.get("bosh:disk-guid").map(String::as_str),
            Some("/mnt/disk-guid")
        );

        settings.detach_persistent(&cid);
        assert_eq!(settings.disks.persistent, before);
    }

    #[test]
    fn test_config_map_round_trip() {
        let settings = SettingsBuilder::new(agent_config())
            .build("agent-id", &networks(), &env())
            .unwrap();
        let cm = ConfigMap {
            data: Some(BTreeMap::from([(
                INSTANCE_SETTINGS_KEY.to_string(),
                settings.to_json().unwrap(),
            )])),
            ..Default::default()
        };

        assert_eq!(Settings::from_config_map(&cm).unwrap(), settings);
    }

    #[test]
    fn test_config_map_without_settings_key() {
        let err = Settings::from_config_map(&ConfigMap::default()).unwrap_err();
        assert!(err.to_string().contains(INSTANCE_SETTINGS_KEY));
    }
}
