//! Director-facing CPI types
//!
//! Argument shapes of the CPI verbs (networks, environment, cloud
//! properties), the JSON request/response envelope, and the dispatcher
//! that routes a decoded [`Call`] to the component implementing it.

mod dispatch;
mod request;

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{IngressBackend, IngressRule, IngressTLS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use dispatch::Cpi;
pub use request::{Call, Request, Response, ResponseError};

/// Director supplied environment, passed through to the agent untouched
pub type Environment = Map<String, Value>;

/// Networks by name
pub type Networks = BTreeMap<String, Network>;

/// A network as described by the director
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    /// "manual", "dynamic" or "vip"
    #[serde(rename = "type")]
    pub type_: String,
    /// Static IP, empty for dynamic networks
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
    /// Netmask
    #[serde(skip_serializing_if = "String::is_empty")]
    pub netmask: String,
    /// Gateway
    #[serde(skip_serializing_if = "String::is_empty")]
    pub gateway: String,
    /// DNS servers
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    /// Properties this network is the default for
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub default: Vec<String>,
    /// MAC address
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mac: String,
    /// Provider specific properties
    #[serde(skip_serializing_if = "Value::is_null")]
    pub cloud_properties: Value,
    /// Fields this CPI does not interpret but the agent may
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Cloud properties for `create_stemcell`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct StemcellCloudProperties {
    /// Container image used for every VM on this stemcell
    #[serde(default)]
    pub image: String,
}

/// Exposure of a VM through a service or ingress
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceProperties {
    /// Object name
    pub name: String,
    /// "ClusterIP" (default), "NodePort", "LoadBalancer" or "Ingress"
    #[serde(rename = "type")]
    pub type_: String,
    /// Requested cluster IP
    pub cluster_ip: String,
    /// Exposed ports
    pub ports: Vec<PortProperties>,
    /// Pod selector; defaults to the VM's agent-id label
    pub selector: BTreeMap<String, String>,
    /// Requested load balancer IP (LoadBalancer only)
    pub load_balancer_ip: String,
    /// External IPs
    pub external_ips: Vec<String>,
    /// Ingress default backend
    pub backend: Option<IngressBackend>,
    /// Ingress TLS
    pub tls: Vec<IngressTLS>,
    /// Ingress rules
    pub rules: Vec<IngressRule>,
}

/// A service port
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PortProperties {
    /// Port name
    pub name: String,
    /// Node port (NodePort / LoadBalancer)
    pub node_port: i32,
    /// Service port
    pub port: i32,
    /// "TCP" or "UDP"
    pub protocol: String,
    /// Container port
    pub target_port: i32,
}

/// A secret created alongside a VM
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SecretProperties {
    /// Secret name
    pub name: String,
    /// "Opaque" (default), "DockerCfg", "ServiceAccountToken" or "TLS"
    #[serde(rename = "type")]
    pub type_: String,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
    /// Plain data; the `.dockercfg` key names a file to read instead
    pub data: BTreeMap<String, String>,
    /// String data
    pub string_data: BTreeMap<String, String>,
}

/// Container resource limits and requests by resource name
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourceProperties {
    /// Limits ("cpu", "memory")
    pub limits: Option<BTreeMap<String, String>>,
    /// Requests ("cpu", "memory")
    pub requests: Option<BTreeMap<String, String>>,
}

/// Cloud properties for `create_vm`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VmCloudProperties {
    /// Kubeconfig context; empty selects the current context
    pub context: String,
    /// Services and ingresses
    pub services: Vec<ServiceProperties>,
    /// Secrets
    pub secrets: Vec<SecretProperties>,
    /// Container resources
    pub resources: ResourceProperties,
    /// When set, run the VM as a deployment with this many replicas
    pub replicas: Option<i32>,
}

/// Cloud properties for `create_disk`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DiskCloudProperties {
    /// Kubeconfig context; empty selects the current context
    pub context: String,
    /// Storage class annotation
    pub storage_class: Option<String>,
    /// Storage provisioner annotation
    pub storage_provisioner: Option<String>,
}

/// Argument of `set_disk_metadata`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DiskMetadata {
    /// Labels, prefixed with the CPI label domain before they are applied
    pub labels: BTreeMap<String, String>,
    /// Annotations, applied as given
    pub annotations: BTreeMap<String, String>,
}
