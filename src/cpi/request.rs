//! JSON request/response envelope

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    DiskCloudProperties, DiskMetadata, Environment, Networks, StemcellCloudProperties,
    VmCloudProperties,
};
use crate::cid::{DiskCid, VmCid};
use crate::{Error, Result};

/// A CPI request as written to stdin by the director
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Request {
    /// Verb name, e.g. "create_vm"
    pub method: String,
    /// Positional arguments
    #[serde(default)]
    pub arguments: Vec<Value>,
    /// Director context (director uuid, request id); informational only
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl Request {
    /// Decode a request from its JSON text
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::wrap("Decoding request", e))
    }
}

/// A decoded CPI call, one variant per verb
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    /// Report the CPI API version
    Info,
    /// Register a stemcell image
    CreateStemcell {
        /// Path of the uploaded stemcell tarball; unused
        image_path: String,
        /// Names the container image
        cloud_props: StemcellCloudProperties,
    },
    /// Forget a stemcell
    DeleteStemcell {
        /// Stemcell CID
        stemcell_cid: String,
    },
    /// Create a pod or deployment for an agent
    CreateVm {
        /// Agent id chosen by the director
        agent_id: String,
        /// Container image
        stemcell_cid: String,
        /// Resource pool cloud properties
        cloud_props: VmCloudProperties,
        /// Exactly one network
        networks: Networks,
        /// Disks the VM should be placed near; unused
        disk_cids: Vec<DiskCid>,
        /// Director environment for the agent
        env: Environment,
    },
    /// Delete a VM and its objects
    DeleteVm {
        /// VM to delete
        vm_cid: VmCid,
    },
    /// Check whether a VM exists
    HasVm {
        /// VM to look up
        vm_cid: VmCid,
    },
    /// Label a VM
    SetVmMetadata {
        /// VM to label
        vm_cid: VmCid,
        /// Director metadata
        metadata: BTreeMap<String, String>,
    },
    /// Create a persistent disk
    CreateDisk {
        /// Size in GiB
        size_gib: u64,
        /// Disk pool cloud properties
        cloud_props: DiskCloudProperties,
        /// VM the disk is destined for; unused
        vm_cid: Option<VmCid>,
    },
    /// Delete a persistent disk
    DeleteDisk {
        /// Disk to delete
        disk_cid: DiskCid,
    },
    /// Check whether a disk exists
    HasDisk {
        /// Disk to look up
        disk_cid: DiskCid,
    },
    /// Label and annotate a disk
    SetDiskMetadata {
        /// Disk to update
        disk_cid: DiskCid,
        /// Labels and annotations
        metadata: DiskMetadata,
    },
    /// Mount a disk into a VM
    AttachDisk {
        /// Target VM
        vm_cid: VmCid,
        /// Disk to mount
        disk_cid: DiskCid,
    },
    /// Unmount a disk from a VM
    DetachDisk {
        /// Target VM
        vm_cid: VmCid,
        /// Disk to unmount
        disk_cid: DiskCid,
    },
    /// List the disks mounted into a VM
    GetDisks {
        /// VM to inspect
        vm_cid: VmCid,
    },
    /// Refused
    RebootVm,
    /// Refused
    ConfigureNetworks,
    /// Refused
    SnapshotDisk,
    /// Refused
    DeleteSnapshot,
}

impl Call {
    /// Decode the verb and its positional arguments
    ///
    /// Argument lists must match the verb's arity exactly.
    pub fn from_request(request: &Request) -> Result<Self> {
        let args = &request.arguments;
        let call = match request.method.as_str() {
            "info" => Call::Info,
            "create_stemcell" => {
                let (image_path, cloud_props) = positional(args)?;
                Call::CreateStemcell {
                    image_path,
                    cloud_props,
                }
            }
            "delete_stemcell" => {
                let (stemcell_cid,) = positional(args)?;
                Call::DeleteStemcell { stemcell_cid }
            }
            "create_vm" => {
                let (agent_id, stemcell_cid, cloud_props, networks, disk_cids, env): (
                    _,
                    _,
                    _,
                    _,
                    Option<Vec<DiskCid>>,
                    Option<Environment>,
                ) = positional(args)?;
                Call::CreateVm {
                    agent_id,
                    stemcell_cid,
                    cloud_props,
                    networks,
                    disk_cids: disk_cids.unwrap_or_default(),
                    env: env.unwrap_or_default(),
                }
            }
            "delete_vm" => {
                let (vm_cid,) = positional(args)?;
                Call::DeleteVm { vm_cid }
            }
            "has_vm" => {
                let (vm_cid,) = positional(args)?;
                Call::HasVm { vm_cid }
            }
            "set_vm_metadata" => {
                let (vm_cid, metadata) = positional(args)?;
                Call::SetVmMetadata { vm_cid, metadata }
            }
            "create_disk" => {
                let (size_gib, cloud_props, vm_cid) = positional(args)?;
                Call::CreateDisk {
                    size_gib,
                    cloud_props,
                    vm_cid,
                }
            }
            "delete_disk" => {
                let (disk_cid,) = positional(args)?;
                Call::DeleteDisk { disk_cid }
            }
            "has_disk" => {
                let (disk_cid,) = positional(args)?;
                Call::HasDisk { disk_cid }
            }
            "set_disk_metadata" => {
                let (disk_cid, metadata) = positional(args)?;
                Call::SetDiskMetadata { disk_cid, metadata }
            }
            "attach_disk" => {
                let (vm_cid, disk_cid) = positional(args)?;
                Call::AttachDisk { vm_cid, disk_cid }
            }
            "detach_disk" => {
                let (vm_cid, disk_cid) = positional(args)?;
                Call::DetachDisk { vm_cid, disk_cid }
            }
            "get_disks" => {
                let (vm_cid,) = positional(args)?;
                Call::GetDisks { vm_cid }
            }
            "reboot_vm" => Call::RebootVm,
            "configure_networks" => Call::ConfigureNetworks,
            "snapshot_disk" => Call::SnapshotDisk,
            "delete_snapshot" => Call::DeleteSnapshot,
            other => return Err(Error::validation(format!("Unexpected method: {other:?}"))),
        };
        Ok(call)
    }

    /// The verb name
    pub fn method(&self) -> &'static str {
        match self {
            Call::Info => "info",
            Call::CreateStemcell { .. } => "create_stemcell",
            Call::DeleteStemcell { .. } => "delete_stemcell",
            Call::CreateVm { .. } => "create_vm",
            Call::DeleteVm { .. } => "delete_vm",
            Call::HasVm { .. } => "has_vm",
            Call::SetVmMetadata { .. } => "set_vm_metadata",
            Call::CreateDisk { .. } => "create_disk",
            Call::DeleteDisk { .. } => "delete_disk",
            Call::HasDisk { .. } => "has_disk",
            Call::SetDiskMetadata { .. } => "set_disk_metadata",
            Call::AttachDisk { .. } => "attach_disk",
            Call::DetachDisk { .. } => "detach_disk",
            Call::GetDisks { .. } => "get_disks",
            Call::RebootVm => "reboot_vm",
            Call::ConfigureNetworks => "configure_networks",
            Call::SnapshotDisk => "snapshot_disk",
            Call::DeleteSnapshot => "delete_snapshot",
        }
    }
}

/// Decode positional arguments into a tuple
fn positional<T: DeserializeOwned>(args: &[Value]) -> Result<T> {
    serde_json::from_value(Value::Array(args.to_vec()))
        .map_err(|e| Error::wrap("Decoding arguments", e))
}

/// The reply written to stdout
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Response {
    /// Verb result, `null` for verbs without one
    pub result: Value,
    /// Set when the call failed
    pub error: Option<ResponseError>,
    /// Always empty; logs go to stderr
    pub log: String,
}

/// Failure description in a [`Response`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponseError {
    /// CPI error class, e.g. "Bosh::Clouds::CloudError"
    #[serde(rename = "type")]
    pub type_: String,
    /// Full error chain
    pub message: String,
    /// Whether the director may retry the call
    pub ok_to_retry: bool,
}

impl Response {
    /// A successful reply
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            error: None,
            log: String::new(),
        }
    }

    /// A failed reply describing `err`
    pub fn err(err: &Error) -> Self {
        Self {
            result: Value::Null,
            error: Some(ResponseError {
                type_: err.bosh_type().to_string(),
                message: err.to_string(),
                ok_to_retry: err.is_retryable(),
            }),
            log: String::new(),
        }
    }
}
