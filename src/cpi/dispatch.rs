//! Routes decoded calls to the component that implements them

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error};

use super::{Call, Request, Response};
use crate::actions::{self, DiskManager, VmManager, VolumeManager};
use crate::agent::SettingsBuilder;
use crate::config::CpiConfig;
use crate::kubecluster::ClientProvider;
use crate::{Error, Result};

/// The CPI: one manager per object family sharing a client provider
pub struct Cpi {
    vms: VmManager,
    disks: DiskManager,
    volumes: VolumeManager,
}

impl Cpi {
    /// Build every manager from the process configuration
    pub fn new(config: &CpiConfig, provider: Arc<dyn ClientProvider>) -> Self {
        let timeouts = config.timeouts;
        Self {
            vms: VmManager::new(
                provider.clone(),
                SettingsBuilder::new(config.agent.clone()),
                timeouts.deployment_ready,
            ),
            disks: DiskManager::new(provider.clone(), timeouts.disk_ready),
            volumes: VolumeManager::new(provider, timeouts.pod_ready, timeouts.post_recreate_delay),
        }
    }

    /// Decode and run a request, reporting any failure in the envelope
    pub async fn handle(&self, request: &Request) -> Response {
        let outcome = match Call::from_request(request) {
            Ok(call) => self.dispatch(call).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(result) => Response::ok(result),
            Err(e) => {
                error!(method = %request.method, error = %e, "CPI call failed");
                Response::err(&e)
            }
        }
    }

    /// Run a single call
    pub async fn dispatch(&self, call: Call) -> Result<Value> {
        let method = call.method();
        debug!(method, "dispatching");

        match call {
            Call::Info => Ok(actions::info()),

            Call::CreateStemcell {
                image_path,
                cloud_props,
            } => Ok(json!(actions::create_stemcell(&image_path, &cloud_props)?)),
            Call::DeleteStemcell { stemcell_cid } => {
                actions::delete_stemcell(&stemcell_cid)?;
                Ok(Value::Null)
            }

            Call::CreateVm {
                agent_id,
                stemcell_cid,
                cloud_props,
                networks,
                disk_cids,
                env,
            } => {
                let vm_cid = self
                    .vms
                    .create_vm(&agent_id, &stemcell_cid, &cloud_props, &networks, &disk_cids, &env)
                    .await?;
                Ok(json!(vm_cid))
            }
            Call::DeleteVm { vm_cid } => {
                self.vms.delete_vm(&vm_cid).await?;
                Ok(Value::Null)
            }
            Call::HasVm { vm_cid } => Ok(json!(self.vms.has_vm(&vm_cid).await?)),
            Call::SetVmMetadata { vm_cid, metadata } => {
                self.vms.set_vm_metadata(&vm_cid, &metadata).await?;
                Ok(Value::Null)
            }

            Call::CreateDisk {
                size_gib,
                cloud_props,
                vm_cid,
            } => {
                let disk_cid = self
                    .disks
                    .create_disk(size_gib, &cloud_props, vm_cid.as_ref())
                    .await?;
                Ok(json!(disk_cid))
            }
            Call::DeleteDisk { disk_cid } => {
                self.disks.delete_disk(&disk_cid).await?;
                Ok(Value::Null)
            }
            Call::HasDisk { disk_cid } => Ok(json!(self.disks.has_disk(&disk_cid).await?)),
            Call::SetDiskMetadata { disk_cid, metadata } => {
                self.disks.set_disk_metadata(&disk_cid, &metadata).await?;
                Ok(Value::Null)
            }
            Call::GetDisks { vm_cid } => Ok(json!(self.disks.get_disks(&vm_cid).await?)),

            Call::AttachDisk { vm_cid, disk_cid } => {
                self.volumes.attach_disk(&vm_cid, &disk_cid).await?;
                Ok(Value::Null)
            }
            Call::DetachDisk { vm_cid, disk_cid } => {
                self.volumes.detach_disk(&vm_cid, &disk_cid).await?;
                Ok(Value::Null)
            }

            Call::RebootVm | Call::ConfigureNetworks => Err(Error::NotSupported {
                method: method.to_string(),
            }),
            Call::SnapshotDisk | Call::DeleteSnapshot => Err(Error::NotImplemented {
                method: method.to_string(),
            }),
        }
    }
}
