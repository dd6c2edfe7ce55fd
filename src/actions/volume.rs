//! Disk attach and detach
//!
//! Pods cannot gain or lose volumes in place, so attaching or detaching a
//! disk recreates the VM's pod:
//!
//! 1. fetch the pod and compute its new volume list
//! 2. record the change in the agent settings config map
//! 3. backfill the IP annotation, strip server-managed metadata and status
//! 4. delete the pod immediately and create it again from the new spec
//! 5. wait for the new pod to become ready, then give the agent time to start
//!
//! The config map is written before the pod is touched. If the recreate then
//! fails the config map is not rolled back; the next successful recreate
//! brings the pod in line with it.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use crate::agent::{disk_mount_path, Settings, INSTANCE_SETTINGS_KEY};
use crate::cid::{DiskCid, VmCid};
use crate::kubecluster::{ClientProvider, ClusterClient};
use crate::watch::wait_for_pod_ready;
use crate::{claim_name, vm_object_name, Error, Result};
use crate::{BOSH_JOB_CONTAINER, IP_ADDRESS_ANNOTATION};

/// Direction of a volume change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeOp {
    /// Mount the disk
    Add,
    /// Unmount the disk
    Remove,
}

impl VolumeOp {
    fn step(self) -> &'static str {
        match self {
            VolumeOp::Add => "Recreating pod to attach disk",
            VolumeOp::Remove => "Recreating pod to detach disk",
        }
    }
}

/// Attaches and detaches disks by recreating the VM's pod
pub struct VolumeManager {
    provider: Arc<dyn ClientProvider>,
    pod_ready_timeout: Duration,
    post_recreate_delay: Duration,
}

impl VolumeManager {
    /// Create a manager
    pub fn new(
        provider: Arc<dyn ClientProvider>,
        pod_ready_timeout: Duration,
        post_recreate_delay: Duration,
    ) -> Self {
        Self {
            provider,
            pod_ready_timeout,
            post_recreate_delay,
        }
    }

    /// Mount `disk_cid` into the VM at `/mnt/<disk id>`
    pub async fn attach_disk(&self, vm_cid: &VmCid, disk_cid: &DiskCid) -> Result<()> {
        self.change(VolumeOp::Add, vm_cid, disk_cid).await
    }

    /// Unmount `disk_cid` from the VM
    pub async fn detach_disk(&self, vm_cid: &VmCid, disk_cid: &DiskCid) -> Result<()> {
        self.change(VolumeOp::Remove, vm_cid, disk_cid).await
    }

    async fn change(&self, op: VolumeOp, vm_cid: &VmCid, disk_cid: &DiskCid) -> Result<()> {
        let (vm_context, agent_id) = vm_cid.parse()?;
        let (disk_context, disk_id) = disk_cid.parse()?;
        if disk_context != vm_context {
            return Err(Error::ContextMismatch {
                disk_context: disk_context.to_string(),
                vm_context: vm_context.to_string(),
            });
        }

        let client = self
            .provider
            .client(disk_context)
            .await
            .map_err(|e| Error::wrap("Creating client", e))?;

        self.recreate_pod(client.as_ref(), op, agent_id, disk_id)
            .await
            .map_err(|e| Error::wrap(op.step(), e))?;

        info!(agent_id, disk_id, context = disk_context, ?op, "recreated pod with new volumes");
        Ok(())
    }

    async fn recreate_pod(
        &self,
        client: &dyn ClusterClient,
        op: VolumeOp,
        agent_id: &str,
        disk_id: &str,
    ) -> Result<()> {
        let name = vm_object_name(agent_id);
        let pod = client
            .get_pod(&name)
            .await
            .map_err(|e| Error::wrap("Getting pod", e))?;

        let spec = pod
            .spec
            .as_ref()
            .ok_or_else(|| Error::validation(format!("pod {name} has no spec")))
            .and_then(|spec| update_volumes(op, spec, disk_id))
            .map_err(|e| Error::wrap("Updating volumes", e))?;

        update_config_map_disks(client, op, agent_id, disk_id)
            .await
            .map_err(|e| Error::wrap("Updating disk configMap", e))?;

        let replacement = Pod {
            metadata: creation_metadata(&pod),
            spec: Some(spec),
            status: None,
        };

        client
            .delete_pod(&name)
            .await
            .map_err(|e| Error::wrap("Deleting pod", e))?;
        let created = client
            .create_pod(&replacement)
            .await
            .map_err(|e| Error::wrap("Recreating pod", e))?;

        let resource_version = created.metadata.resource_version.unwrap_or_default();
        wait_for_pod_ready(client, agent_id, &resource_version, self.pod_ready_timeout)
            .await
            .map_err(|e| Error::wrap("Waiting for pod recreate", e))?;

        debug!(agent_id, delay = ?self.post_recreate_delay, "pod ready, waiting for agent start");
        tokio::time::sleep(self.post_recreate_delay).await;
        Ok(())
    }
}

/// Metadata for recreating `pod`: identity, labels and annotations only
///
/// The IP annotation is backfilled from the pod's observed IP when missing.
fn creation_metadata(pod: &Pod) -> ObjectMeta {
    let mut annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let has_ip = annotations
        .get(IP_ADDRESS_ANNOTATION)
        .is_some_and(|ip| !ip.is_empty());
    if !has_ip {
        let observed = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .unwrap_or_default();
        annotations.insert(IP_ADDRESS_ANNOTATION.to_string(), observed);
    }

    ObjectMeta {
        name: pod.metadata.name.clone(),
        namespace: pod.metadata.namespace.clone(),
        annotations: Some(annotations),
        labels: pod.metadata.labels.clone(),
        ..Default::default()
    }
}

async fn update_config_map_disks(
    client: &dyn ClusterClient,
    op: VolumeOp,
    agent_id: &str,
    disk_id: &str,
) -> Result<()> {
    let mut config_map = client
        .get_config_map(&vm_object_name(agent_id))
        .await
        .map_err(|e| Error::wrap("Getting configMaps", e))?;

    let mut settings = Settings::from_config_map(&config_map)?;
    let disk_cid = DiskCid::new(&client.context(), disk_id);
    match op {
        VolumeOp::Add => settings.attach_persistent(&disk_cid, disk_id),
        VolumeOp::Remove => settings.detach_persistent(&disk_cid),
    }

    config_map
        .data
        .get_or_insert_with(Default::default)
        .insert(INSTANCE_SETTINGS_KEY.to_string(), settings.to_json()?);

    client
        .update_config_map(&config_map)
        .await
        .map_err(|e| Error::wrap("Updating configMap", e))?;
    Ok(())
}

/// A copy of `spec` with the disk's volume and job mount added or removed
///
/// The volume `disk-<id>` and its mount on the job container always change
/// together. Both lists are rebuilt; every other entry keeps its position.
/// Adding a disk that is already present leaves a single entry for it.
pub fn update_volumes(op: VolumeOp, spec: &PodSpec, disk_id: &str) -> Result<PodSpec> {
    let volume_name = claim_name(disk_id);
    if !spec.containers.iter().any(|c| c.name == BOSH_JOB_CONTAINER) {
        return Err(Error::validation(format!(
            "pod has no {BOSH_JOB_CONTAINER} container to mount {volume_name} into"
        )));
    }

    let mut volumes: Vec<Volume> = spec
        .volumes
        .iter()
        .flatten()
        .filter(|v| v.name != volume_name)
        .cloned()
        .collect();
    if op == VolumeOp::Add {
        volumes.push(Volume {
            name: volume_name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: volume_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let containers = spec
        .containers
        .iter()
        .map(|container| {
            if container.name != BOSH_JOB_CONTAINER {
                return container.clone();
            }
            let mut mounts: Vec<VolumeMount> = container
                .volume_mounts
                .iter()
                .flatten()
                .filter(|m| m.name != volume_name)
                .cloned()
                .collect();
            if op == VolumeOp::Add {
                mounts.push(VolumeMount {
                    name: volume_name.clone(),
                    mount_path: disk_mount_path(disk_id),
                    ..Default::default()
                });
            }
            let mut container = container.clone();
            container.volume_mounts = Some(mounts);
            container
        })
        .collect();

    Ok(PodSpec {
        volumes: Some(volumes),
        containers,
        ..spec.clone()
    })
}
