//! Disk lifecycle: a disk is a persistent volume claim labelled with its id

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::info;

use super::{generate_id, ignore_not_found, single_label};
use crate::cid::{DiskCid, VmCid};
use crate::cpi::{DiskCloudProperties, DiskMetadata};
use crate::kubecluster::ClientProvider;
use crate::validation::{validate_label_value, validate_qualified_name};
use crate::watch::wait_for_claim_bound;
use crate::{claim_name, label_selector, vm_object_name, Error, Result};
use crate::{DISK_ID_LABEL, LABEL_PREFIX};

const STORAGE_CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";
const STORAGE_PROVISIONER_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-provisioner";

/// Creates, deletes, finds and labels disks
pub struct DiskManager {
    provider: Arc<dyn ClientProvider>,
    disk_ready_timeout: Duration,
    new_id: fn() -> String,
}

impl DiskManager {
    /// Create a manager that names new disks with random UUIDs
    pub fn new(provider: Arc<dyn ClientProvider>, disk_ready_timeout: Duration) -> Self {
        Self {
            provider,
            disk_ready_timeout,
            new_id: generate_id,
        }
    }

    /// Replace the disk id generator
    pub fn with_id_generator(mut self, new_id: fn() -> String) -> Self {
        self.new_id = new_id;
        self
    }

    /// Create a claim of `size_gib` GiB and wait until it is bound
    ///
    /// A claim that never binds is left in place for inspection.
    pub async fn create_disk(
        &self,
        size_gib: u64,
        cloud_props: &DiskCloudProperties,
        _vm_cid: Option<&VmCid>,
    ) -> Result<DiskCid> {
        let disk_id = (self.new_id)();
        let client = self
            .provider
            .client(&cloud_props.context)
            .await
            .map_err(|e| Error::wrap("Creating client", e))?;

        let mut annotations = BTreeMap::new();
        if let Some(class) = &cloud_props.storage_class {
            annotations.insert(STORAGE_CLASS_ANNOTATION.to_string(), class.clone());
        }
        if let Some(provisioner) = &cloud_props.storage_provisioner {
            annotations.insert(
                STORAGE_PROVISIONER_ANNOTATION.to_string(),
                provisioner.clone(),
            );
        }

        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(claim_name(&disk_id)),
                namespace: Some(client.namespace()),
                labels: Some(single_label(DISK_ID_LABEL, &disk_id)),
                annotations: (!annotations.is_empty()).then_some(annotations),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteMany".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(format!("{size_gib}Gi")),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        };

        let created = client
            .create_claim(&claim)
            .await
            .map_err(|e| Error::wrap("Creating claim", e))?;
        let resource_version = created.metadata.resource_version.unwrap_or_default();

        wait_for_claim_bound(client.as_ref(), &disk_id, &resource_version, self.disk_ready_timeout)
            .await
            .map_err(|e| Error::wrap("Waiting for disk", e))?;

        info!(disk_id = %disk_id, context = %client.context(), size_gib, "created disk");
        Ok(DiskCid::new(&client.context(), &disk_id))
    }

    /// Delete the disk's claim; a missing claim is not an error
    pub async fn delete_disk(&self, disk_cid: &DiskCid) -> Result<()> {
        let (context, disk_id) = disk_cid.parse()?;
        let client = self
            .provider
            .client(context)
            .await
            .map_err(|e| Error::wrap("Creating client", e))?;

        ignore_not_found(client.delete_claim(&claim_name(disk_id)).await)
            .map_err(|e| Error::wrap("Deleting claim", e))?;
        info!(disk_id, context, "deleted disk");
        Ok(())
    }

    /// Whether a claim carries the disk's id label
    pub async fn has_disk(&self, disk_cid: &DiskCid) -> Result<bool> {
        let (context, disk_id) = disk_cid.parse()?;
        let client = self
            .provider
            .client(context)
            .await
            .map_err(|e| Error::wrap("Creating client", e))?;

        let claims = client
            .list_claims(&label_selector(DISK_ID_LABEL, disk_id))
            .await
            .map_err(|e| Error::wrap("Listing claims", e))?;
        Ok(!claims.is_empty())
    }

    /// Apply director labels and annotations to the disk's claim
    ///
    /// Every entry is validated first; one bad entry rejects the call and
    /// nothing is written.
    pub async fn set_disk_metadata(&self, disk_cid: &DiskCid, metadata: &DiskMetadata) -> Result<()> {
        let (context, disk_id) = disk_cid.parse()?;
        let (labels, annotations) = disk_metadata(metadata)?;

        let client = self
            .provider
            .client(context)
            .await
            .map_err(|e| Error::wrap("Creating client", e))?;

        let mut claim = client
            .get_claim(&claim_name(disk_id))
            .await
            .map_err(|e| Error::wrap("Getting claim", e))?;
        claim.metadata.labels.get_or_insert_with(BTreeMap::new).extend(labels);
        claim
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations);

        client
            .update_claim(&claim)
            .await
            .map_err(|e| Error::wrap("Updating claim", e))?;
        Ok(())
    }

    /// CIDs of the claim-backed disks mounted into the VM's pod
    ///
    /// A VM without a pod has no disks.
    pub async fn get_disks(&self, vm_cid: &VmCid) -> Result<Vec<DiskCid>> {
        let (context, agent_id) = vm_cid.parse()?;
        let client = self
            .provider
            .client(context)
            .await
            .map_err(|e| Error::wrap("Creating client", e))?;

        let pod = match client.get_pod(&vm_object_name(agent_id)).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(Error::wrap("Getting pod", e)),
        };

        let claim_names = pod
            .spec
            .iter()
            .flat_map(|spec| spec.volumes.iter().flatten())
            .filter_map(|v| v.persistent_volume_claim.as_ref())
            .map(|source| source.claim_name.clone());

        let mut disks = Vec::new();
        for name in claim_names {
            let claim = match client.get_claim(&name).await {
                Ok(claim) => claim,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(Error::wrap("Getting PVC", e)),
            };
            if let Some(disk_id) = claim.metadata.labels.as_ref().and_then(|l| l.get(DISK_ID_LABEL)) {
                disks.push(DiskCid::new(context, disk_id));
            }
        }
        Ok(disks)
    }
}

type Entries = BTreeMap<String, String>;

fn disk_metadata(metadata: &DiskMetadata) -> Result<(Entries, Entries)> {
    let reject = |what: &str, key: &str, value: &str, reason: String| {
        Error::validation(format!(
            "Error setting disk metadata: {what} \"{key}\": \"{value}\": {reason}"
        ))
    };

    let mut labels = BTreeMap::new();
    for (key, value) in &metadata.labels {
        let value = if key == "attached_at" {
            value.replace(':', "_")
        } else {
            value.clone()
        };
        let key = format!("{LABEL_PREFIX}{key}");
        validate_qualified_name(&key).map_err(|r| reject("label", &key, &value, r))?;
        validate_label_value(&value).map_err(|r| reject("label", &key, &value, r))?;
        labels.insert(key, value);
    }

    let mut annotations = BTreeMap::new();
    for (key, value) in &metadata.annotations {
        validate_qualified_name(key).map_err(|r| reject("annotation", key, value, r))?;
        annotations.insert(key.clone(), value.clone());
    }

    Ok((labels, annotations))
}
