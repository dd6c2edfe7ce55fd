//! VM lifecycle: a VM is a pod (or a deployment when replicas are requested)
//! running the stemcell image, configured through a config map

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, KeyToPath, Pod, PodSpec,
    PodTemplateSpec, ResourceRequirements, Secret, SecurityContext, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{Ingress, IngressSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use tracing::{debug, info, warn};

use super::{ensure_namespace, ignore_not_found, single_label};
use crate::agent::{SettingsBuilder, INSTANCE_SETTINGS_FILE, INSTANCE_SETTINGS_KEY};
use crate::cid::{DiskCid, VmCid};
use crate::cpi::{
    Environment, Network, Networks, ResourceProperties, SecretProperties, ServiceProperties,
    VmCloudProperties,
};
use crate::kubecluster::{ClientProvider, ClusterClient};
use crate::validation::{validate_label_value, validate_qualified_name, validate_quantity};
use crate::watch::wait_for_deployment_available;
use crate::{label_selector, vm_object_name, Error, Result};
use crate::{AGENT_ID_LABEL, BOSH_JOB_CONTAINER, IP_ADDRESS_ANNOTATION, LABEL_PREFIX};

/// Deadline the deployment controller applies to each rollout
pub const PROGRESS_DEADLINE_SECONDS: i32 = 30;

const CONFIG_VOLUME: &str = "bosh-config";
const EPHEMERAL_VOLUME: &str = "bosh-ephemeral";
const SETTINGS_MOUNT_PATH: &str = "/var/vcap/bosh/instance_settings.json";
const EPHEMERAL_MOUNT_PATH: &str = "/var/vcap/data";
const AGENT_COMMAND: &str = "/usr/sbin/runsvdir-start";

/// Creates, deletes, finds and labels VMs
pub struct VmManager {
    provider: Arc<dyn ClientProvider>,
    settings: SettingsBuilder,
    deployment_ready_timeout: Duration,
}

impl VmManager {
    /// Create a manager
    pub fn new(
        provider: Arc<dyn ClientProvider>,
        settings: SettingsBuilder,
        deployment_ready_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            settings,
            deployment_ready_timeout,
        }
    }

    /// Create a VM for `agent_id` running the `stemcell_cid` image
    ///
    /// Input is validated before anything is written: exactly one network,
    /// a positive replica count when one is given, and supported resource
    /// names and quantities. A deployment is awaited until every replica is
    /// available; a bare pod is returned as soon as it is accepted.
    pub async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        cloud_props: &VmCloudProperties,
        networks: &Networks,
        _disk_cids: &[DiskCid],
        env: &Environment,
    ) -> Result<VmCid> {
        let network = single_network(networks).map_err(|e| Error::wrap("Getting network", e))?;
        if let Some(replicas) = cloud_props.replicas {
            if replicas < 1 {
                return Err(Error::validation(format!(
                    "Invalid number of replicas specified in cloud properties: {replicas}"
                )));
            }
        }
        let resources = resource_requirements(&cloud_props.resources)
            .map_err(|e| Error::wrap("Getting pod resource requirements", e))?;
        let settings = self
            .settings
            .build(agent_id, networks, env)
            .map_err(|e| Error::wrap("Creating instance settings", e))?;

        let client = self
            .provider
            .client(&cloud_props.context)
            .await
            .map_err(|e| Error::wrap("Creating client", e))?;

        ensure_namespace(client.as_ref())
            .await
            .map_err(|e| Error::wrap("Creating namespace", e))?;

        let config_map = ConfigMap {
            metadata: agent_meta(client.as_ref(), &vm_object_name(agent_id), agent_id),
            data: Some(BTreeMap::from([(
                INSTANCE_SETTINGS_KEY.to_string(),
                settings.to_json()?,
            )])),
            ..Default::default()
        };
        client
            .create_config_map(&config_map)
            .await
            .map_err(|e| Error::wrap("Creating config map", e))?;

        create_services(client.as_ref(), agent_id, &cloud_props.services)
            .await
            .map_err(|e| Error::wrap("Creating services", e))?;

        create_secrets(client.as_ref(), agent_id, &cloud_props.secrets)
            .await
            .map_err(|e| Error::wrap("Creating secret", e))?;

        let spec = pod_spec(agent_id, stemcell_cid, resources);
        match cloud_props.replicas {
            None => {
                let mut metadata = agent_meta(client.as_ref(), &vm_object_name(agent_id), agent_id);
                metadata.annotations = ip_annotation(network);
                let pod = Pod {
                    metadata,
                    spec: Some(spec),
                    status: None,
                };
                client
                    .create_pod(&pod)
                    .await
                    .map_err(|e| Error::wrap("Creating pod", e))?;
            }
            Some(replicas) => {
                self.create_deployment(client.as_ref(), agent_id, replicas, spec)
                    .await
                    .map_err(|e| Error::wrap("Creating deployment", e))?;
            }
        }

        info!(agent_id, context = %client.context(), replicas = ?cloud_props.replicas, "created VM");
        Ok(VmCid::new(&client.context(), agent_id))
    }

    async fn create_deployment(
        &self,
        client: &dyn ClusterClient,
        agent_id: &str,
        replicas: i32,
        spec: PodSpec,
    ) -> Result<()> {
        let labels = single_label(AGENT_ID_LABEL, agent_id);
        let deployment = Deployment {
            metadata: agent_meta(client, &vm_object_name(agent_id), agent_id),
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(spec),
                },
                progress_deadline_seconds: Some(PROGRESS_DEADLINE_SECONDS),
                ..Default::default()
            }),
            status: None,
        };

        let created = client.create_deployment(&deployment).await?;
        let resource_version = created.metadata.resource_version.unwrap_or_default();
        wait_for_deployment_available(client, agent_id, &resource_version, self.deployment_ready_timeout)
            .await
            .map_err(|e| Error::wrap("Waiting for deployment", e))?;
        Ok(())
    }

    /// Delete the VM's pod, deployment, services and config map
    ///
    /// Objects that are already gone are not an error.
    pub async fn delete_vm(&self, vm_cid: &VmCid) -> Result<()> {
        let (context, agent_id) = vm_cid.parse()?;
        let client = self
            .provider
            .client(context)
            .await
            .map_err(|e| Error::wrap("Creating client", e))?;
        let name = vm_object_name(agent_id);

        ignore_not_found(client.delete_pod(&name).await)
            .map_err(|e| Error::wrap("Deleting pod", e))?;
        ignore_not_found(client.delete_deployment(&name).await)
            .map_err(|e| Error::wrap("Deleting deployment", e))?;

        let services = client
            .list_services(&label_selector(AGENT_ID_LABEL, agent_id))
            .await
            .map_err(|e| Error::wrap("Listing services", e))?;
        for service in services {
            let Some(service_name) = service.metadata.name else {
                continue;
            };
            ignore_not_found(client.delete_service(&service_name).await)
                .map_err(|e| Error::wrap(format!("Deleting service {service_name}"), e))?;
        }

        ignore_not_found(client.delete_config_map(&name).await)
            .map_err(|e| Error::wrap("Deleting config map", e))?;

        info!(agent_id, context, "deleted VM");
        Ok(())
    }

    /// Whether a pod carries the VM's agent-id label
    pub async fn has_vm(&self, vm_cid: &VmCid) -> Result<bool> {
        let (context, agent_id) = vm_cid.parse()?;
        let client = self
            .provider
            .client(context)
            .await
            .map_err(|e| Error::wrap("Creating client", e))?;

        let pods = client
            .list_pods(&label_selector(AGENT_ID_LABEL, agent_id))
            .await
            .map_err(|e| Error::wrap("Listing pod", e))?;
        Ok(!pods.is_empty())
    }

    /// Label the VM's pod with director metadata
    ///
    /// Keys are lowercased and prefixed with the CPI label domain. Entries
    /// that do not form a valid label are skipped.
    pub async fn set_vm_metadata(
        &self,
        vm_cid: &VmCid,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (context, agent_id) = vm_cid.parse()?;
        let client = self
            .provider
            .client(context)
            .await
            .map_err(|e| Error::wrap("Creating client", e))?;

        let name = vm_object_name(agent_id);
        client
            .get_pod(&name)
            .await
            .map_err(|e| Error::wrap("Getting pod", e))?;

        let labels = vm_metadata_labels(metadata);
        if labels.is_empty() {
            return Ok(());
        }
        client
            .patch_pod_labels(&name, &labels)
            .await
            .map_err(|e| Error::wrap("Patching pod", e))
    }
}

/// Metadata for an object named `name` carrying the agent-id label
fn agent_meta(client: &dyn ClusterClient, name: &str, agent_id: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(client.namespace()),
        labels: Some(single_label(AGENT_ID_LABEL, agent_id)),
        ..Default::default()
    }
}

fn vm_metadata_labels(metadata: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for (key, value) in metadata {
        let key = format!("{LABEL_PREFIX}{}", key.to_lowercase());
        match validate_qualified_name(&key).and_then(|_| validate_label_value(value)) {
            Ok(()) => {
                labels.insert(key, value.clone());
            }
            Err(reason) => warn!(key = %key, value = %value, %reason, "skipping VM metadata"),
        }
    }
    labels
}

fn single_network(networks: &Networks) -> Result<&Network> {
    let mut iter = networks.values();
    match (iter.next(), iter.next()) {
        (None, _) => Err(Error::validation("a network is required")),
        (Some(network), None) => Ok(network),
        (Some(_), Some(_)) => Err(Error::validation("multiple networks not supported")),
    }
}

fn ip_annotation(network: &Network) -> Option<BTreeMap<String, String>> {
    if network.ip.is_empty() {
        return None;
    }
    Some(single_label(IP_ADDRESS_ANNOTATION, &network.ip))
}

fn resource_requirements(props: &ResourceProperties) -> Result<Option<ResourceRequirements>> {
    let limits = resource_list(props.limits.as_ref())?;
    let requests = resource_list(props.requests.as_ref())?;
    if limits.is_none() && requests.is_none() {
        return Ok(None);
    }
    Ok(Some(ResourceRequirements {
        limits,
        requests,
        ..Default::default()
    }))
}

fn resource_list(
    list: Option<&BTreeMap<String, String>>,
) -> Result<Option<BTreeMap<String, Quantity>>> {
    let Some(list) = list else {
        return Ok(None);
    };

    let mut out = BTreeMap::new();
    for (name, value) in list {
        if name != "cpu" && name != "memory" {
            return Err(Error::validation(format!(
                "{name} is not a supported resource type"
            )));
        }
        validate_quantity(value).map_err(Error::validation)?;
        out.insert(name.clone(), Quantity(value.clone()));
    }
    Ok(Some(out))
}

/// Pod spec shared by bare pods and deployment templates
fn pod_spec(agent_id: &str, image: &str, resources: Option<ResourceRequirements>) -> PodSpec {
    PodSpec {
        hostname: Some(agent_id.to_string()),
        containers: vec![Container {
            name: BOSH_JOB_CONTAINER.to_string(),
            image: Some(image.to_string()),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec![AGENT_COMMAND.to_string()]),
            args: Some(vec![]),
            resources,
            security_context: Some(SecurityContext {
                privileged: Some(true),
                run_as_user: Some(0),
                ..Default::default()
            }),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: CONFIG_VOLUME.to_string(),
                    mount_path: SETTINGS_MOUNT_PATH.to_string(),
                    sub_path: Some(INSTANCE_SETTINGS_FILE.to_string()),
                    ..Default::default()
                },
                VolumeMount {
                    name: EPHEMERAL_VOLUME.to_string(),
                    mount_path: EPHEMERAL_MOUNT_PATH.to_string(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }],
        volumes: Some(vec![
            Volume {
                name: CONFIG_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: vm_object_name(agent_id),
                    items: Some(vec![KeyToPath {
                        key: INSTANCE_SETTINGS_KEY.to_string(),
                        path: INSTANCE_SETTINGS_FILE.to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: EPHEMERAL_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

async fn create_services(
    client: &dyn ClusterClient,
    agent_id: &str,
    services: &[ServiceProperties],
) -> Result<()> {
    for svc in services {
        let metadata = agent_meta(client, &svc.name, agent_id);

        if svc.type_ == "Ingress" {
            let ingress = Ingress {
                metadata,
                spec: Some(IngressSpec {
                    default_backend: svc.backend.clone(),
                    tls: non_empty(svc.tls.clone()),
                    rules: non_empty(svc.rules.clone()),
                    ..Default::default()
                }),
                status: None,
            };
            client.create_ingress(&ingress).await?;
            continue;
        }

        if client.service_exists(&svc.name).await? {
            debug!(service = %svc.name, "service already exists");
            continue;
        }
        client
            .create_service(&Service {
                metadata,
                spec: Some(service_spec(svc, agent_id)),
                status: None,
            })
            .await
            .map_err(|e| Error::wrap("Creating service", e))?;
    }
    Ok(())
}

fn service_spec(svc: &ServiceProperties, agent_id: &str) -> ServiceSpec {
    let service_type = match svc.type_.as_str() {
        "NodePort" => "NodePort",
        "LoadBalancer" => "LoadBalancer",
        _ => "ClusterIP",
    };

    let ports = svc
        .ports
        .iter()
        .map(|p| ServicePort {
            name: non_empty_str(&p.name),
            protocol: non_empty_str(&p.protocol),
            port: p.port,
            node_port: (p.node_port != 0).then_some(p.node_port),
            target_port: Some(IntOrString::Int(p.target_port)),
            ..Default::default()
        })
        .collect();

    let selector = if svc.selector.is_empty() {
        single_label(AGENT_ID_LABEL, agent_id)
    } else {
        svc.selector.clone()
    };

    ServiceSpec {
        type_: Some(service_type.to_string()),
        cluster_ip: non_empty_str(&svc.cluster_ip),
        ports: Some(ports),
        external_ips: non_empty(svc.external_ips.clone()),
        load_balancer_ip: if service_type == "LoadBalancer" {
            non_empty_str(&svc.load_balancer_ip)
        } else {
            None
        },
        selector: Some(selector),
        ..Default::default()
    }
}

async fn create_secrets(
    client: &dyn ClusterClient,
    agent_id: &str,
    secrets: &[SecretProperties],
) -> Result<()> {
    for srt in secrets {
        if client.secret_exists(&srt.name).await? {
            return Err(Error::validation(format!(
                "Secret name {} already exists.",
                srt.name
            )));
        }

        let secret_type = match srt.type_.as_str() {
            "DockerCfg" => "kubernetes.io/dockercfg",
            "ServiceAccountToken" => "kubernetes.io/service-account-token",
            "TLS" => "kubernetes.io/tls",
            _ => "Opaque",
        };

        let mut data = BTreeMap::new();
        for (key, value) in &srt.data {
            let bytes = if key == ".dockercfg" {
                tokio::fs::read(value).await.map_err(|e| {
                    Error::validation(format!("Reading dockercfg {value}: {e}"))
                })?
            } else {
                value.clone().into_bytes()
            };
            data.insert(key.clone(), ByteString(bytes));
        }

        let secret = Secret {
            metadata: ObjectMeta {
                annotations: non_empty_map(srt.annotations.clone()),
                ..agent_meta(client, &srt.name, agent_id)
            },
            data: non_empty_map(data),
            string_data: non_empty_map(srt.string_data.clone()),
            type_: Some(secret_type.to_string()),
            ..Default::default()
        };
        client
            .create_secret(&secret)
            .await
            .map_err(|e| Error::wrap("Creating secret by client", e))?;
    }
    Ok(())
}

fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    (!v.is_empty()).then_some(v)
}

fn non_empty_map<V>(m: BTreeMap<String, V>) -> Option<BTreeMap<String, V>> {
    (!m.is_empty()).then_some(m)
}

fn non_empty_str(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
