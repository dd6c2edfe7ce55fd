//! kube-rs backed [`ClusterClient`]

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchParams};
use kube::core::WatchEvent;
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ClusterClient, EventStream, ObjectEvent};
use crate::{Error, Result};

/// Namespaced client for one resolved kubeconfig context
pub struct KubeClusterClient {
    client: Client,
    context: String,
    namespace: String,
}

impl KubeClusterClient {
    /// Wrap a kube client already configured for `context`
    pub fn new(client: Client, context: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            context: context.into(),
            namespace: namespace.into(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn zero_grace() -> DeleteParams {
    DeleteParams::default().grace_period(0)
}

async fn create<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    Ok(api.create(&PostParams::default(), obj).await?)
}

async fn replace<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::validation("object to update has no name"))?;
    Ok(api.replace(&name, &PostParams::default(), obj).await?)
}

async fn list<K>(api: &Api<K>, selector: &str) -> Result<Vec<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    Ok(api.list(&ListParams::default().labels(selector)).await?.items)
}

/// Label-scoped watch without bookmarks
fn watch_params(selector: &str) -> WatchParams {
    WatchParams::default().labels(selector).disable_bookmarks()
}

async fn watch<K>(api: &Api<K>, selector: &str, resource_version: &str) -> Result<EventStream<K>>
where
    K: Clone + DeserializeOwned + Debug + Send + 'static,
{
    let events = api.watch(&watch_params(selector), resource_version).await?;
    Ok(translate(events))
}

/// Map kube's watch events onto [`ObjectEvent`]
fn translate<K, S>(events: S) -> EventStream<K>
where
    K: Send + 'static,
    S: Stream<Item = kube::Result<WatchEvent<K>>> + Send + 'static,
{
    events
        .map(|event| match event {
            Ok(WatchEvent::Added(obj)) => Ok(ObjectEvent::Added(obj)),
            Ok(WatchEvent::Modified(obj)) => Ok(ObjectEvent::Modified(obj)),
            Ok(WatchEvent::Deleted(obj)) => Ok(ObjectEvent::Deleted(obj)),
            Ok(WatchEvent::Bookmark(_)) => Ok(ObjectEvent::Bookmark),
            Ok(WatchEvent::Error(status)) => Ok(ObjectEvent::Error(status.message)),
            Err(e) => Err(Error::from(e)),
        })
        .boxed()
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    fn context(&self) -> String {
        self.context.clone()
    }

    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    async fn namespace_exists(&self) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(&self.namespace).await?.is_some())
    }

    async fn create_namespace(&self) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &ns).await?;
        Ok(())
    }

    async fn get_config_map(&self, name: &str) -> Result<ConfigMap> {
        Ok(self.api::<ConfigMap>().get(name).await?)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        create(&self.api(), config_map).await
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        replace(&self.api(), config_map).await
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        self.api::<ConfigMap>().delete(name, &zero_grace()).await?;
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> Result<Pod> {
        Ok(self.api::<Pod>().get(name).await?)
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        list(&self.api(), selector).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        create(&self.api(), pod).await
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.api::<Pod>().delete(name, &zero_grace()).await?;
        Ok(())
    }

    async fn patch_pod_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        self.api::<Pod>()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn watch_pods(&self, selector: &str, resource_version: &str) -> Result<EventStream<Pod>> {
        watch(&self.api(), selector, resource_version).await
    }

    async fn get_claim(&self, name: &str) -> Result<PersistentVolumeClaim> {
        Ok(self.api::<PersistentVolumeClaim>().get(name).await?)
    }

    async fn list_claims(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        list(&self.api(), selector).await
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        create(&self.api(), claim).await
    }

    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        replace(&self.api(), claim).await
    }

    async fn delete_claim(&self, name: &str) -> Result<()> {
        self.api::<PersistentVolumeClaim>()
            .delete(name, &zero_grace())
            .await?;
        Ok(())
    }

    async fn watch_claims(
        &self,
        selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<PersistentVolumeClaim>> {
        watch(&self.api(), selector, resource_version).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        create(&self.api(), deployment).await
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        self.api::<Deployment>().delete(name, &zero_grace()).await?;
        Ok(())
    }

    async fn watch_deployments(
        &self,
        selector: &str,
        resource_version: &str,
    ) -> Result<EventStream<Deployment>> {
        watch(&self.api(), selector, resource_version).await
    }

    async fn service_exists(&self, name: &str) -> Result<bool> {
        Ok(self.api::<Service>().get_opt(name).await?.is_some())
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        create(&self.api(), service).await
    }

    async fn list_services(&self, selector: &str) -> Result<Vec<Service>> {
        list(&self.api(), selector).await
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        self.api::<Service>().delete(name, &zero_grace()).await?;
        Ok(())
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress> {
        create(&self.api(), ingress).await
    }

    async fn secret_exists(&self, name: &str) -> Result<bool> {
        Ok(self.api::<Secret>().get_opt(name).await?.is_some())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        create(&self.api(), secret).await
    }
}
