//! Kubeconfig backed [`ClientProvider`]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::debug;

use super::{ClientProvider, ClusterClient, KubeClusterClient};
use crate::config::KubeConfig;
use crate::{Error, Result};

/// Connect timeout for API server connections
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout; longer than the server-side watch timeout
const READ_TIMEOUT: Duration = Duration::from_secs(900);

/// Builds clients from the CPI's cluster credentials
pub struct KubeConfigProvider {
    kubeconfig: Kubeconfig,
    current_context: String,
}

impl KubeConfigProvider {
    /// Create a provider over every context in `config`
    pub fn new(config: &KubeConfig) -> Result<Self> {
        Ok(Self {
            kubeconfig: config.to_kubeconfig()?,
            current_context: config.current_context.clone(),
        })
    }

    fn resolve<'a>(&'a self, context: &'a str) -> &'a str {
        if context.is_empty() {
            &self.current_context
        } else {
            context
        }
    }
}

#[async_trait]
impl ClientProvider for KubeConfigProvider {
    async fn client(&self, context: &str) -> Result<Arc<dyn ClusterClient>> {
        let context = self.resolve(context).to_string();
        if context.is_empty() {
            return Err(Error::client(context, "no context requested and no current context"));
        }

        let options = KubeConfigOptions {
            context: Some(context.clone()),
            ..Default::default()
        };
        let mut config = kube::Config::from_custom_kubeconfig(self.kubeconfig.clone(), &options)
            .await
            .map_err(|e| Error::client(&context, e.to_string()))?;
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);

        let namespace = config.default_namespace.clone();
        let client =
            kube::Client::try_from(config).map_err(|e| Error::client(&context, e.to_string()))?;

        debug!(context = %context, namespace = %namespace, "built cluster client");
        Ok(Arc::new(KubeClusterClient::new(client, context, namespace)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KubeConfig {
        serde_json::from_value(serde_json::json!({
            "clusters": { "bosh": { "server": "https://127.0.0.1:8443", "insecure_skip_tls_verify": true } },
            "users": { "bosh": { "token": "t" } },
            "contexts": { "bosh": { "cluster": "bosh", "user": "bosh", "namespace": "bosh-ns" } },
            "current_context": "bosh"
        }))
        .unwrap()
    }

    #[test]
    fn test_empty_context_resolves_to_current() {
        let provider = KubeConfigProvider::new(&config()).unwrap();
        assert_eq!(provider.resolve(""), "bosh");
        assert_eq!(provider.resolve("other"), "other");
    }

    #[tokio::test]
    async fn test_unknown_context_is_a_client_error() {
        let provider = KubeConfigProvider::new(&config()).unwrap();
        let err = provider.client("missing").await.err().unwrap();
        assert!(matches!(err, Error::Client { ref context, .. } if context == "missing"));
    }

    #[tokio::test]
    async fn test_client_carries_context_namespace() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let provider = KubeConfigProvider::new(&config()).unwrap();
        let client = provider.client("").await.unwrap();
        assert_eq!(client.context(), "bosh");
        assert_eq!(client.namespace(), "bosh-ns");
    }
}
