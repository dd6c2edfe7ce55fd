//! Cluster credentials in the CPI's own JSON shape
//!
//! The director renders credentials as snake_case maps keyed by name. They
//! are converted into a standard kubeconfig so kube-rs can resolve contexts,
//! TLS material and default namespaces the usual way.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::config::Kubeconfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{Error, Result};

/// API server endpoint
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// API server URL
    pub server: String,
    /// Skip TLS verification of the API server
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_tls_verify: bool,
    /// PEM encoded CA bundle
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificate_authority_data: String,
}

/// User credentials
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthInfo {
    /// PEM encoded client certificate
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_certificate_data: String,
    /// PEM encoded client key
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_key_data: String,
    /// Bearer token (also the OIDC id token)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    /// Basic auth user
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Basic auth password
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Auth provider name ("oidc" gets its config populated)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub auth_provider: String,
    /// OIDC issuer
    #[serde(skip_serializing_if = "String::is_empty")]
    pub idp_issuer_url: String,
    /// OIDC client secret
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
    /// OIDC client id
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    /// OIDC refresh token
    #[serde(skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
}

/// Named pairing of cluster, user and namespace
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Cluster name
    pub cluster: String,
    /// User name
    #[serde(rename = "user")]
    pub auth_info: String,
    /// Namespace objects are created in
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// All clusters, users and contexts the CPI may target
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KubeConfig {
    /// Clusters by name
    #[serde(default)]
    pub clusters: BTreeMap<String, Cluster>,
    /// Users by name
    #[serde(default, rename = "users")]
    pub auth_infos: BTreeMap<String, AuthInfo>,
    /// Contexts by name
    #[serde(default)]
    pub contexts: BTreeMap<String, Context>,
    /// Context used when a request names none
    #[serde(default)]
    pub current_context: String,
}

impl KubeConfig {
    /// Convert into a standard kubeconfig document
    pub fn to_kubeconfig(&self) -> Result<Kubeconfig> {
        let clusters: Vec<Value> = self
            .clusters
            .iter()
            .map(|(name, c)| json!({ "name": name, "cluster": c.to_kubeconfig() }))
            .collect();
        let users: Vec<Value> = self
            .auth_infos
            .iter()
            .map(|(name, a)| json!({ "name": name, "user": a.to_kubeconfig() }))
            .collect();
        let contexts: Vec<Value> = self
            .contexts
            .iter()
            .map(|(name, c)| json!({ "name": name, "context": c.to_kubeconfig() }))
            .collect();

        let doc = json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": clusters,
            "users": users,
            "contexts": contexts,
            "current-context": self.current_context,
        });

        serde_json::from_value(doc)
            .map_err(|e| Error::config(format!("building kubeconfig: {}", e)))
    }
}

impl Cluster {
    fn to_kubeconfig(&self) -> Value {
        let mut out = Map::new();
        out.insert("server".into(), json!(self.server));
        if self.insecure_skip_tls_verify {
            out.insert("insecure-skip-tls-verify".into(), json!(true));
        }
        if !self.certificate_authority_data.is_empty() {
            out.insert(
                "certificate-authority-data".into(),
                json!(STANDARD.encode(&self.certificate_authority_data)),
            );
        }
        Value::Object(out)
    }
}

impl AuthInfo {
    fn to_kubeconfig(&self) -> Value {
        let mut out = Map::new();
        let mut put = |key: &str, value: &str| {
            if !value.is_empty() {
                out.insert(key.into(), json!(value));
            }
        };
        put("token", &self.token);
        put("username", &self.username);
        put("password", &self.password);
        if !self.client_certificate_data.is_empty() {
            put(
                "client-certificate-data",
                &STANDARD.encode(&self.client_certificate_data),
            );
        }
        if !self.client_key_data.is_empty() {
            put("client-key-data", &STANDARD.encode(&self.client_key_data));
        }

        if !self.auth_provider.is_empty() {
            let mut config = Map::new();
            if self.auth_provider == "oidc" {
                config.insert("idp-issuer-url".into(), json!(self.idp_issuer_url));
                config.insert("client-secret".into(), json!(self.client_secret));
                config.insert("client-id".into(), json!(self.client_id));
                config.insert("id-token".into(), json!(self.token));
                config.insert("refresh-token".into(), json!(self.refresh_token));
            }
            out.insert(
                "auth-provider".into(),
                json!({ "name": self.auth_provider, "config": config }),
            );
        }
        Value::Object(out)
    }
}

impl Context {
    fn to_kubeconfig(&self) -> Value {
        let mut out = Map::new();
        out.insert("cluster".into(), json!(self.cluster));
        out.insert("user".into(), json!(self.auth_info));
        if !self.namespace.is_empty() {
            out.insert("namespace".into(), json!(self.namespace));
        }
        Value::Object(out)
    }
}
