//! kubernetes-cpi - BOSH cloud provider interface backed by Kubernetes
//!
//! Reads one JSON request from stdin and writes one JSON response to stdout.
//! Logs go to stderr.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubernetes_cpi::config::{CpiConfig, Timeouts};
use kubernetes_cpi::cpi::{Cpi, Request, Response};
use kubernetes_cpi::kubecluster::KubeConfigProvider;

/// BOSH CPI for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "kubernetes-cpi", version, about, long_about = None)]
struct Cli {
    /// Path to the guest agent configuration (JSON)
    #[arg(long, env = "CPI_AGENT_CONFIG")]
    agent_config: PathBuf,

    /// Path to the cluster credentials (JSON)
    #[arg(long, env = "CPI_KUBE_CONFIG")]
    kube_config: PathBuf,

    /// Seconds to wait for a new disk's claim to be bound
    #[arg(long, env = "CPI_DISK_READY_TIMEOUT", default_value = "600")]
    disk_ready_timeout_secs: u64,

    /// Seconds to wait for a recreated pod to become ready
    #[arg(long, env = "CPI_POD_READY_TIMEOUT", default_value = "300")]
    pod_ready_timeout_secs: u64,

    /// Seconds to wait for a deployment to become available
    #[arg(long, env = "CPI_DEPLOYMENT_READY_TIMEOUT", default_value = "300")]
    deployment_ready_timeout_secs: u64,

    /// Seconds to wait after a pod recreate for the agent to start
    #[arg(long, env = "CPI_POST_RECREATE_DELAY", default_value = "15")]
    post_recreate_delay_secs: u64,
}

impl Cli {
    fn timeouts(&self) -> Timeouts {
        Timeouts {
            disk_ready: Duration::from_secs(self.disk_ready_timeout_secs),
            pod_ready: Duration::from_secs(self.pod_ready_timeout_secs),
            deployment_ready: Duration::from_secs(self.deployment_ready_timeout_secs),
            post_recreate_delay: Duration::from_secs(self.post_recreate_delay_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    // stdout carries the response, so logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut payload = String::new();
    std::io::stdin()
        .read_to_string(&mut payload)
        .context("Failed to read request from stdin")?;
    debug!(request = %payload, "received request");

    let response = respond(&cli, &payload).await;

    let encoded = serde_json::to_string(&response).context("Failed to encode response")?;
    debug!(response = %encoded, "sending response");

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{encoded}").context("Failed to write response")?;
    stdout.flush().context("Failed to write response")?;
    Ok(())
}

/// Run one request; every failure becomes an error response
async fn respond(cli: &Cli, payload: &str) -> Response {
    let config = match CpiConfig::load(&cli.agent_config, &cli.kube_config, cli.timeouts()) {
        Ok(config) => config,
        Err(e) => return Response::err(&e),
    };
    let provider = match KubeConfigProvider::new(&config.kubernetes) {
        Ok(provider) => provider,
        Err(e) => return Response::err(&e),
    };
    let cpi = Cpi::new(&config, Arc::new(provider));

    match Request::from_json(payload) {
        Ok(request) => cpi.handle(&request).await,
        Err(e) => Response::err(&e),
    }
}
