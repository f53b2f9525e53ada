//! Infra engine: the per-cluster agent.
//!
//! Two halves share one process: the reconciler registers the cluster with
//! the registry and projects its grants into RoleBindings on a fixed-rate
//! loop, and the proxy fronts the cluster API server, validating end-user
//! JWTs and impersonating the verified user.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{any, get};
use axum::Router;
use tracing::info;

pub mod client;
pub mod error;
pub mod jwks;
pub mod kubernetes;
pub mod proxy;
pub mod reconciler;

pub use error::{Error, Result};

use client::RegistryClient;
use jwks::JwkCache;
use kubernetes::{ClusterInfo, InClusterInfo};
use proxy::{proxy_handler, ProxyState};
use reconciler::Reconciler;

/// Engine options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Registry host or URL.
    pub registry: String,
    /// Connector access key issued by the registry.
    pub access_key: String,
    /// Destination name; defaults to the engine's namespace.
    pub name: Option<String>,
    /// API endpoint reported to the registry; introspected when unset.
    pub endpoint: Option<String>,
    /// Verify the registry's TLS certificate. Off by default to support
    /// self-signed development registries.
    pub force_tls_verify: bool,
    /// Proxy listen address.
    pub listen_addr: SocketAddr,
}

/// Run the engine until the process exits.
pub async fn run(options: Options) -> Result<()> {
    let registry = Arc::new(RegistryClient::new(
        &options.registry,
        &options.access_key,
        !options.force_tls_verify,
    )?);
    let kube = kube::Client::try_default()
        .await
        .map_err(|e| Error::config(format!("failed to load cluster config: {e}")))?;
    let info: Arc<dyn ClusterInfo> = Arc::new(InClusterInfo);

    // Upstream transport pinned to the cluster CA. Only the connect phase is
    // bounded: watches and exec sessions stream for arbitrarily long.
    let ca = info.ca().await?;
    let sa_token = info.sa_token().await?;
    let endpoint = match &options.endpoint {
        Some(endpoint) => endpoint.clone(),
        None => info.endpoint().await?,
    };
    let certificate = reqwest::Certificate::from_pem(ca.as_bytes())
        .map_err(|e| Error::config(format!("invalid cluster CA bundle: {e}")))?;
    let upstream = reqwest::Client::builder()
        .add_root_certificate(certificate)
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::config(format!("failed to build upstream client: {e}")))?;

    let reconciler = Reconciler::new(
        registry.clone(),
        kube,
        info,
        options.name.clone(),
        options.endpoint.clone(),
    );
    tokio::spawn(reconciler.run());

    let state = Arc::new(ProxyState {
        jwks: Arc::new(JwkCache::new(registry)),
        client: upstream,
        base_url: format!("https://{endpoint}"),
        sa_token,
    });
    let router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/proxy", any(proxy_handler))
        .route("/proxy/{*path}", any(proxy_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(options.listen_addr)
        .await
        .map_err(|e| Error::internal(format!("failed to bind {}: {e}", options.listen_addr)))?;
    info!(addr = %options.listen_addr, "engine proxy listening");
    axum::serve(listener, router)
        .await
        .map_err(|e| Error::internal(format!("server error: {e}")))
}
