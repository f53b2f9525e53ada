//! Registry HTTP server: router, shared state, and process wiring.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use tracing::{info, warn};

use infra_common::api::JsonWebKeySet;
use infra_common::{Id, CONNECTOR_IDENTITY_NAME};

use crate::config;
use crate::error::{Error, Result};
use crate::providers::OidcClient;
use crate::server::ratelimit::LoginRateLimiter;
use crate::store::{access_keys, identities, providers, organizations, Db};
use crate::tokens::JwtIssuer;

pub mod auth;
pub mod destinations;
pub mod grants_api;
pub mod groups_api;
pub mod login;
pub mod ratelimit;
pub mod users;
pub mod validate;

/// How often a fresh signing key is added to the JWKS.
const KEY_ROTATION_PERIOD: Duration = Duration::from_secs(6 * 60 * 60);

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    /// The deployment's organization. Every login and file-managed entity
    /// lands here; access keys carry their own organization for requests.
    pub organization_id: Id,
    pub issuer: Arc<JwtIssuer>,
    pub oidc: Arc<OidcClient>,
    pub limiter: Arc<LoginRateLimiter>,
}

/// Registry server options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub addr: SocketAddr,
    pub database_url: String,
    /// PEM certificate and key; plain HTTP when unset (e.g. behind a
    /// terminating load balancer).
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub organization: String,
}

async fn jwks(State(state): State<AppState>) -> Json<JsonWebKeySet> {
    Json(state.issuer.jwks())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Build the full registry router.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/logout", post(login::logout))
        .route("/tokens", post(login::create_token))
        .route("/users", get(users::list_users).post(users::create_user))
        .route(
            "/users/{id}",
            get(users::get_user)
                .put(users::update_user)
                .delete(users::delete_user),
        )
        .route("/users/{id}/grants", get(grants_api::list_user_grants))
        .route(
            "/users/{id}/public-keys",
            get(users::list_public_keys).post(users::add_public_key),
        )
        .route(
            "/users/{id}/public-keys/{key_id}",
            delete(users::delete_public_key),
        )
        .route(
            "/groups",
            get(groups_api::list_groups).post(groups_api::create_group),
        )
        .route("/groups/{id}", delete(groups_api::delete_group))
        .route("/groups/{id}/members", patch(groups_api::update_group_members))
        .route(
            "/grants",
            get(grants_api::list_grants).post(grants_api::create_grant),
        )
        .route("/grants/{id}", delete(grants_api::delete_grant))
        .route(
            "/destinations",
            get(destinations::list_destinations).post(destinations::create_destination),
        )
        .route("/destinations/{id}/roles", get(destinations::list_roles))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_access_key,
        ));

    Router::new()
        .route("/login", post(login::login))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/healthz", get(healthz))
        .merge(protected)
        .with_state(state)
}

/// Build state: connect the database, ensure the organization and its
/// seeded rows exist, apply the startup config file.
pub async fn build_state(options: &ServerOptions) -> Result<AppState> {
    let db = Db::connect(&options.database_url).await?;
    let org = organizations::get_or_create_organization(&db, &options.organization).await?;

    if let Some(path) = &options.config_file {
        let file = config::load(path)?;
        config::apply(&db, org.id, &file).await?;
    }

    ensure_connector_key(&db, org.id).await?;

    Ok(AppState {
        db,
        organization_id: org.id,
        issuer: Arc::new(JwtIssuer::new()?),
        oidc: Arc::new(OidcClient::new()),
        limiter: Arc::new(LoginRateLimiter::new()),
    })
}

/// Make sure the engine identity has a live access key, minting and logging
/// one on first start. Engines are configured with this credential.
async fn ensure_connector_key(db: &Db, organization_id: Id) -> Result<()> {
    let mut tx = db.write(organization_id).await?;
    let connector = identities::get_identity(
        &mut tx,
        identities::GetIdentity::ByName(CONNECTOR_IDENTITY_NAME.to_string()),
    )
    .await?;
    let live = access_keys::list_access_keys(
        &mut tx,
        access_keys::ListAccessKeysOptions {
            by_issued_for: Some(connector.id),
            not_expired: true,
        },
    )
    .await?;
    if !live.is_empty() {
        return tx.rollback().await;
    }

    let infra = providers::infra_provider(&mut tx).await?;
    let mut key = access_keys::new_access_key(connector.id, infra.id);
    key.name = "engine".to_string();
    key.expires_at = chrono::Utc::now() + chrono::Duration::days(365);
    let token = access_keys::create_access_key(&mut tx, &mut key).await?;
    tx.commit().await?;
    // Logged once so the operator can configure engines; never shown again.
    info!(engine_access_key = %token, "minted engine access key");
    Ok(())
}

/// Run the registry until the process exits.
pub async fn serve(options: ServerOptions) -> Result<()> {
    let state = build_state(&options).await?;

    let issuer = state.issuer.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEY_ROTATION_PERIOD);
        ticker.tick().await; // immediate first tick is a no-op
        loop {
            ticker.tick().await;
            if let Err(err) = issuer.rotate() {
                warn!(error = %err, "signing key rotation failed");
            }
        }
    });

    let router = create_router(state);
    match (&options.tls_cert, &options.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| Error::internal(format!("TLS config error: {e}")))?;
            info!(addr = %options.addr, "registry listening (https)");
            axum_server::bind_rustls(options.addr, tls)
                .serve(router.into_make_service())
                .await
                .map_err(|e| Error::internal(format!("server error: {e}")))
        }
        (None, None) => {
            info!(addr = %options.addr, "registry listening (http)");
            axum_server::bind(options.addr)
                .serve(router.into_make_service())
                .await
                .map_err(|e| Error::internal(format!("server error: {e}")))
        }
        _ => Err(Error::internal(
            "tls requires both a certificate and a key".to_string(),
        )),
    }
}
