//! Login, logout, and JWT issuance handlers.
//!
//! Login failures are deliberately indistinguishable: unknown user, wrong
//! password, and failed OIDC exchange all produce the same 401. Password
//! hashing runs on the blocking pool.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{Duration, Utc};
use tracing::info;

use infra_common::api::{
    LoginRequest, LoginResponse, OidcCredentials, PasswordCredentials, TokenResponse,
};
use infra_common::Id;

use crate::error::{Error, Result};
use crate::providers::local;
use crate::server::auth::Access;
use crate::server::validate::Rules;
use crate::server::AppState;
use crate::store::models::{Identity, ProviderKind};
use crate::store::{access_keys, groups, identities, providers};

/// Sliding window applied to session keys: each use pushes the deadline
/// forward by this much, bounded by the key's hard expiry.
const SESSION_EXTENSION: Duration = Duration::hours(3);

/// Best-effort client address for rate limiting: first hop of
/// X-Forwarded-For when present.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let ip = client_ip(&headers);
    match (request.password_credentials, request.oidc) {
        (Some(creds), None) => password_login(&state, &ip, creds).await.map(Json),
        (None, Some(creds)) => oidc_login(&state, &ip, creds).await.map(Json),
        _ => Err(Error::field(
            "passwordCredentials",
            "exactly one login method is required",
        )),
    }
}

async fn password_login(
    state: &AppState,
    ip: &str,
    creds: PasswordCredentials,
) -> Result<LoginResponse> {
    let mut rules = Rules::new();
    rules
        .required("passwordCredentials.name", &creds.name)
        .required("passwordCredentials.password", &creds.password);
    rules.finish()?;

    if !state.limiter.allow(ip, &creds.name) {
        return Err(Error::RateLimited);
    }

    let mut tx = state.db.read(state.organization_id).await?;
    let identity = match identities::get_identity(
        &mut tx,
        identities::GetIdentity::ByName(creds.name.clone()),
    )
    .await
    {
        Ok(identity) => identity,
        Err(Error::NotFound { .. }) => return Err(Error::Unauthorized),
        Err(err) => return Err(err),
    };
    let provider = providers::infra_provider(&mut tx).await?;

    let hash = identity.password_hash.clone().ok_or(Error::Unauthorized)?;
    let password = creds.password.clone();
    tokio::task::spawn_blocking(move || local::verify_password(&hash, &password))
        .await
        .map_err(|e| Error::internal(format!("verify task failed: {e}")))??;

    issue_session(state, identity, provider.id).await
}

async fn oidc_login(state: &AppState, ip: &str, creds: OidcCredentials) -> Result<LoginResponse> {
    let mut rules = Rules::new();
    rules
        .required("oidc.code", &creds.code)
        .required("oidc.redirectURL", &creds.redirect_url);
    rules.finish()?;

    let provider = {
        let mut tx = state.db.read(state.organization_id).await?;
        providers::get_provider(&mut tx, providers::GetProvider::ById(creds.provider_id)).await?
    };
    if provider.kind == ProviderKind::Infra {
        return Err(Error::field("providerID", "is not an OIDC provider"));
    }

    let asserted = state
        .oidc
        .login(&provider, &creds.code, &creds.redirect_url)
        .await?;
    if !state.limiter.allow(ip, &asserted.email) {
        return Err(Error::RateLimited);
    }

    let mut tx = state.db.write(state.organization_id).await?;
    let identity = match identities::get_identity(
        &mut tx,
        identities::GetIdentity::ByName(asserted.email.clone()),
    )
    .await
    {
        Ok(identity) => identity,
        Err(Error::NotFound { .. }) => {
            // First login through this provider creates the identity.
            let mut identity = Identity {
                id: Id::zero(),
                organization_id: state.organization_id,
                name: asserted.email.clone(),
                last_seen_at: None,
                created_by: Id::zero(),
                verified: true,
                verification_token: None,
                ssh_login_name: None,
                password_hash: None,
                one_time_password: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            identities::create_identity(&mut tx, &mut identity).await?;
            info!(user = %identity.name, provider = %provider.name, "created identity on first login");
            identity
        }
        Err(err) => return Err(err),
    };

    identities::add_identity_provider(&mut tx, identity.id, provider.id).await?;
    groups::sync_provider_groups(&mut tx, identity.id, provider.id, &asserted.groups).await?;

    let mut key = access_keys::new_access_key(identity.id, provider.id);
    key.extension = Some(SESSION_EXTENSION);
    key.extension_deadline = Some(Utc::now() + SESSION_EXTENSION);
    let token = access_keys::create_access_key(&mut tx, &mut key).await?;
    tx.commit().await?;

    info!(user = %identity.name, provider = %provider.name, "login");
    Ok(LoginResponse {
        user_id: identity.id,
        name: identity.name,
        access_key: token,
        expires: key.expires_at,
        password_update_required: false,
    })
}

async fn issue_session(
    state: &AppState,
    identity: Identity,
    provider_id: Id,
) -> Result<LoginResponse> {
    let mut tx = state.db.write(state.organization_id).await?;
    let mut key = access_keys::new_access_key(identity.id, provider_id);
    key.extension = Some(SESSION_EXTENSION);
    key.extension_deadline = Some(Utc::now() + SESSION_EXTENSION);
    let token = access_keys::create_access_key(&mut tx, &mut key).await?;
    tx.commit().await?;

    info!(user = %identity.name, "login");
    Ok(LoginResponse {
        user_id: identity.id,
        name: identity.name,
        access_key: token,
        expires: key.expires_at,
        password_update_required: identity.one_time_password,
    })
}

/// Revoke the presented access key.
pub async fn logout(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
) -> Result<StatusCode> {
    let mut tx = state.db.write(access.organization_id()).await?;
    access_keys::delete_access_keys(
        &mut tx,
        access_keys::DeleteAccessKeysOptions {
            by_id: Some(access.key.id),
            ..Default::default()
        },
    )
    .await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Exchange the presented access key for a short-lived JWT accepted by
/// engine proxies.
pub async fn create_token(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
) -> Result<Json<TokenResponse>> {
    let (token, expires) = state
        .issuer
        .issue(access.user_id(), &access.identity.name)?;
    Ok(Json(TokenResponse { token, expires }))
}
