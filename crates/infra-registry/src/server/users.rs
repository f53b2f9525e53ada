//! User CRUD, password changes, and SSH public keys.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;

use infra_common::api::{
    AddUserPublicKeyRequest, CreateUserRequest, CreateUserResponse, ListResponse, ListUsersQuery,
    UpdateUserRequest, User, UserPublicKey,
};
use infra_common::Id;

use crate::error::{Error, Result};
use crate::providers::local;
use crate::server::auth::{require_admin, require_self_or_admin, Access};
use crate::server::validate::Rules;
use crate::server::AppState;
use crate::store::models::{self, Identity};
use crate::store::{identities, public_keys, ReadTxn};

async fn render_user(tx: &mut impl ReadTxn, identity: &Identity) -> Result<User> {
    let provider_names = identities::provider_names_for_identity(&mut *tx, identity.id).await?;
    let keys = public_keys::list_user_public_keys(&mut *tx, identity.id).await?;
    Ok(identity.to_api(provider_names, keys))
}

pub async fn list_users(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<ListResponse<User>>> {
    let mut tx = state.db.read(access.organization_id()).await?;
    let users = identities::list_identities(
        &mut tx,
        identities::ListIdentitiesOptions {
            by_name: query.name,
            by_group: query.group,
            by_public_key_fingerprint: query.public_key_fingerprint,
            show_system: query.show_system,
            limit: query.limit,
            after: query.after,
        },
    )
    .await?;

    let mut items = Vec::with_capacity(users.len());
    for identity in &users {
        items.push(render_user(&mut tx, identity).await?);
    }
    Ok(Json(items.into()))
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<CreateUserResponse>)> {
    require_admin(&state.db, &access).await?;

    let mut rules = Rules::new();
    rules
        .required("name", &request.name)
        .email("name", &request.name);
    rules.finish()?;

    let one_time_password = local::generate_password();
    let password = one_time_password.clone();
    let hash = tokio::task::spawn_blocking(move || local::hash_password(&password))
        .await
        .map_err(|e| Error::internal(format!("hash task failed: {e}")))??;

    let mut tx = state.db.write(access.organization_id()).await?;
    let infra = crate::store::providers::infra_provider(&mut tx).await?;
    let mut identity = Identity {
        id: Id::zero(),
        organization_id: access.organization_id(),
        name: request.name,
        last_seen_at: None,
        created_by: access.user_id(),
        verified: false,
        verification_token: None,
        ssh_login_name: None,
        password_hash: Some(hash),
        one_time_password: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    identities::create_identity(&mut tx, &mut identity).await?;
    identities::add_identity_provider(&mut tx, identity.id, infra.id).await?;
    tx.commit().await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            id: identity.id,
            name: identity.name,
            one_time_password: Some(one_time_password),
        }),
    ))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Path(id): Path<Id>,
) -> Result<Json<User>> {
    require_self_or_admin(&state.db, &access, id).await?;
    let mut tx = state.db.read(access.organization_id()).await?;
    let identity = identities::get_identity(&mut tx, identities::GetIdentity::ById(id)).await?;
    Ok(Json(render_user(&mut tx, &identity).await?))
}

/// Change a user's password. The old password is required unless the caller
/// holds an admin grant.
pub async fn update_user(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Path(id): Path<Id>,
    Json(request): Json<UpdateUserRequest>,
) -> Result<StatusCode> {
    require_self_or_admin(&state.db, &access, id).await?;

    let mut rules = Rules::new();
    rules
        .required("password", &request.password)
        .min_length("password", &request.password, local::MIN_PASSWORD_LENGTH);
    rules.finish()?;

    let is_admin = require_admin(&state.db, &access).await.is_ok();

    let mut tx = state.db.write(access.organization_id()).await?;
    let mut identity = identities::get_identity(&mut tx, identities::GetIdentity::ById(id)).await?;

    if !is_admin {
        let old = request.old_password.clone().ok_or(Error::Unauthorized)?;
        let hash = identity.password_hash.clone().ok_or(Error::Unauthorized)?;
        tokio::task::spawn_blocking(move || local::verify_password(&hash, &old))
            .await
            .map_err(|e| Error::internal(format!("verify task failed: {e}")))??;
    }

    let password = request.password;
    let hash = tokio::task::spawn_blocking(move || local::hash_password(&password))
        .await
        .map_err(|e| Error::internal(format!("hash task failed: {e}")))??;
    identity.password_hash = Some(hash);
    identity.one_time_password = false;
    identities::update_identity(&mut tx, &identity).await?;
    tx.commit().await?;
    Ok(StatusCode::OK)
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Path(id): Path<Id>,
) -> Result<StatusCode> {
    require_admin(&state.db, &access).await?;
    if id == access.user_id() {
        return Err(Error::field("id", "cannot delete the authenticated user"));
    }
    let mut tx = state.db.write(access.organization_id()).await?;
    identities::delete_identity(&mut tx, id).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Split an authorized_keys line into (key type, base64 payload, comment).
fn parse_authorized_key(line: &str) -> Result<(String, String, Option<String>)> {
    let mut parts = line.split_whitespace();
    let key_type = parts.next().unwrap_or("");
    let payload = parts.next().unwrap_or("");
    let comment = parts.next().map(str::to_string);
    if key_type.is_empty() || payload.is_empty() {
        return Err(Error::field(
            "publicKey",
            "must be a key type followed by a base64 payload",
        ));
    }
    Ok((key_type.to_string(), payload.to_string(), comment))
}

pub async fn add_public_key(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Path(id): Path<Id>,
    Json(request): Json<AddUserPublicKeyRequest>,
) -> Result<(StatusCode, Json<UserPublicKey>)> {
    require_self_or_admin(&state.db, &access, id).await?;

    let mut rules = Rules::new();
    rules.required("publicKey", &request.public_key);
    rules.finish()?;

    let (key_type, payload, comment) = parse_authorized_key(&request.public_key)?;
    let fingerprint = public_keys::fingerprint(&payload)?;

    let mut tx = state.db.write(access.organization_id()).await?;
    let mut key = models::UserPublicKey {
        id: Id::zero(),
        organization_id: access.organization_id(),
        user_id: id,
        name: request.name.or(comment).unwrap_or_default(),
        public_key: payload,
        key_type,
        fingerprint,
        expires_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    public_keys::add_user_public_key(&mut tx, &mut key).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(key.to_api())))
}

pub async fn list_public_keys(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Path(id): Path<Id>,
) -> Result<Json<ListResponse<UserPublicKey>>> {
    require_self_or_admin(&state.db, &access, id).await?;
    let mut tx = state.db.read(access.organization_id()).await?;
    let keys = public_keys::list_user_public_keys(&mut tx, id).await?;
    Ok(Json(
        keys.iter().map(models::UserPublicKey::to_api).collect::<Vec<_>>().into(),
    ))
}

pub async fn delete_public_key(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Path((id, key_id)): Path<(Id, Id)>,
) -> Result<StatusCode> {
    require_self_or_admin(&state.db, &access, id).await?;
    let mut tx = state.db.write(access.organization_id()).await?;
    public_keys::delete_user_public_key(&mut tx, id, key_id).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_authorized_key_line() {
        let (key_type, payload, comment) =
            parse_authorized_key("ssh-ed25519 AAAAC3Nz alice@laptop").unwrap();
        assert_eq!(key_type, "ssh-ed25519");
        assert_eq!(payload, "AAAAC3Nz");
        assert_eq!(comment.as_deref(), Some("alice@laptop"));

        let (_, _, none) = parse_authorized_key("ssh-rsa AAAAB3Nz").unwrap();
        assert_eq!(none, None);

        assert!(parse_authorized_key("ssh-rsa").is_err());
        assert!(parse_authorized_key("").is_err());
    }
}
