//! Identity (user) persistence.
//!
//! Identities are created by explicit admin action or on first successful
//! OIDC login. Soft deleting an identity cascades to its grants and access
//! keys so a removed user loses cluster access on the next engine sync.

use chrono::Utc;
use sqlx::QueryBuilder;

use infra_common::{Id, Subject, CONNECTOR_IDENTITY_NAME};

use crate::error::{Error, Result};
use crate::store::models::Identity;
use crate::store::{access_keys, grants, is_unique_violation, read_error, ReadTxn, WriteTransaction};

const IDENTITY_COLUMNS: &str =
    "id, organization_id, name, last_seen_at, created_by, verified, verification_token, \
     ssh_login_name, password_hash, one_time_password, created_at, updated_at";

pub async fn create_identity(tx: &mut WriteTransaction, identity: &mut Identity) -> Result<()> {
    if identity.name.is_empty() {
        return Err(Error::field("name", "is required"));
    }
    if identity.id.is_zero() {
        identity.id = Id::generate();
    }
    let now = Utc::now();
    identity.created_at = now;
    identity.updated_at = now;
    identity.organization_id = tx.organization_id();

    let inserted = sqlx::query(
        "INSERT INTO identities \
         (id, organization_id, name, last_seen_at, created_by, verified, verification_token, \
          ssh_login_name, password_hash, one_time_password, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(identity.id.as_i64())
    .bind(identity.organization_id.as_i64())
    .bind(&identity.name)
    .bind(identity.last_seen_at)
    .bind(identity.created_by.as_i64())
    .bind(identity.verified)
    .bind(&identity.verification_token)
    .bind(&identity.ssh_login_name)
    .bind(&identity.password_hash)
    .bind(identity.one_time_password)
    .bind(identity.created_at)
    .bind(identity.updated_at)
    .execute(tx.conn())
    .await;
    match inserted {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(Error::duplicate("user")),
        Err(err) => Err(err.into()),
    }
}

/// Persist every mutable identity field.
pub async fn update_identity(tx: &mut WriteTransaction, identity: &Identity) -> Result<()> {
    sqlx::query(
        "UPDATE identities SET last_seen_at = $1, verified = $2, verification_token = $3, \
         ssh_login_name = $4, password_hash = $5, one_time_password = $6, updated_at = $7 \
         WHERE deleted_at IS NULL AND organization_id = $8 AND id = $9",
    )
    .bind(identity.last_seen_at)
    .bind(identity.verified)
    .bind(&identity.verification_token)
    .bind(&identity.ssh_login_name)
    .bind(&identity.password_hash)
    .bind(identity.one_time_password)
    .bind(Utc::now())
    .bind(tx.organization_id().as_i64())
    .bind(identity.id.as_i64())
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Selector for [`get_identity`].
#[derive(Debug, Clone)]
pub enum GetIdentity {
    ById(Id),
    ByName(String),
}

pub async fn get_identity(tx: &mut impl ReadTxn, selector: GetIdentity) -> Result<Identity> {
    let org = tx.organization_id().as_i64();
    let mut query = QueryBuilder::new(format!(
        "SELECT {IDENTITY_COLUMNS} FROM identities \
         WHERE deleted_at IS NULL AND organization_id = "
    ));
    query.push_bind(org);
    match selector {
        GetIdentity::ById(id) => {
            query.push(" AND id = ").push_bind(id.as_i64());
        }
        GetIdentity::ByName(name) => {
            query.push(" AND name = ").push_bind(name);
        }
    }
    query
        .build_query_as::<Identity>()
        .fetch_one(tx.conn())
        .await
        .map_err(|e| read_error(e, "user"))
}

#[derive(Debug, Clone, Default)]
pub struct ListIdentitiesOptions {
    pub by_name: Option<String>,
    /// Only members of this group.
    pub by_group: Option<Id>,
    /// Only the identity holding a public key with this fingerprint.
    pub by_public_key_fingerprint: Option<String>,
    /// Include internal identities (the engine connector).
    pub show_system: bool,
    pub limit: Option<u32>,
    pub after: Option<Id>,
}

pub async fn list_identities(
    tx: &mut impl ReadTxn,
    opts: ListIdentitiesOptions,
) -> Result<Vec<Identity>> {
    let org = tx.organization_id().as_i64();
    let mut query = QueryBuilder::new(format!(
        "SELECT {IDENTITY_COLUMNS} FROM identities \
         WHERE deleted_at IS NULL AND organization_id = "
    ));
    query.push_bind(org);

    if let Some(name) = &opts.by_name {
        query.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(group) = opts.by_group {
        query
            .push(" AND id IN (SELECT identity_id FROM identities_groups WHERE group_id = ")
            .push_bind(group.as_i64());
        query.push(")");
    }
    if let Some(fingerprint) = &opts.by_public_key_fingerprint {
        query.push(
            " AND id IN (SELECT user_id FROM user_public_keys \
             WHERE deleted_at IS NULL AND fingerprint = ",
        );
        query.push_bind(fingerprint.clone());
        query.push(")");
    }
    if !opts.show_system {
        query.push(" AND name <> ").push_bind(CONNECTOR_IDENTITY_NAME);
    }
    if let Some(after) = opts.after {
        query.push(" AND id > ").push_bind(after.as_i64());
    }
    query.push(" ORDER BY id ASC");
    if let Some(limit) = opts.limit {
        query.push(" LIMIT ").push_bind(i64::from(limit));
    }

    let identities = query
        .build_query_as::<Identity>()
        .fetch_all(tx.conn())
        .await?;
    Ok(identities)
}

/// Record that a credential issued to this identity was just used.
pub async fn touch_last_seen(tx: &mut WriteTransaction, id: Id) -> Result<()> {
    sqlx::query(
        "UPDATE identities SET last_seen_at = $1 \
         WHERE deleted_at IS NULL AND organization_id = $2 AND id = $3",
    )
    .bind(Utc::now())
    .bind(tx.organization_id().as_i64())
    .bind(id.as_i64())
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Soft delete an identity and cascade to everything that authenticates or
/// authorizes it: grants with the user subject, access keys issued to it,
/// and group memberships.
pub async fn delete_identity(tx: &mut WriteTransaction, id: Id) -> Result<()> {
    // Resolves NotFound before any cascade work happens.
    let identity = get_identity(&mut *tx, GetIdentity::ById(id)).await?;
    if identity.name == CONNECTOR_IDENTITY_NAME {
        return Err(Error::field("id", "the connector identity cannot be deleted"));
    }

    grants::delete_grants(
        tx,
        grants::DeleteGrantsOptions {
            by_subject: Some(Subject::user(id)),
            ..Default::default()
        },
    )
    .await?;
    access_keys::delete_access_keys(
        tx,
        access_keys::DeleteAccessKeysOptions {
            by_user_id: Some(id),
            ..Default::default()
        },
    )
    .await?;
    sqlx::query("DELETE FROM identities_groups WHERE identity_id = $1")
        .bind(id.as_i64())
        .execute(tx.conn())
        .await?;
    sqlx::query("DELETE FROM identities_providers WHERE identity_id = $1")
        .bind(id.as_i64())
        .execute(tx.conn())
        .await?;

    sqlx::query(
        "UPDATE identities SET deleted_at = $1 \
         WHERE deleted_at IS NULL AND organization_id = $2 AND id = $3",
    )
    .bind(Utc::now())
    .bind(tx.organization_id().as_i64())
    .bind(id.as_i64())
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Names of the providers that can authenticate this identity.
pub async fn provider_names_for_identity(
    tx: &mut impl ReadTxn,
    identity_id: Id,
) -> Result<Vec<String>> {
    let org = tx.organization_id().as_i64();
    let names = sqlx::query_scalar::<_, String>(
        "SELECT p.name FROM providers p \
         JOIN identities_providers ip ON ip.provider_id = p.id \
         WHERE p.deleted_at IS NULL AND p.organization_id = $1 AND ip.identity_id = $2 \
         ORDER BY p.name",
    )
    .bind(org)
    .bind(identity_id.as_i64())
    .fetch_all(tx.conn())
    .await?;
    Ok(names)
}

/// Record that `provider_id` provides this identity.
pub async fn add_identity_provider(
    tx: &mut WriteTransaction,
    identity_id: Id,
    provider_id: Id,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO identities_providers (identity_id, provider_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(identity_id.as_i64())
    .bind(provider_id.as_i64())
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Derive and persist an SSH login name from the identity's email local
/// part. Used to backfill identities that predate the field.
pub async fn set_ssh_login_name(tx: &mut WriteTransaction, identity: &mut Identity) -> Result<()> {
    let local = identity.name.split('@').next().unwrap_or("");
    let mut login: String = local
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase();
    if login.is_empty() {
        login = format!("u{}", identity.id);
    }
    identity.ssh_login_name = Some(login);
    update_identity(tx, identity).await
}
