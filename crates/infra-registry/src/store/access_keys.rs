//! Access key persistence and validation.
//!
//! The wire form is `keyID.secret`. The secret is generated here, handed to
//! the caller exactly once, and only its SHA-256 checksum is stored; reads
//! always come back with an empty secret. Validation is the hot path for
//! every authenticated request, so it runs on the pool outside an org-scoped
//! transaction: the key row itself is what resolves the tenant.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::QueryBuilder;

use infra_common::Id;

use crate::error::{Error, Result};
use crate::store::models::{
    secret_checksum, AccessKey, Identity, ACCESS_KEY_ID_LENGTH, ACCESS_KEY_SECRET_LENGTH,
    DEFAULT_ACCESS_KEY_TTL,
};
use crate::store::{
    identities, is_unique_violation, read_error, Db, ReadTxn, WriteTransaction,
};

const ACCESS_KEY_COLUMNS: &str =
    "id, organization_id, name, issued_for, provider_id, expires_at, extension, \
     extension_deadline, scopes, key_id, secret_checksum, created_at, updated_at";

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// An access key with defaults filled in: generated id, 12 hour TTL, no
/// extension window. Callers override fields before passing it to
/// [`create_access_key`].
pub fn new_access_key(issued_for: Id, provider_id: Id) -> AccessKey {
    let now = Utc::now();
    AccessKey {
        id: Id::generate(),
        organization_id: Id::zero(),
        name: String::new(),
        issued_for,
        provider_id,
        expires_at: now + DEFAULT_ACCESS_KEY_TTL,
        extension: None,
        extension_deadline: None,
        scopes: vec![],
        key_id: String::new(),
        secret: String::new(),
        secret_checksum: vec![],
        created_at: now,
        updated_at: now,
    }
}

/// Persist an access key and return the `keyID.secret` pair.
///
/// Key id and secret are generated when unset; caller-provided values must
/// have the exact required lengths.
pub async fn create_access_key(tx: &mut WriteTransaction, key: &mut AccessKey) -> Result<String> {
    match key.key_id.len() {
        0 => key.key_id = random_alphanumeric(ACCESS_KEY_ID_LENGTH),
        ACCESS_KEY_ID_LENGTH => {}
        _ => return Err(Error::field("keyId", "invalid key length")),
    }
    match key.secret.len() {
        0 => key.secret = random_alphanumeric(ACCESS_KEY_SECRET_LENGTH),
        ACCESS_KEY_SECRET_LENGTH => {}
        _ => return Err(Error::field("secret", "invalid secret length")),
    }
    key.secret_checksum = secret_checksum(&key.secret);

    if key.id.is_zero() {
        key.id = Id::generate();
    }
    if key.name.is_empty() {
        let issued_for =
            identities::get_identity(&mut *tx, identities::GetIdentity::ById(key.issued_for))
                .await?;
        key.name = format!("{}-{}", issued_for.name, key.key_id);
    }
    let now = Utc::now();
    key.created_at = now;
    key.updated_at = now;
    key.organization_id = tx.organization_id();

    let inserted = sqlx::query(
        "INSERT INTO access_keys \
         (id, organization_id, name, issued_for, provider_id, expires_at, extension, \
          extension_deadline, scopes, key_id, secret_checksum, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(key.id.as_i64())
    .bind(key.organization_id.as_i64())
    .bind(&key.name)
    .bind(key.issued_for.as_i64())
    .bind(key.provider_id.as_i64())
    .bind(key.expires_at)
    .bind(key.extension.map(|d| d.num_seconds()))
    .bind(key.extension_deadline)
    .bind(&key.scopes)
    .bind(&key.key_id)
    .bind(&key.secret_checksum)
    .bind(key.created_at)
    .bind(key.updated_at)
    .execute(tx.conn())
    .await;
    match inserted {
        Ok(_) => Ok(key.token()),
        Err(err) if is_unique_violation(&err) => Err(Error::duplicate("access key")),
        Err(err) => Err(err.into()),
    }
}

/// Selector for [`get_access_key`].
#[derive(Debug, Clone)]
pub enum GetAccessKey {
    ById(Id),
    ByKeyId(String),
}

pub async fn get_access_key(tx: &mut impl ReadTxn, selector: GetAccessKey) -> Result<AccessKey> {
    let org = tx.organization_id().as_i64();
    let mut query = QueryBuilder::new(format!(
        "SELECT {ACCESS_KEY_COLUMNS} FROM access_keys \
         WHERE deleted_at IS NULL AND organization_id = "
    ));
    query.push_bind(org);
    match selector {
        GetAccessKey::ById(id) => {
            query.push(" AND id = ").push_bind(id.as_i64());
        }
        GetAccessKey::ByKeyId(key_id) => {
            query.push(" AND key_id = ").push_bind(key_id);
        }
    }
    query
        .build_query_as::<AccessKey>()
        .fetch_one(tx.conn())
        .await
        .map_err(|e| read_error(e, "access key"))
}

#[derive(Debug, Clone, Default)]
pub struct ListAccessKeysOptions {
    pub by_issued_for: Option<Id>,
    /// Drop keys past their hard expiry or their extension deadline.
    pub not_expired: bool,
}

pub async fn list_access_keys(
    tx: &mut impl ReadTxn,
    opts: ListAccessKeysOptions,
) -> Result<Vec<AccessKey>> {
    let org = tx.organization_id().as_i64();
    let mut query = QueryBuilder::new(format!(
        "SELECT {ACCESS_KEY_COLUMNS} FROM access_keys \
         WHERE deleted_at IS NULL AND organization_id = "
    ));
    query.push_bind(org);
    if let Some(issued_for) = opts.by_issued_for {
        query
            .push(" AND issued_for = ")
            .push_bind(issued_for.as_i64());
    }
    if opts.not_expired {
        let now = Utc::now();
        query.push(" AND expires_at > ").push_bind(now);
        query
            .push(" AND (extension_deadline IS NULL OR extension_deadline > ")
            .push_bind(now);
        query.push(")");
    }
    query.push(" ORDER BY id ASC");
    let keys = query
        .build_query_as::<AccessKey>()
        .fetch_all(tx.conn())
        .await?;
    Ok(keys)
}

#[derive(Debug, Clone, Default)]
pub struct DeleteAccessKeysOptions {
    pub by_id: Option<Id>,
    pub by_key_id: Option<String>,
    pub by_user_id: Option<Id>,
    pub by_provider_id: Option<Id>,
}

/// Soft delete matching keys. Requires at least one selector.
pub async fn delete_access_keys(
    tx: &mut WriteTransaction,
    opts: DeleteAccessKeysOptions,
) -> Result<()> {
    let org = tx.organization_id().as_i64();
    let mut query = QueryBuilder::new("UPDATE access_keys SET deleted_at = ");
    query.push_bind(Utc::now());
    query.push(" WHERE deleted_at IS NULL AND organization_id = ");
    query.push_bind(org);
    query.push(" AND ");

    if let Some(id) = opts.by_id {
        query.push("id = ").push_bind(id.as_i64());
    } else if let Some(key_id) = opts.by_key_id {
        query.push("key_id = ").push_bind(key_id);
    } else if let Some(user_id) = opts.by_user_id {
        query.push("issued_for = ").push_bind(user_id.as_i64());
    } else if let Some(provider_id) = opts.by_provider_id {
        query.push("provider_id = ").push_bind(provider_id.as_i64());
    } else {
        return Err(Error::field("id", "a delete selector is required"));
    }

    query.build().execute(tx.conn()).await?;
    Ok(())
}

/// Validate a presented `keyID.secret` credential.
///
/// Returns the key and the identity it was issued for. When the key carries
/// an extension, a successful validation slides `extension_deadline` forward,
/// capped at the hard expiry. The identity's `last_seen_at` is refreshed.
pub async fn validate_access_key(db: &Db, token: &str) -> Result<(AccessKey, Identity)> {
    let (key_id, secret) = token.split_once('.').ok_or(Error::Unauthorized)?;

    let mut key = sqlx::query_as::<_, AccessKey>(&format!(
        "SELECT {ACCESS_KEY_COLUMNS} FROM access_keys \
         WHERE deleted_at IS NULL AND key_id = $1"
    ))
    .bind(key_id)
    .fetch_one(db.pool())
    .await
    .map_err(|e| match e {
        sqlx::Error::RowNotFound => Error::AccessKeyNotFound,
        other => Error::Database(other),
    })?;

    let now = Utc::now();
    key.check_secret(secret, now)?;

    if let Some(extension) = key.extension {
        let deadline = std::cmp::min(now + extension, key.expires_at);
        sqlx::query("UPDATE access_keys SET extension_deadline = $1, updated_at = $2 WHERE id = $3")
            .bind(deadline)
            .bind(now)
            .bind(key.id.as_i64())
            .execute(db.pool())
            .await?;
        key.extension_deadline = Some(deadline);
    }

    let identity = sqlx::query_as::<_, Identity>(
        "SELECT id, organization_id, name, last_seen_at, created_by, verified, \
                verification_token, ssh_login_name, password_hash, one_time_password, \
                created_at, updated_at \
         FROM identities \
         WHERE deleted_at IS NULL AND organization_id = $1 AND id = $2",
    )
    .bind(key.organization_id.as_i64())
    .bind(key.issued_for.as_i64())
    .fetch_one(db.pool())
    .await
    .map_err(|e| match e {
        // The key outlived its identity; treat as a bad credential.
        sqlx::Error::RowNotFound => Error::Unauthorized,
        other => Error::Database(other),
    })?;

    sqlx::query("UPDATE identities SET last_seen_at = $1 WHERE id = $2")
        .bind(now)
        .bind(identity.id.as_i64())
        .execute(db.pool())
        .await?;

    Ok((key, identity))
}
