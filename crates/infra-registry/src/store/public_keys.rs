//! SSH public keys attached to identities.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};

use infra_common::Id;

use crate::error::{Error, Result};
use crate::store::models::UserPublicKey;
use crate::store::{identities, is_unique_violation, ReadTxn, WriteTransaction};

const PUBLIC_KEY_COLUMNS: &str =
    "id, organization_id, user_id, name, public_key, key_type, fingerprint, expires_at, \
     created_at, updated_at";

/// OpenSSH-style SHA256 fingerprint of a base64 public key payload.
pub fn fingerprint(public_key_b64: &str) -> Result<String> {
    let raw = STANDARD
        .decode(public_key_b64)
        .map_err(|_| Error::field("publicKey", "is not valid base64"))?;
    let digest = Sha256::digest(&raw);
    Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}

/// Persist a public key for a user.
///
/// The fingerprint must be set by the caller (see [`fingerprint`]). Also
/// backfills an SSH login name for identities that predate the field.
pub async fn add_user_public_key(
    tx: &mut WriteTransaction,
    key: &mut UserPublicKey,
) -> Result<()> {
    if key.user_id.is_zero() {
        return Err(Error::field("userID", "is required"));
    }
    if key.fingerprint.is_empty() {
        return Err(Error::field("fingerprint", "is required"));
    }
    if key.key_type.is_empty() {
        return Err(Error::field("keyType", "is required"));
    }
    if key.id.is_zero() {
        key.id = Id::generate();
    }
    let now = Utc::now();
    key.created_at = now;
    key.updated_at = now;
    key.organization_id = tx.organization_id();

    let inserted = sqlx::query(
        "INSERT INTO user_public_keys \
         (id, organization_id, user_id, name, public_key, key_type, fingerprint, expires_at, \
          created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(key.id.as_i64())
    .bind(key.organization_id.as_i64())
    .bind(key.user_id.as_i64())
    .bind(&key.name)
    .bind(&key.public_key)
    .bind(&key.key_type)
    .bind(&key.fingerprint)
    .bind(key.expires_at)
    .bind(key.created_at)
    .bind(key.updated_at)
    .execute(tx.conn())
    .await;
    match inserted {
        Ok(_) => {}
        Err(err) if is_unique_violation(&err) => return Err(Error::duplicate("public key")),
        Err(err) => return Err(err.into()),
    }

    let mut user =
        identities::get_identity(&mut *tx, identities::GetIdentity::ById(key.user_id)).await?;
    if user.ssh_login_name.is_none() {
        identities::set_ssh_login_name(tx, &mut user).await?;
    }
    Ok(())
}

pub async fn list_user_public_keys(
    tx: &mut impl ReadTxn,
    user_id: Id,
) -> Result<Vec<UserPublicKey>> {
    let org = tx.organization_id().as_i64();
    let keys = sqlx::query_as::<_, UserPublicKey>(&format!(
        "SELECT {PUBLIC_KEY_COLUMNS} FROM user_public_keys \
         WHERE deleted_at IS NULL AND organization_id = $1 AND user_id = $2 ORDER BY id ASC"
    ))
    .bind(org)
    .bind(user_id.as_i64())
    .fetch_all(tx.conn())
    .await?;
    Ok(keys)
}

pub async fn delete_user_public_key(
    tx: &mut WriteTransaction,
    user_id: Id,
    key_id: Id,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE user_public_keys SET deleted_at = $1 \
         WHERE deleted_at IS NULL AND organization_id = $2 AND user_id = $3 AND id = $4",
    )
    .bind(Utc::now())
    .bind(tx.organization_id().as_i64())
    .bind(user_id.as_i64())
    .bind(key_id.as_i64())
    .execute(tx.conn())
    .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found("public key"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_matches_openssh_format() {
        // ssh-keygen renders SHA256 fingerprints as unpadded base64.
        let payload = STANDARD.encode(b"some public key bytes");
        let fp = fingerprint(&payload).unwrap();
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn fingerprint_rejects_bad_base64() {
        assert!(fingerprint("not!!base64").is_err());
    }
}
