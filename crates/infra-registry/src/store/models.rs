//! Persisted entity types.
//!
//! These are the store's row shapes, not the wire types; `to_api`
//! conversions produce the wire form and drop anything secret. Every entity
//! carries the common id/timestamps/soft-delete columns plus its tenant's
//! `organization_id`.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use infra_common::api;
use infra_common::{Id, Subject};

use crate::error::{Error, Result};

/// Length of the public half of an access key.
pub const ACCESS_KEY_ID_LENGTH: usize = 10;

/// Length of the secret half of an access key.
pub const ACCESS_KEY_SECRET_LENGTH: usize = 24;

/// Default access key lifetime when the caller does not pick one.
pub const DEFAULT_ACCESS_KEY_TTL: Duration = Duration::hours(12);

fn get_id(row: &PgRow, column: &str) -> sqlx::Result<Id> {
    row.try_get::<i64, _>(column).map(Id::from)
}

#[derive(Debug, Clone)]
pub struct Organization {
    pub id: Id,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for Organization {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Organization {
            id: get_id(row, "id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Identity provider kind. `Infra` is the built-in local provider; the rest
/// are OIDC flavors that differ only in defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Infra,
    Oidc,
    Google,
    Okta,
    Azure,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Infra => "infra",
            ProviderKind::Oidc => "oidc",
            ProviderKind::Google => "google",
            ProviderKind::Okta => "okta",
            ProviderKind::Azure => "azure",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "infra" => Ok(ProviderKind::Infra),
            "oidc" => Ok(ProviderKind::Oidc),
            "google" => Ok(ProviderKind::Google),
            "okta" => Ok(ProviderKind::Okta),
            "azure" => Ok(ProviderKind::Azure),
            other => Err(Error::field("kind", format!("unknown provider kind {other:?}"))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Provider {
    pub id: Id,
    pub organization_id: Id,
    pub name: String,
    pub kind: ProviderKind,
    pub issuer_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_url: Option<String>,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Provider {
    pub fn to_api(&self) -> api::Provider {
        api::Provider {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind.as_str().to_string(),
            issuer_url: self.issuer_url.clone(),
            client_id: self.client_id.clone(),
            created: self.created_at,
            updated: self.updated_at,
        }
    }
}

impl FromRow<'_, PgRow> for Provider {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let kind: String = row.try_get("kind")?;
        let kind = ProviderKind::parse(&kind).map_err(|e| sqlx::Error::ColumnDecode {
            index: "kind".into(),
            source: Box::new(std::io::Error::other(e.to_string())),
        })?;
        Ok(Provider {
            id: get_id(row, "id")?,
            organization_id: get_id(row, "organization_id")?,
            name: row.try_get("name")?,
            kind,
            issuer_url: row.try_get("issuer_url")?,
            client_id: row.try_get("client_id")?,
            client_secret: row.try_get("client_secret")?,
            redirect_url: row.try_get("redirect_url")?,
            scopes: row.try_get("scopes")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub id: Id,
    pub organization_id: Id,
    pub name: String,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_by: Id,
    pub verified: bool,
    pub verification_token: Option<String>,
    pub ssh_login_name: Option<String>,
    /// Local provider credential, PHC string. Absent for OIDC-only users.
    pub password_hash: Option<String>,
    /// Set when the current password was issued by an admin and must be
    /// changed on first use.
    pub one_time_password: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn to_api(&self, provider_names: Vec<String>, public_keys: Vec<UserPublicKey>) -> api::User {
        api::User {
            id: self.id,
            name: self.name.clone(),
            created: self.created_at,
            updated: self.updated_at,
            last_seen_at: self.last_seen_at,
            provider_names,
            public_keys: public_keys.iter().map(UserPublicKey::to_api).collect(),
            ssh_login_name: self.ssh_login_name.clone(),
        }
    }
}

impl FromRow<'_, PgRow> for Identity {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Identity {
            id: get_id(row, "id")?,
            organization_id: get_id(row, "organization_id")?,
            name: row.try_get("name")?,
            last_seen_at: row.try_get("last_seen_at")?,
            created_by: get_id(row, "created_by")?,
            verified: row.try_get("verified")?,
            verification_token: row.try_get("verification_token")?,
            ssh_login_name: row.try_get("ssh_login_name")?,
            password_hash: row.try_get("password_hash")?,
            one_time_password: row.try_get("one_time_password")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: Id,
    pub organization_id: Id,
    pub provider_id: Id,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    pub fn to_api(&self) -> api::Group {
        api::Group {
            id: self.id,
            name: self.name.clone(),
            provider_id: self.provider_id,
            created: self.created_at,
            updated: self.updated_at,
        }
    }
}

impl FromRow<'_, PgRow> for Group {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Group {
            id: get_id(row, "id")?,
            organization_id: get_id(row, "organization_id")?,
            provider_id: get_id(row, "provider_id")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Destination {
    pub id: Id,
    pub organization_id: Id,
    pub name: String,
    pub ca: String,
    pub endpoint: String,
    pub namespace: String,
    pub sa_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Destination {
    pub fn to_api(&self) -> api::Destination {
        api::Destination {
            id: self.id,
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            namespace: self.namespace.clone(),
            created: self.created_at,
            updated: self.updated_at,
        }
    }
}

impl FromRow<'_, PgRow> for Destination {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Destination {
            id: get_id(row, "id")?,
            organization_id: get_id(row, "organization_id")?,
            name: row.try_get("name")?,
            ca: row.try_get("ca")?,
            endpoint: row.try_get("endpoint")?,
            namespace: row.try_get("namespace")?,
            sa_token: row.try_get("sa_token")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Grant {
    pub id: Id,
    pub organization_id: Id,
    pub subject: Subject,
    pub privilege: String,
    pub resource: String,
    pub created_by: Id,
    /// Monotonic cursor drawn from `seq_update_index` on insert and on soft
    /// delete. Unique across the table, gaps allowed.
    pub update_index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Grant {
    pub fn to_api(&self) -> api::Grant {
        api::Grant {
            id: self.id,
            subject: self.subject,
            privilege: self.privilege.clone(),
            resource: self.resource.clone(),
            created_by: self.created_by,
            created: self.created_at,
            updated: self.updated_at,
        }
    }
}

impl FromRow<'_, PgRow> for Grant {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let subject: String = row.try_get("subject")?;
        let subject = subject
            .parse::<Subject>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "subject".into(),
                source: Box::new(e),
            })?;
        Ok(Grant {
            id: get_id(row, "id")?,
            organization_id: get_id(row, "organization_id")?,
            subject,
            privilege: row.try_get("privilege")?,
            resource: row.try_get("resource")?,
            created_by: get_id(row, "created_by")?,
            update_index: row.try_get("update_index")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AccessKey {
    pub id: Id,
    pub organization_id: Id,
    pub name: String,
    pub issued_for: Id,
    pub provider_id: Id,
    pub expires_at: DateTime<Utc>,
    /// Sliding-window increment. When set, each successful validation pushes
    /// `extension_deadline` forward by this much, capped at `expires_at`.
    pub extension: Option<Duration>,
    pub extension_deadline: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub key_id: String,
    /// Plaintext secret. Populated only on the freshly created value; the
    /// store persists the checksum and reads back an empty string.
    pub secret: String,
    pub secret_checksum: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccessKey {
    /// Wire form handed to the client exactly once.
    pub fn token(&self) -> String {
        format!("{}.{}", self.key_id, self.secret)
    }

    /// Check a presented secret against this key's checksum and deadlines.
    ///
    /// Comparison is constant-time. Checks run in fixed order: secret, hard
    /// expiry, extension deadline.
    pub fn check_secret(&self, secret: &str, now: DateTime<Utc>) -> Result<()> {
        let presented = secret_checksum(secret);
        if aws_lc_rs::constant_time::verify_slices_are_equal(&presented, &self.secret_checksum)
            .is_err()
        {
            return Err(Error::AccessKeyInvalidSecret);
        }
        if now >= self.expires_at {
            return Err(Error::AccessKeyExpired);
        }
        if let Some(deadline) = self.extension_deadline {
            if now >= deadline {
                return Err(Error::AccessKeyDeadlineExceeded);
            }
        }
        Ok(())
    }
}

impl FromRow<'_, PgRow> for AccessKey {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let extension: Option<i64> = row.try_get("extension")?;
        Ok(AccessKey {
            id: get_id(row, "id")?,
            organization_id: get_id(row, "organization_id")?,
            name: row.try_get("name")?,
            issued_for: get_id(row, "issued_for")?,
            provider_id: get_id(row, "provider_id")?,
            expires_at: row.try_get("expires_at")?,
            extension: extension.map(Duration::seconds),
            extension_deadline: row.try_get("extension_deadline")?,
            scopes: row.try_get("scopes")?,
            key_id: row.try_get("key_id")?,
            secret: String::new(),
            secret_checksum: row.try_get("secret_checksum")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// SHA-256 checksum of an access key secret; the only form that is stored.
pub fn secret_checksum(secret: &str) -> Vec<u8> {
    Sha256::digest(secret.as_bytes()).to_vec()
}

#[derive(Debug, Clone)]
pub struct UserPublicKey {
    pub id: Id,
    pub organization_id: Id,
    pub user_id: Id,
    pub name: String,
    pub public_key: String,
    pub key_type: String,
    /// SHA-256 fingerprint, unique among live keys.
    pub fingerprint: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserPublicKey {
    pub fn to_api(&self) -> api::UserPublicKey {
        api::UserPublicKey {
            id: self.id,
            name: self.name.clone(),
            created: self.created_at,
            public_key: self.public_key.clone(),
            key_type: self.key_type.clone(),
            fingerprint: self.fingerprint.clone(),
            expires: self.expires_at,
        }
    }
}

impl FromRow<'_, PgRow> for UserPublicKey {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(UserPublicKey {
            id: get_id(row, "id")?,
            organization_id: get_id(row, "organization_id")?,
            user_id: get_id(row, "user_id")?,
            name: row.try_get("name")?,
            public_key: row.try_get("public_key")?,
            key_type: row.try_get("key_type")?,
            fingerprint: row.try_get("fingerprint")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_with(expires: DateTime<Utc>, deadline: Option<DateTime<Utc>>) -> AccessKey {
        let now = Utc::now();
        AccessKey {
            id: Id::generate(),
            organization_id: Id::from(1),
            name: "test".into(),
            issued_for: Id::from(2),
            provider_id: Id::from(3),
            expires_at: expires,
            extension: None,
            extension_deadline: deadline,
            scopes: vec![],
            key_id: "0123456789".into(),
            secret: String::new(),
            secret_checksum: secret_checksum("012345678901234567890123"),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn check_secret_accepts_matching_secret() {
        let key = key_with(Utc::now() + Duration::hours(12), None);
        assert!(key.check_secret("012345678901234567890123", Utc::now()).is_ok());
    }

    #[test]
    fn check_secret_rejects_wrong_secret() {
        let key = key_with(Utc::now() + Duration::hours(12), None);
        let err = key
            .check_secret("999999999999999999999999", Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::AccessKeyInvalidSecret));
    }

    #[test]
    fn check_secret_rejects_expired_key() {
        let key = key_with(Utc::now() - Duration::hours(1), None);
        let err = key
            .check_secret("012345678901234567890123", Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::AccessKeyExpired));
    }

    #[test]
    fn check_secret_rejects_past_extension_deadline() {
        let key = key_with(
            Utc::now() + Duration::hours(1),
            Some(Utc::now() - Duration::hours(1)),
        );
        let err = key
            .check_secret("012345678901234567890123", Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::AccessKeyDeadlineExceeded));
    }

    #[test]
    fn token_joins_key_id_and_secret_with_a_dot() {
        let mut key = key_with(Utc::now() + Duration::hours(1), None);
        key.secret = "012345678901234567890123".into();
        assert_eq!(key.token(), "0123456789.012345678901234567890123");
    }
}
