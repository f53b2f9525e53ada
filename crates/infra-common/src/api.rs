//! JSON wire types for the registry API.
//!
//! Shared by the registry server, the engine's registry client, and any CLI
//! client. Field names are camelCase on the wire. Secrets never appear in
//! response types: an access key's secret exists only in the string returned
//! at creation, and destination service-account tokens are write-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::uid::{Id, Subject};

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Id,
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Providers that can authenticate this user.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provider_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_keys: Vec<UserPublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_login_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPublicKey {
    pub id: Id,
    /// Generally the hostname of the device that created the key pair.
    pub name: String,
    pub created: DateTime<Utc>,
    /// Base64 encoded public key, as it appears in an authorized_keys file.
    pub public_key: String,
    /// Key type in authorized_keys format, e.g. `ssh-ed25519`.
    pub key_type: String,
    /// SHA256 fingerprint of the public key.
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: Id,
    pub name: String,
    pub provider_id: Id,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: Id,
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub id: Id,
    pub subject: Subject,
    pub privilege: String,
    pub resource: String,
    pub created_by: Id,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub id: Id,
    pub name: String,
    pub endpoint: String,
    pub namespace: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Login and credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_credentials: Option<PasswordCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordCredentials {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcCredentials {
    pub provider_id: Id,
    /// Authorization code from the provider callback.
    pub code: String,
    /// Redirect URL used in the authorization request; must match the
    /// provider configuration.
    pub redirect_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user_id: Id,
    pub name: String,
    /// Bearer credential in `keyID.secret` form. Shown exactly once.
    pub access_key: String,
    pub expires: DateTime<Utc>,
    /// Set when the user logged in with a one-time password and must change
    /// it before other requests are accepted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub password_update_required: bool,
}

/// Exchange the presented access key for a short-lived signed JWT accepted by
/// engine proxies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    pub expires: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserResponse {
    pub id: Id,
    pub name: String,
    /// Present when the user was created with the local provider; they must
    /// change it on first login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    /// Required unless the caller holds an admin grant.
    #[serde(default)]
    pub old_password: Option<String>,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUsersQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Id>,
    /// Include internal identities such as the engine connector.
    #[serde(default)]
    pub show_system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_fingerprint: Option<String>,
    // Keyset pagination; kept inline because query-string deserialization
    // cannot flatten nested structs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUserPublicKeyRequest {
    #[serde(default)]
    pub name: Option<String>,
    /// Key type and base64 payload, as one authorized_keys line.
    pub public_key: String,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<Id>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGroupMembersRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<Id>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<Id>,
}

// ---------------------------------------------------------------------------
// Grants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGrantRequest {
    pub subject: Subject,
    pub privilege: String,
    pub resource: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListGrantsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privilege: Option<String>,
    /// When the subject is a user, also return grants held through the
    /// user's groups.
    #[serde(default)]
    pub inherited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Id>,
}

// ---------------------------------------------------------------------------
// Destinations and roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDestinationRequest {
    pub name: String,
    /// PEM bundle for the cluster API server.
    pub ca: String,
    pub endpoint: String,
    pub namespace: String,
    /// Service-account token the registry stores for this engine. Write-only.
    pub sa_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDestinationResponse {
    pub id: Id,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRolesQuery {
    /// Update-index cursor from the previous pull; 0 on first sync.
    #[serde(default)]
    pub since: i64,
}

/// One role projected onto a destination: the users that hold `role`, either
/// directly or through group membership, scoped to an optional namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    /// Namespace scope parsed from `destination.namespace` resources; `None`
    /// means the role applies cluster-wide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// User names (emails), deduplicated and sorted.
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRolesResponse {
    pub roles: Vec<Role>,
    /// Cursor for the next `since` parameter. Reflects soft-deleted grants,
    /// so a delete always advances it.
    pub max_update_index: i64,
}

// ---------------------------------------------------------------------------
// JWKS
// ---------------------------------------------------------------------------

/// A published signing key in JWK form. Only the fields ES256 verification
/// needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    pub kid: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub use_: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}

// ---------------------------------------------------------------------------
// Lists, pagination, errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        ListResponse { items }
    }
}

/// Structured error body returned by every non-2xx registry response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
    /// Per-field validation failures; only populated on 400s.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
    /// Opaque id correlating a 500 with server logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub field: String,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_wire_form_uses_tagged_subject() {
        let grant = Grant {
            id: Id::from(1),
            subject: Subject::group(Id::from(9)),
            privilege: "admin".into(),
            resource: "prod.default".into(),
            created_by: Id::from(2),
            created: Utc::now(),
            updated: Utc::now(),
        };
        let json = serde_json::to_value(&grant).unwrap();
        assert_eq!(json["subject"], "g:9");
        assert_eq!(json["createdBy"], "2");

        let back: Grant = serde_json::from_value(json).unwrap();
        assert_eq!(back.subject, grant.subject);
    }

    #[test]
    fn login_response_round_trip_keeps_key_form() {
        let resp = LoginResponse {
            user_id: Id::from(5),
            name: "alice@example.com".into(),
            access_key: "abcdefghij.012345678901234567890123".into(),
            expires: Utc::now(),
            password_update_required: false,
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: LoginResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.access_key, resp.access_key);
    }

    #[test]
    fn list_roles_query_defaults_since_to_zero() {
        let q: ListRolesQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.since, 0);
    }
}
