//! Startup configuration file.
//!
//! The file declares providers and permissions; the database stays
//! authoritative for everything created interactively. File-managed grants
//! are stamped with a reserved `created_by` so a restart can reconcile them:
//! entries present in the file are upserted, file-managed grants no longer
//! in the file are deleted, and interactively created grants are untouched.

use std::path::Path;

use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use infra_common::{Id, Subject};

use crate::error::{Error, Result};
use crate::store::grants::{self, DeleteGrantsOptions, GetGrant};
use crate::store::models::{Grant, Group, Identity, Provider, ProviderKind};
use crate::store::{groups, identities, providers, Db, ReadTxn};

/// `created_by` marker for rows managed by the configuration file.
pub const CONFIG_CREATED_BY: Id = Id::from_raw(1);

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub permissions: Vec<PermissionConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: OidcProviderConfig,
    /// Groups expected from this provider; pre-created so permissions can
    /// reference them before anyone logs in.
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct OidcProviderConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub issuer_url: Option<String>,
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub scope: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PermissionConfig {
    /// Provider that owns the referenced group. Defaults to the built-in
    /// provider.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    pub role: String,
    /// Destination cluster; the grant targets the registry itself when
    /// unset.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl PermissionConfig {
    fn resource(&self) -> String {
        match (&self.destination, &self.namespace) {
            (Some(destination), Some(namespace)) => format!("{destination}.{namespace}"),
            (Some(destination), None) => destination.clone(),
            (None, _) => infra_common::INFRA_RESOURCE.to_string(),
        }
    }
}

pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::internal(format!("failed to read {}: {e}", path.display())))?;
    serde_yaml::from_str(&raw)
        .map_err(|e| Error::internal(format!("failed to parse {}: {e}", path.display())))
}

/// Apply the file to the database.
pub async fn apply(db: &Db, organization_id: Id, config: &Config) -> Result<()> {
    let mut tx = db.write(organization_id).await?;

    for entry in &config.providers {
        let kind = ProviderKind::parse(&entry.kind)?;
        if kind == ProviderKind::Infra {
            return Err(Error::field("providers.kind", "infra is built in"));
        }
        let provider = match providers::get_provider(
            &mut tx,
            providers::GetProvider::ByName(entry.name.clone()),
        )
        .await
        {
            Ok(mut existing) => {
                existing.issuer_url = entry.config.issuer_url.clone();
                existing.client_id = entry.config.client_id.clone();
                existing.client_secret = entry.config.client_secret.clone();
                existing.redirect_url = entry.config.redirect_url.clone();
                existing.scopes = entry.config.scope.clone();
                providers::update_provider(&mut tx, &existing).await?;
                existing
            }
            Err(Error::NotFound { .. }) => {
                let mut provider = Provider {
                    id: Id::zero(),
                    organization_id,
                    name: entry.name.clone(),
                    kind,
                    issuer_url: entry.config.issuer_url.clone(),
                    client_id: entry.config.client_id.clone(),
                    client_secret: entry.config.client_secret.clone(),
                    redirect_url: entry.config.redirect_url.clone(),
                    scopes: entry.config.scope.clone(),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                };
                providers::create_provider(&mut tx, &mut provider).await?;
                provider
            }
            Err(err) => return Err(err),
        };

        for name in &entry.groups {
            ensure_group(&mut tx, provider.id, name).await?;
        }
    }

    let mut kept = Vec::new();
    for entry in &config.permissions {
        let subject = resolve_subject(&mut tx, organization_id, entry).await?;
        let resource = entry.resource();
        let mut grant = Grant {
            id: Id::zero(),
            organization_id,
            subject,
            privilege: entry.role.clone(),
            resource: resource.clone(),
            created_by: CONFIG_CREATED_BY,
            update_index: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        match grants::create_grant(&mut tx, &mut grant).await {
            Ok(()) => kept.push(grant.id),
            Err(Error::Duplicate { .. }) => {
                let existing = grants::get_grant(
                    &mut tx,
                    GetGrant::BySpec {
                        subject,
                        privilege: entry.role.clone(),
                        resource,
                    },
                )
                .await?;
                kept.push(existing.id);
            }
            Err(err) => return Err(err),
        }
    }

    // File wins on restart: file-managed grants that disappeared from the
    // file are revoked, everything else is left alone.
    grants::delete_grants(
        &mut tx,
        DeleteGrantsOptions {
            by_created_by: Some(CONFIG_CREATED_BY),
            not_ids: kept,
            ..Default::default()
        },
    )
    .await?;

    tx.commit().await?;
    info!(
        providers = config.providers.len(),
        permissions = config.permissions.len(),
        "applied configuration file"
    );
    Ok(())
}

async fn ensure_group(
    tx: &mut crate::store::WriteTransaction,
    provider_id: Id,
    name: &str,
) -> Result<Group> {
    match groups::get_group(
        &mut *tx,
        groups::GetGroup::ByName {
            provider_id,
            name: name.to_string(),
        },
    )
    .await
    {
        Ok(group) => Ok(group),
        Err(Error::NotFound { .. }) => {
            let mut group = Group {
                id: Id::zero(),
                organization_id: tx.organization_id(),
                provider_id,
                name: name.to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            groups::create_group(tx, &mut group).await?;
            Ok(group)
        }
        Err(err) => Err(err),
    }
}

async fn resolve_subject(
    tx: &mut crate::store::WriteTransaction,
    organization_id: Id,
    entry: &PermissionConfig,
) -> Result<Subject> {
    match (&entry.user, &entry.group) {
        (Some(user), None) => {
            match identities::get_identity(
                &mut *tx,
                identities::GetIdentity::ByName(user.clone()),
            )
            .await
            {
                Ok(identity) => Ok(Subject::user(identity.id)),
                Err(Error::NotFound { .. }) => {
                    let mut identity = Identity {
                        id: Id::zero(),
                        organization_id,
                        name: user.clone(),
                        last_seen_at: None,
                        created_by: CONFIG_CREATED_BY,
                        verified: false,
                        verification_token: None,
                        ssh_login_name: None,
                        password_hash: None,
                        one_time_password: false,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    };
                    identities::create_identity(&mut *tx, &mut identity).await?;
                    Ok(Subject::user(identity.id))
                }
                Err(err) => Err(err),
            }
        }
        (None, Some(group)) => {
            let provider = match &entry.provider {
                Some(name) => {
                    providers::get_provider(
                        &mut *tx,
                        providers::GetProvider::ByName(name.clone()),
                    )
                    .await?
                }
                None => providers::infra_provider(&mut *tx).await?,
            };
            let group = ensure_group(tx, provider.id, group).await?;
            Ok(Subject::group(group.id))
        }
        _ => Err(Error::field(
            "permissions",
            "exactly one of user or group is required",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_documented_shape() {
        let raw = r#"
providers:
  - name: okta
    kind: okta
    config:
      client-id: example-client
      client-secret: secret-ref
      issuer-url: https://example.okta.com
      redirect-url: https://infra.example.com/callback
      scope: [openid, email, groups]
    groups: [developers]
permissions:
  - provider: okta
    group: developers
    role: view
    destination: prod
  - user: admin@example.com
    role: admin
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].config.scope.len(), 3);
        assert_eq!(config.permissions.len(), 2);
        assert_eq!(config.permissions[0].resource(), "prod");
        assert_eq!(config.permissions[1].resource(), "infra");
    }

    #[test]
    fn namespace_scopes_the_resource() {
        let entry = PermissionConfig {
            provider: None,
            user: Some("dev@example.com".into()),
            group: None,
            role: "edit".into(),
            destination: Some("staging".into()),
            namespace: Some("team-a".into()),
        };
        assert_eq!(entry.resource(), "staging.team-a");
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = "providers:\n  - name: x\n    kind: oidc\n    unexpected: true\n";
        assert!(serde_yaml::from_str::<Config>(raw).is_err());
    }
}
