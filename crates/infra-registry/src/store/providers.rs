//! Identity provider persistence.

use chrono::Utc;
use sqlx::QueryBuilder;

use infra_common::Id;

use crate::error::{Error, Result};
use crate::store::models::{Provider, ProviderKind};
use crate::store::{is_unique_violation, read_error, ReadTxn, WriteTransaction};

const PROVIDER_COLUMNS: &str =
    "id, organization_id, name, kind, issuer_url, client_id, client_secret, redirect_url, \
     scopes, created_at, updated_at";

pub async fn create_provider(tx: &mut WriteTransaction, provider: &mut Provider) -> Result<()> {
    if provider.name.is_empty() {
        return Err(Error::field("name", "is required"));
    }
    if provider.id.is_zero() {
        provider.id = Id::generate();
    }
    let now = Utc::now();
    provider.created_at = now;
    provider.updated_at = now;
    provider.organization_id = tx.organization_id();

    let inserted = sqlx::query(
        "INSERT INTO providers \
         (id, organization_id, name, kind, issuer_url, client_id, client_secret, redirect_url, \
          scopes, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(provider.id.as_i64())
    .bind(provider.organization_id.as_i64())
    .bind(&provider.name)
    .bind(provider.kind.as_str())
    .bind(&provider.issuer_url)
    .bind(&provider.client_id)
    .bind(&provider.client_secret)
    .bind(&provider.redirect_url)
    .bind(&provider.scopes)
    .bind(provider.created_at)
    .bind(provider.updated_at)
    .execute(tx.conn())
    .await;
    match inserted {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(Error::duplicate("provider")),
        Err(err) => Err(err.into()),
    }
}

/// Update the mutable provider fields (OIDC configuration).
pub async fn update_provider(tx: &mut WriteTransaction, provider: &Provider) -> Result<()> {
    sqlx::query(
        "UPDATE providers SET issuer_url = $1, client_id = $2, client_secret = $3, \
         redirect_url = $4, scopes = $5, updated_at = $6 \
         WHERE deleted_at IS NULL AND organization_id = $7 AND id = $8",
    )
    .bind(&provider.issuer_url)
    .bind(&provider.client_id)
    .bind(&provider.client_secret)
    .bind(&provider.redirect_url)
    .bind(&provider.scopes)
    .bind(Utc::now())
    .bind(tx.organization_id().as_i64())
    .bind(provider.id.as_i64())
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Selector for [`get_provider`].
#[derive(Debug, Clone)]
pub enum GetProvider {
    ById(Id),
    ByName(String),
}

pub async fn get_provider(tx: &mut impl ReadTxn, selector: GetProvider) -> Result<Provider> {
    let org = tx.organization_id().as_i64();
    let mut query = QueryBuilder::new(format!(
        "SELECT {PROVIDER_COLUMNS} FROM providers \
         WHERE deleted_at IS NULL AND organization_id = "
    ));
    query.push_bind(org);
    match selector {
        GetProvider::ById(id) => {
            query.push(" AND id = ").push_bind(id.as_i64());
        }
        GetProvider::ByName(name) => {
            query.push(" AND name = ").push_bind(name);
        }
    }
    query
        .build_query_as::<Provider>()
        .fetch_one(tx.conn())
        .await
        .map_err(|e| read_error(e, "provider"))
}

/// The organization's built-in local provider. Always exists.
pub async fn infra_provider(tx: &mut impl ReadTxn) -> Result<Provider> {
    let org = tx.organization_id().as_i64();
    sqlx::query_as::<_, Provider>(&format!(
        "SELECT {PROVIDER_COLUMNS} FROM providers \
         WHERE deleted_at IS NULL AND organization_id = $1 AND kind = 'infra'"
    ))
    .bind(org)
    .fetch_one(tx.conn())
    .await
    .map_err(|e| read_error(e, "provider"))
}

pub async fn list_providers(tx: &mut impl ReadTxn) -> Result<Vec<Provider>> {
    let org = tx.organization_id().as_i64();
    let providers = sqlx::query_as::<_, Provider>(&format!(
        "SELECT {PROVIDER_COLUMNS} FROM providers \
         WHERE deleted_at IS NULL AND organization_id = $1 ORDER BY id ASC"
    ))
    .bind(org)
    .fetch_all(tx.conn())
    .await?;
    Ok(providers)
}

/// Soft delete a provider. The built-in `infra` provider is load-bearing for
/// local credentials and refuses deletion.
pub async fn delete_provider(tx: &mut WriteTransaction, id: Id) -> Result<()> {
    let provider = get_provider(&mut *tx, GetProvider::ById(id)).await?;
    if provider.kind == ProviderKind::Infra {
        return Err(Error::field("id", "the infra provider cannot be deleted"));
    }
    sqlx::query(
        "UPDATE providers SET deleted_at = $1 \
         WHERE deleted_at IS NULL AND organization_id = $2 AND id = $3",
    )
    .bind(Utc::now())
    .bind(tx.organization_id().as_i64())
    .bind(id.as_i64())
    .execute(tx.conn())
    .await?;
    Ok(())
}
