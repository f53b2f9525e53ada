//! Organization (tenant) persistence.
//!
//! Organizations are the partition key for everything else, so their own
//! operations are the one place that works outside an org-scoped
//! transaction. Creating an organization also seeds the rows every tenant
//! must have: the built-in `infra` provider (exactly one per org, never
//! deletable), the reserved `connector` identity engines authenticate as,
//! and its `(connector, infra)` grant.

use chrono::Utc;

use infra_common::{
    Id, Subject, CONNECTOR_IDENTITY_NAME, CONNECTOR_PRIVILEGE, INFRA_RESOURCE,
};

use crate::error::{Error, Result};
use crate::store::models::{Grant, Identity, Organization, Provider, ProviderKind};
use crate::store::{
    grants, identities, is_unique_violation, providers, Db, ReadTxn, WriteTransaction,
};

pub async fn create_organization(db: &Db, name: &str) -> Result<Organization> {
    if name.is_empty() {
        return Err(Error::field("name", "is required"));
    }
    let now = Utc::now();
    let org = Organization {
        id: Id::generate(),
        name: name.to_string(),
        created_at: now,
        updated_at: now,
    };

    let mut tx = WriteTransaction {
        tx: db.pool().begin().await?,
        organization_id: org.id,
    };

    let inserted = sqlx::query(
        "INSERT INTO organizations (id, name, created_at, updated_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(org.id.as_i64())
    .bind(&org.name)
    .bind(org.created_at)
    .bind(org.updated_at)
    .execute(tx.conn())
    .await;
    match inserted {
        Ok(_) => {}
        Err(err) if is_unique_violation(&err) => return Err(Error::duplicate("organization")),
        Err(err) => return Err(err.into()),
    }

    // Seed the built-in provider and the engine identity.
    let mut infra = Provider {
        id: Id::generate(),
        organization_id: org.id,
        name: "infra".to_string(),
        kind: ProviderKind::Infra,
        issuer_url: None,
        client_id: None,
        client_secret: None,
        redirect_url: None,
        scopes: vec![],
        created_at: now,
        updated_at: now,
    };
    providers::create_provider(&mut tx, &mut infra).await?;

    let mut connector = Identity {
        id: Id::generate(),
        organization_id: org.id,
        name: CONNECTOR_IDENTITY_NAME.to_string(),
        last_seen_at: None,
        created_by: Id::zero(),
        verified: true,
        verification_token: None,
        ssh_login_name: None,
        password_hash: None,
        one_time_password: false,
        created_at: now,
        updated_at: now,
    };
    identities::create_identity(&mut tx, &mut connector).await?;

    let mut grant = Grant {
        id: Id::zero(),
        organization_id: org.id,
        subject: Subject::user(connector.id),
        privilege: CONNECTOR_PRIVILEGE.to_string(),
        resource: INFRA_RESOURCE.to_string(),
        created_by: Id::zero(),
        update_index: 0,
        created_at: now,
        updated_at: now,
    };
    grants::create_grant(&mut tx, &mut grant).await?;

    tx.commit().await?;
    Ok(org)
}

pub async fn get_organization_by_name(db: &Db, name: &str) -> Result<Organization> {
    sqlx::query_as::<_, Organization>(
        "SELECT id, name, created_at, updated_at FROM organizations \
         WHERE deleted_at IS NULL AND name = $1",
    )
    .bind(name)
    .fetch_one(db.pool())
    .await
    .map_err(|e| crate::store::read_error(e, "organization"))
}

/// Fetch the organization by name, creating it on first use.
pub async fn get_or_create_organization(db: &Db, name: &str) -> Result<Organization> {
    match get_organization_by_name(db, name).await {
        Ok(org) => Ok(org),
        Err(Error::NotFound { .. }) => create_organization(db, name).await,
        Err(err) => Err(err),
    }
}
