//! Destination (registered cluster) persistence.
//!
//! Engines upsert their destination on every reconciliation heartbeat, so
//! the write path is keyed on `(organization_id, name)` rather than id.

use chrono::Utc;
use sqlx::QueryBuilder;

use infra_common::Id;

use crate::error::{Error, Result};
use crate::store::models::Destination;
use crate::store::{read_error, ReadTxn, WriteTransaction};

const DESTINATION_COLUMNS: &str =
    "id, organization_id, name, ca, endpoint, namespace, sa_token, created_at, updated_at";

/// Insert or refresh a destination registration. On conflict the existing
/// row's id is kept and written back into `destination`.
pub async fn upsert_destination(
    tx: &mut WriteTransaction,
    destination: &mut Destination,
) -> Result<()> {
    if destination.name.is_empty() {
        return Err(Error::field("name", "is required"));
    }
    match get_destination(&mut *tx, GetDestination::ByName(destination.name.clone())).await {
        Ok(existing) => {
            destination.id = existing.id;
            destination.created_at = existing.created_at;
            destination.updated_at = Utc::now();
            destination.organization_id = tx.organization_id();
            sqlx::query(
                "UPDATE destinations SET ca = $1, endpoint = $2, namespace = $3, sa_token = $4, \
                 updated_at = $5 \
                 WHERE deleted_at IS NULL AND organization_id = $6 AND id = $7",
            )
            .bind(&destination.ca)
            .bind(&destination.endpoint)
            .bind(&destination.namespace)
            .bind(&destination.sa_token)
            .bind(destination.updated_at)
            .bind(destination.organization_id.as_i64())
            .bind(destination.id.as_i64())
            .execute(tx.conn())
            .await?;
            Ok(())
        }
        Err(Error::NotFound { .. }) => {
            if destination.id.is_zero() {
                destination.id = Id::generate();
            }
            let now = Utc::now();
            destination.created_at = now;
            destination.updated_at = now;
            destination.organization_id = tx.organization_id();
            sqlx::query(
                "INSERT INTO destinations \
                 (id, organization_id, name, ca, endpoint, namespace, sa_token, created_at, \
                  updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(destination.id.as_i64())
            .bind(destination.organization_id.as_i64())
            .bind(&destination.name)
            .bind(&destination.ca)
            .bind(&destination.endpoint)
            .bind(&destination.namespace)
            .bind(&destination.sa_token)
            .bind(destination.created_at)
            .bind(destination.updated_at)
            .execute(tx.conn())
            .await?;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Selector for [`get_destination`].
#[derive(Debug, Clone)]
pub enum GetDestination {
    ById(Id),
    ByName(String),
}

pub async fn get_destination(
    tx: &mut impl ReadTxn,
    selector: GetDestination,
) -> Result<Destination> {
    let org = tx.organization_id().as_i64();
    let mut query = QueryBuilder::new(format!(
        "SELECT {DESTINATION_COLUMNS} FROM destinations \
         WHERE deleted_at IS NULL AND organization_id = "
    ));
    query.push_bind(org);
    match selector {
        GetDestination::ById(id) => {
            query.push(" AND id = ").push_bind(id.as_i64());
        }
        GetDestination::ByName(name) => {
            query.push(" AND name = ").push_bind(name);
        }
    }
    query
        .build_query_as::<Destination>()
        .fetch_one(tx.conn())
        .await
        .map_err(|e| read_error(e, "destination"))
}

pub async fn list_destinations(tx: &mut impl ReadTxn) -> Result<Vec<Destination>> {
    let org = tx.organization_id().as_i64();
    let destinations = sqlx::query_as::<_, Destination>(&format!(
        "SELECT {DESTINATION_COLUMNS} FROM destinations \
         WHERE deleted_at IS NULL AND organization_id = $1 ORDER BY id ASC"
    ))
    .bind(org)
    .fetch_all(tx.conn())
    .await?;
    Ok(destinations)
}

pub async fn delete_destination(tx: &mut WriteTransaction, id: Id) -> Result<()> {
    get_destination(&mut *tx, GetDestination::ById(id)).await?;
    sqlx::query(
        "UPDATE destinations SET deleted_at = $1 \
         WHERE deleted_at IS NULL AND organization_id = $2 AND id = $3",
    )
    .bind(Utc::now())
    .bind(tx.organization_id().as_i64())
    .bind(id.as_i64())
    .execute(tx.conn())
    .await?;
    Ok(())
}
