//! Relational persistence for the registry.
//!
//! Every read or write happens inside a transaction that carries the tenant's
//! `organization_id`. The per-entity modules only accept those transaction
//! types, so a query that forgets tenant scoping is unrepresentable at the
//! API boundary. Rows are soft-deleted: `deleted_at` is set and live-row
//! queries filter it out, while grant cursor computations deliberately read
//! deleted rows too.

use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};

use infra_common::Id;

use crate::error::{Error, Result};

pub mod access_keys;
pub mod destinations;
pub mod grants;
pub mod groups;
pub mod identities;
pub mod models;
pub mod organizations;
pub mod providers;
pub mod public_keys;
mod schema;

pub use models::{
    AccessKey, Destination, Grant, Group, Identity, Organization, Provider, ProviderKind,
    UserPublicKey,
};

/// Connection pool handle. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and run schema migration.
    pub async fn connect(url: &str) -> Result<Db> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(url)
            .await?;
        schema::migrate(&pool).await?;
        Ok(Db { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a read transaction scoped to one organization.
    pub async fn read(&self, organization_id: Id) -> Result<ReadTransaction> {
        let tx = self.pool.begin().await?;
        Ok(ReadTransaction {
            tx,
            organization_id,
        })
    }

    /// Begin a write transaction scoped to one organization.
    pub async fn write(&self, organization_id: Id) -> Result<WriteTransaction> {
        let tx = self.pool.begin().await?;
        Ok(WriteTransaction {
            tx,
            organization_id,
        })
    }
}

/// Read access to org-scoped state. Implemented by both transaction types so
/// query functions accept either.
pub trait ReadTxn: Send {
    fn conn(&mut self) -> &mut PgConnection;
    fn organization_id(&self) -> Id;
}

/// A read-only transaction. Rolls back on drop.
pub struct ReadTransaction {
    tx: Transaction<'static, Postgres>,
    organization_id: Id,
}

impl ReadTxn for ReadTransaction {
    fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    fn organization_id(&self) -> Id {
        self.organization_id
    }
}

/// A read-write transaction. Mutations are lost unless [`commit`] is called.
///
/// [`commit`]: WriteTransaction::commit
pub struct WriteTransaction {
    tx: Transaction<'static, Postgres>,
    organization_id: Id,
}

impl ReadTxn for WriteTransaction {
    fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    fn organization_id(&self) -> Id {
        self.organization_id
    }
}

impl WriteTransaction {
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// True when the error is a Postgres unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Map `RowNotFound` to the taxonomy's NotFound for the given entity kind.
pub(crate) fn read_error(err: sqlx::Error, kind: &'static str) -> Error {
    match err {
        sqlx::Error::RowNotFound => Error::not_found(kind),
        other => Error::Database(other),
    }
}
