//! Grant persistence.
//!
//! Grants are the `(subject, privilege, resource)` authorization facts. Two
//! properties matter here beyond plain CRUD:
//!
//! - every insert and soft delete draws `nextval('seq_update_index')` in the
//!   same statement, so the cursor advances atomically with the mutation;
//! - the duplicate check relies on the partial unique index over live rows,
//!   with a savepoint around the insert so an outer transaction survives the
//!   conflict.

use chrono::Utc;
use sqlx::{Acquire, QueryBuilder};

use infra_common::{Id, Subject};

use crate::error::{Error, Result};
use crate::store::groups::group_ids_for_user;
use crate::store::models::Grant;
use crate::store::{is_unique_violation, read_error, ReadTxn, WriteTransaction};

const GRANT_COLUMNS: &str =
    "id, organization_id, subject, privilege, resource, created_by, update_index, \
     created_at, updated_at";

/// Insert a grant, drawing a fresh update index.
///
/// On a duplicate live `(subject, privilege, resource)` the insert is rolled
/// back to a savepoint and [`Error::Duplicate`] is returned; the caller's
/// transaction remains usable.
pub async fn create_grant(tx: &mut WriteTransaction, grant: &mut Grant) -> Result<()> {
    if grant.privilege.is_empty() {
        return Err(Error::field("privilege", "is required"));
    }
    if grant.resource.is_empty() {
        return Err(Error::field("resource", "is required"));
    }

    if grant.id.is_zero() {
        grant.id = Id::generate();
    }
    let now = Utc::now();
    grant.created_at = now;
    grant.updated_at = now;
    grant.organization_id = tx.organization_id();

    // Savepoint around the insert (sqlx nests transactions as savepoints):
    // the caller may be inside a larger transaction that must survive the
    // unique-conflict error.
    let mut savepoint = tx.conn().begin().await?;

    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO grants \
         (id, organization_id, subject, privilege, resource, created_by, update_index, \
          created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, nextval('seq_update_index'), $7, $8) \
         RETURNING update_index",
    )
    .bind(grant.id.as_i64())
    .bind(grant.organization_id.as_i64())
    .bind(grant.subject.to_string())
    .bind(&grant.privilege)
    .bind(&grant.resource)
    .bind(grant.created_by.as_i64())
    .bind(grant.created_at)
    .bind(grant.updated_at)
    .fetch_one(&mut *savepoint)
    .await;

    match inserted {
        Ok(update_index) => {
            savepoint.commit().await?;
            grant.update_index = update_index;
            Ok(())
        }
        Err(err) if is_unique_violation(&err) => {
            savepoint.rollback().await?;
            Err(Error::duplicate("grant"))
        }
        Err(err) => Err(err.into()),
    }
}

/// Selector for [`get_grant`].
#[derive(Debug, Clone)]
pub enum GetGrant {
    ById(Id),
    BySpec {
        subject: Subject,
        privilege: String,
        resource: String,
    },
}

pub async fn get_grant(tx: &mut impl ReadTxn, selector: GetGrant) -> Result<Grant> {
    let org = tx.organization_id().as_i64();
    let mut query = QueryBuilder::new(format!(
        "SELECT {GRANT_COLUMNS} FROM grants \
         WHERE deleted_at IS NULL AND organization_id = "
    ));
    query.push_bind(org);

    match selector {
        GetGrant::ById(id) => {
            query.push(" AND id = ").push_bind(id.as_i64());
        }
        GetGrant::BySpec {
            subject,
            privilege,
            resource,
        } => {
            query.push(" AND subject = ").push_bind(subject.to_string());
            query.push(" AND privilege = ").push_bind(privilege);
            query.push(" AND resource = ").push_bind(resource);
        }
    }

    query
        .build_query_as::<Grant>()
        .fetch_one(tx.conn())
        .await
        .map_err(|e| read_error(e, "grant"))
}

#[derive(Debug, Clone, Default)]
pub struct ListGrantsOptions {
    pub by_subject: Option<Subject>,
    /// When set with a user subject, the subject filter becomes the user plus
    /// every group the user belongs to.
    pub include_inherited_from_groups: bool,
    pub by_privileges: Vec<String>,
    pub by_resource: Option<String>,
    /// Matches `resource = D` or `resource LIKE 'D.%'` for namespace scoping.
    pub by_destination: Option<String>,
    /// Drop the reserved `(connector, infra)` engine grant.
    pub exclude_connector_grant: bool,
    /// Only rows with `update_index > since`.
    pub since: Option<i64>,
    pub limit: Option<u32>,
    pub after: Option<Id>,
    /// Also compute the max update index over matching rows, including
    /// soft-deleted ones, for change cursoring.
    pub with_max_update_index: bool,
}

#[derive(Debug, Clone)]
pub struct GrantsPage {
    pub grants: Vec<Grant>,
    /// Present when requested. Reflects deleted rows, so deletes move it.
    pub max_update_index: Option<i64>,
}

pub async fn list_grants(tx: &mut impl ReadTxn, opts: ListGrantsOptions) -> Result<GrantsPage> {
    let org = tx.organization_id().as_i64();

    // Group expansion needs its own query; run it before the builder borrows
    // the connection.
    let mut subjects: Option<Vec<String>> = None;
    if let Some(subject) = opts.by_subject {
        if opts.include_inherited_from_groups {
            let user_id = subject.user_id().ok_or_else(|| {
                Error::field("subject", "group inheritance requires a user subject")
            })?;
            let mut expanded = vec![subject.to_string()];
            for group_id in group_ids_for_user(&mut *tx, user_id).await? {
                expanded.push(Subject::group(group_id).to_string());
            }
            subjects = Some(expanded);
        } else {
            subjects = Some(vec![subject.to_string()]);
        }
    }

    let mut query = QueryBuilder::new(format!(
        "SELECT {GRANT_COLUMNS} FROM grants \
         WHERE deleted_at IS NULL AND organization_id = "
    ));
    query.push_bind(org);

    if let Some(subjects) = &subjects {
        query.push(" AND subject IN (");
        let mut sep = query.separated(", ");
        for subject in subjects {
            sep.push_bind(subject.clone());
        }
        query.push(")");
    }
    if !opts.by_privileges.is_empty() {
        query.push(" AND privilege IN (");
        let mut sep = query.separated(", ");
        for privilege in &opts.by_privileges {
            sep.push_bind(privilege.clone());
        }
        query.push(")");
    }
    if let Some(resource) = &opts.by_resource {
        query.push(" AND resource = ").push_bind(resource.clone());
    }
    if let Some(destination) = &opts.by_destination {
        query.push(" AND (resource = ").push_bind(destination.clone());
        query
            .push(" OR resource LIKE ")
            .push_bind(format!("{destination}.%"));
        query.push(")");
    }
    if opts.exclude_connector_grant {
        query.push(" AND NOT (privilege = 'connector' AND resource = 'infra')");
    }
    if let Some(since) = opts.since {
        query.push(" AND update_index > ").push_bind(since);
    }
    if let Some(after) = opts.after {
        query.push(" AND id > ").push_bind(after.as_i64());
    }
    query.push(" ORDER BY id ASC");
    if let Some(limit) = opts.limit {
        query.push(" LIMIT ").push_bind(i64::from(limit));
    }

    let grants = query.build_query_as::<Grant>().fetch_all(tx.conn()).await?;

    let max_update_index = if opts.with_max_update_index {
        Some(
            max_update_index(
                tx,
                opts.by_resource.as_deref(),
                opts.by_destination.as_deref(),
            )
            .await?,
        )
    } else {
        None
    };

    Ok(GrantsPage {
        grants,
        max_update_index,
    })
}

/// Max update index over grants matching the resource filters.
///
/// Must include soft-deleted rows: a cursor that skipped deletions would
/// leave consumers holding bindings for revoked grants.
async fn max_update_index(
    tx: &mut impl ReadTxn,
    by_resource: Option<&str>,
    by_destination: Option<&str>,
) -> Result<i64> {
    let org = tx.organization_id().as_i64();
    let mut query =
        QueryBuilder::new("SELECT COALESCE(max(update_index), 0) FROM grants WHERE organization_id = ");
    query.push_bind(org);
    if let Some(resource) = by_resource {
        query.push(" AND resource = ").push_bind(resource.to_string());
    }
    if let Some(destination) = by_destination {
        query
            .push(" AND (resource = ")
            .push_bind(destination.to_string());
        query
            .push(" OR resource LIKE ")
            .push_bind(format!("{destination}.%"));
        query.push(")");
    }
    let max: i64 = query.build_query_scalar().fetch_one(tx.conn()).await?;
    Ok(max)
}

#[derive(Debug, Clone, Default)]
pub struct DeleteGrantsOptions {
    /// Delete one grant by id; other selectors are ignored.
    pub by_id: Option<Id>,
    /// Delete every grant with this subject.
    pub by_subject: Option<Subject>,
    /// Delete grants created by this user, except `not_ids`.
    pub by_created_by: Option<Id>,
    pub not_ids: Vec<Id>,
}

/// Soft delete matching grants; each row draws a fresh update index.
pub async fn delete_grants(tx: &mut WriteTransaction, opts: DeleteGrantsOptions) -> Result<()> {
    let org = tx.organization_id().as_i64();
    let mut query = QueryBuilder::new(
        "UPDATE grants SET deleted_at = ",
    );
    query.push_bind(Utc::now());
    query.push(", update_index = nextval('seq_update_index') WHERE organization_id = ");
    query.push_bind(org);
    query.push(" AND deleted_at IS NULL AND ");

    if let Some(id) = opts.by_id {
        query.push("id = ").push_bind(id.as_i64());
    } else if let Some(subject) = opts.by_subject {
        query.push("subject = ").push_bind(subject.to_string());
    } else if let Some(created_by) = opts.by_created_by {
        query.push("created_by = ").push_bind(created_by.as_i64());
        if !opts.not_ids.is_empty() {
            query.push(" AND id NOT IN (");
            let mut sep = query.separated(", ");
            for id in &opts.not_ids {
                sep.push_bind(id.as_i64());
            }
            query.push(")");
        }
    } else {
        return Err(Error::field("id", "a delete selector is required"));
    }

    query.build().execute(tx.conn()).await?;
    Ok(())
}
