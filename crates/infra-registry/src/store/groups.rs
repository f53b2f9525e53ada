//! Group persistence and membership.
//!
//! Groups belong to exactly one provider. Memberships mirror whatever the
//! provider asserts: after each OIDC login the claimed set replaces the
//! recorded set for that provider, so removing someone upstream revokes the
//! inherited grants on the next login.

use chrono::Utc;
use sqlx::QueryBuilder;

use infra_common::{Id, Subject};

use crate::error::{Error, Result};
use crate::store::models::{Group, Identity};
use crate::store::{grants, is_unique_violation, read_error, ReadTxn, WriteTransaction};

const GROUP_COLUMNS: &str = "id, organization_id, provider_id, name, created_at, updated_at";

pub async fn create_group(tx: &mut WriteTransaction, group: &mut Group) -> Result<()> {
    if group.name.is_empty() {
        return Err(Error::field("name", "is required"));
    }
    if group.id.is_zero() {
        group.id = Id::generate();
    }
    let now = Utc::now();
    group.created_at = now;
    group.updated_at = now;
    group.organization_id = tx.organization_id();

    let inserted = sqlx::query(
        "INSERT INTO groups (id, organization_id, provider_id, name, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(group.id.as_i64())
    .bind(group.organization_id.as_i64())
    .bind(group.provider_id.as_i64())
    .bind(&group.name)
    .bind(group.created_at)
    .bind(group.updated_at)
    .execute(tx.conn())
    .await;
    match inserted {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(Error::duplicate("group")),
        Err(err) => Err(err.into()),
    }
}

/// Selector for [`get_group`].
#[derive(Debug, Clone)]
pub enum GetGroup {
    ById(Id),
    ByName { provider_id: Id, name: String },
}

pub async fn get_group(tx: &mut impl ReadTxn, selector: GetGroup) -> Result<Group> {
    let org = tx.organization_id().as_i64();
    let mut query = QueryBuilder::new(format!(
        "SELECT {GROUP_COLUMNS} FROM groups WHERE deleted_at IS NULL AND organization_id = "
    ));
    query.push_bind(org);
    match selector {
        GetGroup::ById(id) => {
            query.push(" AND id = ").push_bind(id.as_i64());
        }
        GetGroup::ByName { provider_id, name } => {
            query
                .push(" AND provider_id = ")
                .push_bind(provider_id.as_i64());
            query.push(" AND name = ").push_bind(name);
        }
    }
    query
        .build_query_as::<Group>()
        .fetch_one(tx.conn())
        .await
        .map_err(|e| read_error(e, "group"))
}

#[derive(Debug, Clone, Default)]
pub struct ListGroupsOptions {
    pub by_name: Option<String>,
    /// Only groups this user belongs to.
    pub by_member: Option<Id>,
    pub limit: Option<u32>,
    pub after: Option<Id>,
}

pub async fn list_groups(tx: &mut impl ReadTxn, opts: ListGroupsOptions) -> Result<Vec<Group>> {
    let org = tx.organization_id().as_i64();
    let mut query = QueryBuilder::new(format!(
        "SELECT {GROUP_COLUMNS} FROM groups WHERE deleted_at IS NULL AND organization_id = "
    ));
    query.push_bind(org);
    if let Some(name) = &opts.by_name {
        query.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(member) = opts.by_member {
        query
            .push(" AND id IN (SELECT group_id FROM identities_groups WHERE identity_id = ")
            .push_bind(member.as_i64());
        query.push(")");
    }
    if let Some(after) = opts.after {
        query.push(" AND id > ").push_bind(after.as_i64());
    }
    query.push(" ORDER BY id ASC");
    if let Some(limit) = opts.limit {
        query.push(" LIMIT ").push_bind(i64::from(limit));
    }
    let groups = query.build_query_as::<Group>().fetch_all(tx.conn()).await?;
    Ok(groups)
}

/// Soft delete a group and the grants held through it.
pub async fn delete_group(tx: &mut WriteTransaction, id: Id) -> Result<()> {
    get_group(&mut *tx, GetGroup::ById(id)).await?;

    grants::delete_grants(
        tx,
        grants::DeleteGrantsOptions {
            by_subject: Some(Subject::group(id)),
            ..Default::default()
        },
    )
    .await?;
    sqlx::query("DELETE FROM identities_groups WHERE group_id = $1")
        .bind(id.as_i64())
        .execute(tx.conn())
        .await?;
    sqlx::query(
        "UPDATE groups SET deleted_at = $1 \
         WHERE deleted_at IS NULL AND organization_id = $2 AND id = $3",
    )
    .bind(Utc::now())
    .bind(tx.organization_id().as_i64())
    .bind(id.as_i64())
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Ids of every live group the user belongs to.
pub async fn group_ids_for_user(tx: &mut impl ReadTxn, user_id: Id) -> Result<Vec<Id>> {
    let org = tx.organization_id().as_i64();
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT g.id FROM groups g \
         JOIN identities_groups ig ON ig.group_id = g.id \
         WHERE g.deleted_at IS NULL AND g.organization_id = $1 AND ig.identity_id = $2 \
         ORDER BY g.id",
    )
    .bind(org)
    .bind(user_id.as_i64())
    .fetch_all(tx.conn())
    .await?;
    Ok(ids.into_iter().map(Id::from).collect())
}

/// Live identities that are members of the group.
pub async fn members_of_group(tx: &mut impl ReadTxn, group_id: Id) -> Result<Vec<Identity>> {
    let org = tx.organization_id().as_i64();
    let members = sqlx::query_as::<_, Identity>(
        "SELECT i.id, i.organization_id, i.name, i.last_seen_at, i.created_by, i.verified, \
                i.verification_token, i.ssh_login_name, i.password_hash, i.one_time_password, \
                i.created_at, i.updated_at \
         FROM identities i \
         JOIN identities_groups ig ON ig.identity_id = i.id \
         WHERE i.deleted_at IS NULL AND i.organization_id = $1 AND ig.group_id = $2 \
         ORDER BY i.id",
    )
    .bind(org)
    .bind(group_id.as_i64())
    .fetch_all(tx.conn())
    .await?;
    Ok(members)
}

pub async fn add_group_member(tx: &mut WriteTransaction, group_id: Id, user_id: Id) -> Result<()> {
    sqlx::query(
        "INSERT INTO identities_groups (identity_id, group_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(user_id.as_i64())
    .bind(group_id.as_i64())
    .execute(tx.conn())
    .await?;
    Ok(())
}

pub async fn remove_group_member(
    tx: &mut WriteTransaction,
    group_id: Id,
    user_id: Id,
) -> Result<()> {
    sqlx::query("DELETE FROM identities_groups WHERE identity_id = $1 AND group_id = $2")
        .bind(user_id.as_i64())
        .bind(group_id.as_i64())
        .execute(tx.conn())
        .await?;
    Ok(())
}

/// Make the user's memberships within one provider exactly match `names`.
///
/// Groups named in the claim set are created on demand; memberships recorded
/// for this provider but absent from the claim set are removed. Groups from
/// other providers are untouched.
pub async fn sync_provider_groups(
    tx: &mut WriteTransaction,
    user_id: Id,
    provider_id: Id,
    names: &[String],
) -> Result<()> {
    let current = list_groups(
        &mut *tx,
        ListGroupsOptions {
            by_member: Some(user_id),
            ..Default::default()
        },
    )
    .await?;
    let current: Vec<Group> = current
        .into_iter()
        .filter(|g| g.provider_id == provider_id)
        .collect();

    for name in names {
        if current.iter().any(|g| &g.name == name) {
            continue;
        }
        let group = match get_group(
            &mut *tx,
            GetGroup::ByName {
                provider_id,
                name: name.clone(),
            },
        )
        .await
        {
            Ok(group) => group,
            Err(Error::NotFound { .. }) => {
                let mut group = Group {
                    id: Id::zero(),
                    organization_id: tx.organization_id(),
                    provider_id,
                    name: name.clone(),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                };
                create_group(tx, &mut group).await?;
                group
            }
            Err(err) => return Err(err),
        };
        add_group_member(tx, group.id, user_id).await?;
    }

    for group in &current {
        if !names.contains(&group.name) {
            remove_group_member(tx, group.id, user_id).await?;
        }
    }
    Ok(())
}
