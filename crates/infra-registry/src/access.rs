//! Grant evaluation: effective grants for a subject and the role projection
//! engines pull.
//!
//! Resolution always goes through [`crate::store::grants::list_grants`]; this
//! module adds the user+groups union, the destination scoping rules, and the
//! flattening of group subjects into user lists.

use std::collections::BTreeMap;

use infra_common::api::{ListRolesResponse, Role};
use infra_common::{Id, Subject};

use crate::error::Result;
use crate::store::grants::{list_grants, ListGrantsOptions};
use crate::store::models::Grant;
use crate::store::{groups, identities, ReadTxn};

/// Grants that apply to a user on one destination: the user's own grants
/// plus those of every group containing the user, restricted to resources
/// `D` or `D.*`, deduplicated by `(privilege, resource)`.
///
/// The reserved `(connector, infra)` grant is excluded unless
/// `include_connector` is set.
pub async fn effective_grants(
    tx: &mut impl ReadTxn,
    user_id: Id,
    destination: &str,
    include_connector: bool,
) -> Result<Vec<Grant>> {
    let page = list_grants(
        tx,
        ListGrantsOptions {
            by_subject: Some(Subject::user(user_id)),
            include_inherited_from_groups: true,
            by_destination: Some(destination.to_string()),
            exclude_connector_grant: !include_connector,
            ..Default::default()
        },
    )
    .await?;

    let mut seen = std::collections::HashSet::new();
    let mut grants = Vec::new();
    for grant in page.grants {
        if seen.insert((grant.privilege.clone(), grant.resource.clone())) {
            grants.push(grant);
        }
    }
    Ok(grants)
}

/// Roles projected onto a destination, with group subjects expanded to user
/// names, plus the update-index cursor for the next sync.
///
/// The role list is always the full desired state: engines reconcile
/// absolutely, and `since` only tells them whether anything changed. The
/// cursor covers soft-deleted grants so revocations advance it too.
pub async fn roles_for_destination(
    tx: &mut impl ReadTxn,
    destination: &str,
    since: i64,
) -> Result<ListRolesResponse> {
    let page = list_grants(
        &mut *tx,
        ListGrantsOptions {
            by_destination: Some(destination.to_string()),
            exclude_connector_grant: true,
            with_max_update_index: true,
            ..Default::default()
        },
    )
    .await?;
    let max_update_index = page.max_update_index.unwrap_or(0);
    if max_update_index <= since {
        return Ok(ListRolesResponse {
            roles: vec![],
            max_update_index,
        });
    }

    let mut expanded: Vec<(Grant, Vec<String>)> = Vec::with_capacity(page.grants.len());
    for grant in page.grants {
        let users = match grant.subject {
            Subject::User(user_id) => {
                match identities::get_identity(&mut *tx, identities::GetIdentity::ById(user_id))
                    .await
                {
                    Ok(identity) => vec![identity.name],
                    // A grant can outlive its user between delete cascades.
                    Err(crate::error::Error::NotFound { .. }) => vec![],
                    Err(err) => return Err(err),
                }
            }
            Subject::Group(group_id) => groups::members_of_group(&mut *tx, group_id)
                .await?
                .into_iter()
                .map(|identity| identity.name)
                .collect(),
        };
        expanded.push((grant, users));
    }

    Ok(ListRolesResponse {
        roles: project_roles(destination, expanded),
        max_update_index,
    })
}

/// Flatten (grant, users) pairs into deduplicated roles.
///
/// `resource = D` becomes a cluster-wide role; `resource = D.ns` scopes the
/// role to namespace `ns`. Identical `(privilege, namespace)` pairs merge
/// their user lists.
fn project_roles(destination: &str, expanded: Vec<(Grant, Vec<String>)>) -> Vec<Role> {
    let mut merged: BTreeMap<(String, Option<String>), std::collections::BTreeSet<String>> =
        BTreeMap::new();
    for (grant, users) in expanded {
        let namespace = namespace_of(&grant.resource, destination);
        merged
            .entry((grant.privilege, namespace))
            .or_default()
            .extend(users);
    }
    merged
        .into_iter()
        .map(|((name, namespace), users)| Role {
            name,
            namespace,
            users: users.into_iter().collect(),
        })
        .collect()
}

/// Namespace component of a destination-scoped resource, if any.
fn namespace_of(resource: &str, destination: &str) -> Option<String> {
    resource
        .strip_prefix(destination)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn grant(privilege: &str, resource: &str) -> Grant {
        Grant {
            id: Id::generate(),
            organization_id: Id::from(1),
            subject: Subject::user(Id::from(1)),
            privilege: privilege.into(),
            resource: resource.into(),
            created_by: Id::zero(),
            update_index: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn namespace_parsing() {
        assert_eq!(namespace_of("prod", "prod"), None);
        assert_eq!(namespace_of("prod.default", "prod"), Some("default".into()));
        assert_eq!(namespace_of("prod.", "prod"), None);
        // A different destination with a shared prefix is not a namespace.
        assert_eq!(namespace_of("production", "prod"), None);
    }

    #[test]
    fn project_merges_identical_roles() {
        let roles = project_roles(
            "prod",
            vec![
                (grant("view", "prod"), vec!["alice@x".into()]),
                (grant("view", "prod"), vec!["bob@x".into(), "alice@x".into()]),
                (grant("admin", "prod.kube-system"), vec!["carol@x".into()]),
            ],
        );
        assert_eq!(roles.len(), 2);

        let admin = roles.iter().find(|r| r.name == "admin").unwrap();
        assert_eq!(admin.namespace.as_deref(), Some("kube-system"));
        assert_eq!(admin.users, vec!["carol@x"]);

        let view = roles.iter().find(|r| r.name == "view").unwrap();
        assert_eq!(view.namespace, None);
        assert_eq!(view.users, vec!["alice@x", "bob@x"]);
    }

    #[test]
    fn project_keeps_roles_with_no_users() {
        let roles = project_roles("prod", vec![(grant("view", "prod"), vec![])]);
        assert_eq!(roles.len(), 1);
        assert!(roles[0].users.is_empty());
    }
}
