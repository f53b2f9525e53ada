//! Cluster introspection and RBAC projection.
//!
//! `update_roles` is the write half of reconciliation: it owns every
//! RoleBinding and ClusterRoleBinding labelled as Infra-managed, computes
//! the diff against the desired set, and applies it. The diff itself is a
//! pure function so idempotence is testable without a cluster.
//!
//! Cluster facts (CA bundle, endpoint, namespace, service-account token)
//! come from the in-cluster mounts behind a trait seam so the reconciler can
//! run against mocks in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info, warn};

use infra_common::api::Role;

use crate::error::{Error, Result};

/// Label identifying bindings this engine owns.
pub const MANAGED_LABEL: &str = "app.infrahq.com/managed";

/// Field manager for server-side apply.
const FIELD_MANAGER: &str = "infra-engine";

/// Path of the mounted service-account token.
const SA_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Path of the mounted cluster CA bundle.
const CA_CERT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Path of the mounted namespace.
const NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Facts the engine reports about its own cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterInfo: Send + Sync {
    /// PEM bundle for the API server.
    async fn ca(&self) -> Result<String>;
    /// API server endpoint, host:port.
    async fn endpoint(&self) -> Result<String>;
    /// Namespace the engine runs in.
    async fn namespace(&self) -> Result<String>;
    /// The engine's service-account token.
    async fn sa_token(&self) -> Result<String>;
}

/// [`ClusterInfo`] backed by the standard in-cluster mounts.
#[derive(Clone, Default)]
pub struct InClusterInfo;

async fn read_mount(path: &str) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::config(format!("failed to read {path}: {e}")))
}

#[async_trait]
impl ClusterInfo for InClusterInfo {
    async fn ca(&self) -> Result<String> {
        read_mount(CA_CERT_PATH).await
    }

    async fn endpoint(&self) -> Result<String> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::config("KUBERNETES_SERVICE_HOST is not set"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        Ok(format!("{host}:{port}"))
    }

    async fn namespace(&self) -> Result<String> {
        Ok(read_mount(NAMESPACE_PATH).await?.trim().to_string())
    }

    async fn sa_token(&self) -> Result<String> {
        Ok(read_mount(SA_TOKEN_PATH).await?.trim().to_string())
    }
}

/// One binding the engine wants to exist, in diffable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Object name, `infra-<role>`.
    pub name: String,
    /// Namespace for RoleBindings; `None` means a ClusterRoleBinding.
    pub namespace: Option<String>,
    /// ClusterRole the binding grants.
    pub role: String,
    /// User subjects, sorted.
    pub users: Vec<String>,
}

/// Desired bindings for the destination's current roles.
pub fn desired_bindings(roles: &[Role]) -> Vec<Binding> {
    roles
        .iter()
        .map(|role| {
            let mut users = role.users.clone();
            users.sort();
            users.dedup();
            Binding {
                name: format!("infra-{}", role.name),
                namespace: role.namespace.clone(),
                role: role.name.clone(),
                users,
            }
        })
        .collect()
}

/// Diff between what exists and what should exist.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BindingChanges {
    pub apply: Vec<Binding>,
    pub delete: Vec<(Option<String>, String)>,
}

impl BindingChanges {
    pub fn is_empty(&self) -> bool {
        self.apply.is_empty() && self.delete.is_empty()
    }
}

/// Compute the changes turning `existing` into `desired`.
///
/// Bindings present in both but with differing users or role are re-applied;
/// bindings absent from `desired` are deleted. Applying the result and
/// diffing again yields no changes.
pub fn diff_bindings(existing: &[Binding], desired: &[Binding]) -> BindingChanges {
    let existing_by_key: BTreeMap<(Option<String>, String), &Binding> = existing
        .iter()
        .map(|b| ((b.namespace.clone(), b.name.clone()), b))
        .collect();
    let desired_keys: std::collections::BTreeSet<(Option<String>, String)> = desired
        .iter()
        .map(|b| (b.namespace.clone(), b.name.clone()))
        .collect();

    let mut changes = BindingChanges::default();
    for binding in desired {
        match existing_by_key.get(&(binding.namespace.clone(), binding.name.clone())) {
            Some(current) if *current == binding => {}
            _ => changes.apply.push(binding.clone()),
        }
    }
    for binding in existing {
        let key = (binding.namespace.clone(), binding.name.clone());
        if !desired_keys.contains(&key) {
            changes.delete.push(key);
        }
    }
    changes
}

fn managed_metadata(binding: &Binding) -> ObjectMeta {
    ObjectMeta {
        name: Some(binding.name.clone()),
        namespace: binding.namespace.clone(),
        labels: Some(BTreeMap::from([(
            MANAGED_LABEL.to_string(),
            "true".to_string(),
        )])),
        ..Default::default()
    }
}

fn user_subjects(binding: &Binding) -> Option<Vec<Subject>> {
    Some(
        binding
            .users
            .iter()
            .map(|user| Subject {
                kind: "User".to_string(),
                name: user.clone(),
                api_group: Some("rbac.authorization.k8s.io".to_string()),
                namespace: None,
            })
            .collect(),
    )
}

fn role_ref(binding: &Binding) -> RoleRef {
    RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: "ClusterRole".to_string(),
        name: binding.role.clone(),
    }
}

fn to_role_binding(binding: &Binding) -> RoleBinding {
    RoleBinding {
        metadata: managed_metadata(binding),
        role_ref: role_ref(binding),
        subjects: user_subjects(binding),
    }
}

fn to_cluster_role_binding(binding: &Binding) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: managed_metadata(binding),
        role_ref: role_ref(binding),
        subjects: user_subjects(binding),
    }
}

fn from_role_binding(rb: &RoleBinding) -> Binding {
    let mut users: Vec<String> = rb
        .subjects
        .iter()
        .flatten()
        .filter(|s| s.kind == "User")
        .map(|s| s.name.clone())
        .collect();
    users.sort();
    users.dedup();
    Binding {
        name: rb.metadata.name.clone().unwrap_or_default(),
        namespace: rb.metadata.namespace.clone(),
        role: rb.role_ref.name.clone(),
        users,
    }
}

fn from_cluster_role_binding(crb: &ClusterRoleBinding) -> Binding {
    let mut users: Vec<String> = crb
        .subjects
        .iter()
        .flatten()
        .filter(|s| s.kind == "User")
        .map(|s| s.name.clone())
        .collect();
    users.sort();
    users.dedup();
    Binding {
        name: crb.metadata.name.clone().unwrap_or_default(),
        namespace: None,
        role: crb.role_ref.name.clone(),
        users,
    }
}

/// Reconcile the cluster's Infra-owned bindings to match `roles`.
///
/// Idempotent: a second call with the same roles applies nothing. Partial
/// failures are logged and skipped; the next tick retries from scratch
/// because the registry holds the canonical state.
pub async fn update_roles(client: &Client, roles: &[Role]) -> Result<()> {
    let selector = format!("{MANAGED_LABEL}=true");
    let params = ListParams::default().labels(&selector);

    let role_bindings: Api<RoleBinding> = Api::all(client.clone());
    let cluster_role_bindings: Api<ClusterRoleBinding> = Api::all(client.clone());

    let mut existing: Vec<Binding> = role_bindings
        .list(&params)
        .await?
        .items
        .iter()
        .map(from_role_binding)
        .collect();
    existing.extend(
        cluster_role_bindings
            .list(&params)
            .await?
            .items
            .iter()
            .map(from_cluster_role_binding),
    );

    let desired = desired_bindings(roles);
    let changes = diff_bindings(&existing, &desired);
    if changes.is_empty() {
        debug!("role bindings already match");
        return Ok(());
    }
    info!(
        apply = changes.apply.len(),
        delete = changes.delete.len(),
        "updating role bindings"
    );

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    for binding in &changes.apply {
        let outcome = match &binding.namespace {
            Some(namespace) => {
                let api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
                api.patch(
                    &binding.name,
                    &patch_params,
                    &Patch::Apply(&to_role_binding(binding)),
                )
                .await
                .map(|_| ())
            }
            None => cluster_role_bindings
                .patch(
                    &binding.name,
                    &patch_params,
                    &Patch::Apply(&to_cluster_role_binding(binding)),
                )
                .await
                .map(|_| ()),
        };
        if let Err(err) = outcome {
            warn!(binding = %binding.name, error = %err, "failed to apply binding");
        }
    }

    for (namespace, name) in &changes.delete {
        let outcome = match namespace {
            Some(namespace) => {
                let api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
                api.delete(name, &DeleteParams::default()).await.map(|_| ())
            }
            None => cluster_role_bindings
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        };
        if let Err(err) = outcome {
            warn!(binding = %name, error = %err, "failed to delete binding");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(name: &str, namespace: Option<&str>, users: &[&str]) -> Role {
        Role {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            users: users.iter().map(|u| u.to_string()).collect(),
        }
    }

    /// Apply `changes` to `existing`, mirroring what the cluster would hold
    /// afterwards.
    fn apply_changes(existing: &[Binding], changes: &BindingChanges) -> Vec<Binding> {
        let mut state: BTreeMap<(Option<String>, String), Binding> = existing
            .iter()
            .map(|b| ((b.namespace.clone(), b.name.clone()), b.clone()))
            .collect();
        for binding in &changes.apply {
            state.insert((binding.namespace.clone(), binding.name.clone()), binding.clone());
        }
        for key in &changes.delete {
            state.remove(key);
        }
        state.into_values().collect()
    }

    #[test]
    fn fresh_cluster_creates_everything() {
        let desired = desired_bindings(&[
            role("view", None, &["alice@x"]),
            role("edit", Some("team-a"), &["bob@x"]),
        ]);
        let changes = diff_bindings(&[], &desired);
        assert_eq!(changes.apply.len(), 2);
        assert!(changes.delete.is_empty());
    }

    #[test]
    fn update_roles_diff_is_idempotent() {
        let desired = desired_bindings(&[
            role("view", None, &["alice@x", "bob@x"]),
            role("admin", Some("kube-system"), &["carol@x"]),
        ]);

        let first = diff_bindings(&[], &desired);
        let state = apply_changes(&[], &first);
        let second = diff_bindings(&state, &desired);
        assert!(second.is_empty(), "second diff should be a no-op: {second:?}");
    }

    #[test]
    fn user_list_changes_reapply_the_binding() {
        let before = desired_bindings(&[role("view", None, &["alice@x"])]);
        let state = apply_changes(&[], &diff_bindings(&[], &before));

        let after = desired_bindings(&[role("view", None, &["alice@x", "bob@x"])]);
        let changes = diff_bindings(&state, &after);
        assert_eq!(changes.apply.len(), 1);
        assert_eq!(changes.apply[0].users, vec!["alice@x", "bob@x"]);
        assert!(changes.delete.is_empty());
    }

    #[test]
    fn removed_roles_are_deleted() {
        let before = desired_bindings(&[
            role("view", None, &["alice@x"]),
            role("edit", Some("team-a"), &["bob@x"]),
        ]);
        let state = apply_changes(&[], &diff_bindings(&[], &before));

        let after = desired_bindings(&[role("view", None, &["alice@x"])]);
        let changes = diff_bindings(&state, &after);
        assert!(changes.apply.is_empty());
        assert_eq!(
            changes.delete,
            vec![(Some("team-a".to_string()), "infra-edit".to_string())]
        );
    }

    #[test]
    fn duplicate_users_collapse() {
        let bindings = desired_bindings(&[role("view", None, &["a@x", "a@x", "b@x"])]);
        assert_eq!(bindings[0].users, vec!["a@x", "b@x"]);
    }

    #[test]
    fn round_trip_through_k8s_objects() {
        let binding = Binding {
            name: "infra-view".into(),
            namespace: Some("team-a".into()),
            role: "view".into(),
            users: vec!["alice@x".into()],
        };
        assert_eq!(from_role_binding(&to_role_binding(&binding)), binding);

        let cluster = Binding {
            name: "infra-admin".into(),
            namespace: None,
            role: "admin".into(),
            users: vec!["carol@x".into()],
        };
        assert_eq!(
            from_cluster_role_binding(&to_cluster_role_binding(&cluster)),
            cluster
        );
    }
}
