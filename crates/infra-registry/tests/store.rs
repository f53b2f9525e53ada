//! Store integration tests.
//!
//! These run against a live PostgreSQL pointed to by
//! `INFRA_TEST_DATABASE_URL` and skip themselves when it is unset. Every
//! test creates its own organization, so runs are isolated and the database
//! can be reused.

use chrono::{Duration, Utc};

use infra_common::{Id, Subject, CONNECTOR_IDENTITY_NAME};
use infra_registry::access;
use infra_registry::config;
use infra_registry::error::Error;
use infra_registry::store::access_keys::{
    create_access_key, get_access_key, new_access_key, validate_access_key, GetAccessKey,
};
use infra_registry::store::grants::{
    create_grant, delete_grants, list_grants, DeleteGrantsOptions, GetGrant, ListGrantsOptions,
};
use infra_registry::store::groups::{
    add_group_member, create_group, group_ids_for_user, list_groups, sync_provider_groups,
    ListGroupsOptions,
};
use infra_registry::store::identities::{
    create_identity, delete_identity, get_identity, GetIdentity,
};
use infra_registry::store::destinations::{upsert_destination, GetDestination};
use infra_registry::store::models::{Destination, Grant, Group, Identity};
use infra_registry::store::organizations::create_organization;
use infra_registry::store::providers::{delete_provider, infra_provider};
use infra_registry::store::{grants, Db, Organization};

async fn test_db() -> Option<Db> {
    let Ok(url) = std::env::var("INFRA_TEST_DATABASE_URL") else {
        eprintln!("skipping: INFRA_TEST_DATABASE_URL is not set");
        return None;
    };
    Some(Db::connect(&url).await.expect("database connection"))
}

async fn test_org(db: &Db) -> Organization {
    let name = format!("test-{}", Id::generate());
    create_organization(db, &name).await.expect("organization")
}

fn user(name: &str) -> Identity {
    Identity {
        id: Id::zero(),
        organization_id: Id::zero(),
        name: name.to_string(),
        last_seen_at: None,
        created_by: Id::zero(),
        verified: false,
        verification_token: None,
        ssh_login_name: None,
        password_hash: None,
        one_time_password: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn grant(subject: Subject, privilege: &str, resource: &str) -> Grant {
    Grant {
        id: Id::zero(),
        organization_id: Id::zero(),
        subject,
        privilege: privilege.to_string(),
        resource: resource.to_string(),
        created_by: Id::zero(),
        update_index: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn create_and_validate_access_key() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let mut jerry = user("jerry@x");
    create_identity(&mut tx, &mut jerry).await.unwrap();
    let provider = infra_provider(&mut tx).await.unwrap();

    let mut key = new_access_key(jerry.id, provider.id);
    let token = create_access_key(&mut tx, &mut key).await.unwrap();
    tx.commit().await.unwrap();

    let (key_id, secret) = token.split_once('.').unwrap();
    assert_eq!(key_id.len(), 10);
    assert_eq!(secret.len(), 24);

    let (validated, identity) = validate_access_key(&db, &token).await.unwrap();
    assert_eq!(identity.name, "jerry@x");
    assert_eq!(validated.issued_for, jerry.id);

    // Same key id, wrong secret.
    let forged = format!("{key_id}.{}", "Z".repeat(24));
    let err = validate_access_key(&db, &forged).await.unwrap_err();
    assert!(matches!(err, Error::AccessKeyInvalidSecret), "{err:?}");

    // Unknown key id.
    let unknown = format!("{}.{}", "A".repeat(10), "Z".repeat(24));
    let err = validate_access_key(&db, &unknown).await.unwrap_err();
    assert!(matches!(err, Error::AccessKeyNotFound), "{err:?}");
}

#[tokio::test]
async fn expired_access_key_is_rejected() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let mut walle = user("wall-e@x");
    create_identity(&mut tx, &mut walle).await.unwrap();
    let provider = infra_provider(&mut tx).await.unwrap();

    let mut key = new_access_key(walle.id, provider.id);
    key.expires_at = Utc::now() - Duration::hours(1);
    let token = create_access_key(&mut tx, &mut key).await.unwrap();
    tx.commit().await.unwrap();

    let err = validate_access_key(&db, &token).await.unwrap_err();
    assert!(matches!(err, Error::AccessKeyExpired), "{err:?}");
}

#[tokio::test]
async fn access_key_past_extension_deadline_is_rejected() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let mut eve = user("eve@x");
    create_identity(&mut tx, &mut eve).await.unwrap();
    let provider = infra_provider(&mut tx).await.unwrap();

    let mut key = new_access_key(eve.id, provider.id);
    key.expires_at = Utc::now() + Duration::hours(1);
    key.extension_deadline = Some(Utc::now() - Duration::hours(1));
    let token = create_access_key(&mut tx, &mut key).await.unwrap();
    tx.commit().await.unwrap();

    let err = validate_access_key(&db, &token).await.unwrap_err();
    assert!(matches!(err, Error::AccessKeyDeadlineExceeded), "{err:?}");
}

#[tokio::test]
async fn validation_slides_the_extension_deadline() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let mut ann = user("ann@x");
    create_identity(&mut tx, &mut ann).await.unwrap();
    let provider = infra_provider(&mut tx).await.unwrap();

    let mut key = new_access_key(ann.id, provider.id);
    key.expires_at = Utc::now() + Duration::hours(12);
    key.extension = Some(Duration::hours(3));
    key.extension_deadline = Some(Utc::now() + Duration::minutes(1));
    let token = create_access_key(&mut tx, &mut key).await.unwrap();
    tx.commit().await.unwrap();

    validate_access_key(&db, &token).await.unwrap();

    let mut tx = db.read(org.id).await.unwrap();
    let stored = get_access_key(&mut tx, GetAccessKey::ById(key.id)).await.unwrap();
    let deadline = stored.extension_deadline.unwrap();
    assert!(deadline > Utc::now() + Duration::hours(2));
    assert!(deadline <= stored.expires_at);
}

#[tokio::test]
async fn stored_access_keys_have_no_secret() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let mut sam = user("sam@x");
    create_identity(&mut tx, &mut sam).await.unwrap();
    let provider = infra_provider(&mut tx).await.unwrap();
    let mut key = new_access_key(sam.id, provider.id);
    create_access_key(&mut tx, &mut key).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = db.read(org.id).await.unwrap();
    let stored = get_access_key(&mut tx, GetAccessKey::ById(key.id)).await.unwrap();
    assert_eq!(stored.secret, "");
    assert!(!stored.secret_checksum.is_empty());
    // Default name derives from the issued-for identity and the key id.
    assert_eq!(stored.name, format!("sam@x-{}", stored.key_id));
}

#[tokio::test]
async fn duplicate_grants_conflict_until_deleted() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let mut u = user("dup@x");
    create_identity(&mut tx, &mut u).await.unwrap();

    let mut first = grant(Subject::user(u.id), "view", "prod");
    create_grant(&mut tx, &mut first).await.unwrap();

    let mut second = grant(Subject::user(u.id), "view", "prod");
    let err = create_grant(&mut tx, &mut second).await.unwrap_err();
    assert!(matches!(err, Error::Duplicate { .. }), "{err:?}");

    // The savepoint keeps the transaction usable after the conflict.
    let mut third = grant(Subject::user(u.id), "admin", "prod");
    create_grant(&mut tx, &mut third).await.unwrap();

    delete_grants(
        &mut tx,
        DeleteGrantsOptions {
            by_id: Some(first.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // Non-deleted uniqueness only: the pair can exist again.
    let mut again = grant(Subject::user(u.id), "view", "prod");
    create_grant(&mut tx, &mut again).await.unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn update_index_is_monotonic_and_observes_deletes() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let mut u = user("mono@x");
    create_identity(&mut tx, &mut u).await.unwrap();

    let mut g1 = grant(Subject::user(u.id), "view", "mono-dest");
    create_grant(&mut tx, &mut g1).await.unwrap();
    let mut g2 = grant(Subject::user(u.id), "edit", "mono-dest");
    create_grant(&mut tx, &mut g2).await.unwrap();
    assert!(g1.update_index < g2.update_index);

    delete_grants(
        &mut tx,
        DeleteGrantsOptions {
            by_id: Some(g1.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let page = list_grants(
        &mut tx,
        ListGrantsOptions {
            by_destination: Some("mono-dest".to_string()),
            with_max_update_index: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let after_delete = page.max_update_index.unwrap();
    assert!(
        after_delete > g2.update_index,
        "the soft delete must advance the cursor"
    );

    let mut g3 = grant(Subject::user(u.id), "admin", "mono-dest");
    create_grant(&mut tx, &mut g3).await.unwrap();
    assert!(g3.update_index > after_delete);
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn grants_inherited_from_groups() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let mut u = user("u@x");
    create_identity(&mut tx, &mut u).await.unwrap();
    let provider = infra_provider(&mut tx).await.unwrap();

    let mut devs = Group {
        id: Id::zero(),
        organization_id: org.id,
        provider_id: provider.id,
        name: "devs".to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    create_group(&mut tx, &mut devs).await.unwrap();
    add_group_member(&mut tx, devs.id, u.id).await.unwrap();

    let mut direct = grant(Subject::user(u.id), "view", "prod");
    create_grant(&mut tx, &mut direct).await.unwrap();
    let mut inherited = grant(Subject::group(devs.id), "admin", "prod");
    create_grant(&mut tx, &mut inherited).await.unwrap();

    let with_groups = list_grants(
        &mut tx,
        ListGrantsOptions {
            by_subject: Some(Subject::user(u.id)),
            include_inherited_from_groups: true,
            by_destination: Some("prod".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(with_groups.grants.len(), 2);

    let direct_only = list_grants(
        &mut tx,
        ListGrantsOptions {
            by_subject: Some(Subject::user(u.id)),
            by_destination: Some("prod".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(direct_only.grants.len(), 1);
    assert_eq!(direct_only.grants[0].privilege, "view");
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn cross_tenant_reads_see_nothing() {
    let Some(db) = test_db().await else { return };
    let org_a = test_org(&db).await;
    let org_b = test_org(&db).await;

    let mut tx = db.write(org_a.id).await.unwrap();
    let mut u = user("tenant-a@x");
    create_identity(&mut tx, &mut u).await.unwrap();
    let mut g = grant(Subject::user(u.id), "view", "prod");
    create_grant(&mut tx, &mut g).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = db.read(org_b.id).await.unwrap();
    let err = get_identity(&mut tx, GetIdentity::ByName("tenant-a@x".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    let err = grants::get_grant(&mut tx, GetGrant::ById(g.id)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    let page = list_grants(&mut tx, ListGrantsOptions::default()).await.unwrap();
    assert!(page
        .grants
        .iter()
        .all(|row| row.organization_id == org_b.id));
}

#[tokio::test]
async fn deleting_an_identity_cascades() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let mut u = user("leaver@x");
    create_identity(&mut tx, &mut u).await.unwrap();
    let provider = infra_provider(&mut tx).await.unwrap();

    let mut g = grant(Subject::user(u.id), "view", "prod");
    create_grant(&mut tx, &mut g).await.unwrap();
    let mut key = new_access_key(u.id, provider.id);
    let token = create_access_key(&mut tx, &mut key).await.unwrap();

    delete_identity(&mut tx, u.id).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = db.read(org.id).await.unwrap();
    let err = get_identity(&mut tx, GetIdentity::ById(u.id)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    let err = grants::get_grant(&mut tx, GetGrant::ById(g.id)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    drop(tx);

    let err = validate_access_key(&db, &token).await.unwrap_err();
    assert!(matches!(err, Error::AccessKeyNotFound), "{err:?}");
}

#[tokio::test]
async fn group_sync_is_exact() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let mut u = user("synced@x");
    create_identity(&mut tx, &mut u).await.unwrap();
    let provider = infra_provider(&mut tx).await.unwrap();

    sync_provider_groups(&mut tx, u.id, provider.id, &["a".into(), "b".into()])
        .await
        .unwrap();
    let ids = group_ids_for_user(&mut tx, u.id).await.unwrap();
    assert_eq!(ids.len(), 2);

    sync_provider_groups(&mut tx, u.id, provider.id, &["b".into(), "c".into()])
        .await
        .unwrap();
    let groups = list_groups(
        &mut tx,
        ListGroupsOptions {
            by_member: Some(u.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let mut names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["b", "c"]);
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn destinations_upsert_by_name() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let mut first = Destination {
        id: Id::zero(),
        organization_id: org.id,
        name: "prod".to_string(),
        ca: "ca-v1".to_string(),
        endpoint: "10.0.0.1:443".to_string(),
        namespace: "infra".to_string(),
        sa_token: "token-v1".to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    upsert_destination(&mut tx, &mut first).await.unwrap();

    let mut second = Destination {
        ca: "ca-v2".to_string(),
        sa_token: "token-v2".to_string(),
        id: Id::zero(),
        ..first.clone()
    };
    upsert_destination(&mut tx, &mut second).await.unwrap();
    assert_eq!(second.id, first.id, "heartbeat keeps the destination id");

    let stored = infra_registry::store::destinations::get_destination(
        &mut tx,
        GetDestination::ByName("prod".to_string()),
    )
    .await
    .unwrap();
    assert_eq!(stored.ca, "ca-v2");
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn organizations_seed_connector_and_infra_provider() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let connector = get_identity(
        &mut tx,
        GetIdentity::ByName(CONNECTOR_IDENTITY_NAME.to_string()),
    )
    .await
    .unwrap();

    let page = list_grants(
        &mut tx,
        ListGrantsOptions {
            by_subject: Some(Subject::user(connector.id)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(page
        .grants
        .iter()
        .any(|g| g.privilege == "connector" && g.resource == "infra"));

    let provider = infra_provider(&mut tx).await.unwrap();
    let err = delete_provider(&mut tx, provider.id).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn roles_projection_expands_groups_and_cursors() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let mut tx = db.write(org.id).await.unwrap();
    let provider = infra_provider(&mut tx).await.unwrap();
    let mut alice = user("alice@x");
    create_identity(&mut tx, &mut alice).await.unwrap();
    let mut bob = user("bob@x");
    create_identity(&mut tx, &mut bob).await.unwrap();

    let mut devs = Group {
        id: Id::zero(),
        organization_id: org.id,
        provider_id: provider.id,
        name: "devs".to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    create_group(&mut tx, &mut devs).await.unwrap();
    add_group_member(&mut tx, devs.id, alice.id).await.unwrap();
    add_group_member(&mut tx, devs.id, bob.id).await.unwrap();

    let mut direct = grant(Subject::user(alice.id), "admin", "proj.kube-system");
    create_grant(&mut tx, &mut direct).await.unwrap();
    let mut via_group = grant(Subject::group(devs.id), "view", "proj");
    create_grant(&mut tx, &mut via_group).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = db.read(org.id).await.unwrap();
    let response = access::roles_for_destination(&mut tx, "proj", 0).await.unwrap();
    assert_eq!(response.roles.len(), 2);

    let view = response.roles.iter().find(|r| r.name == "view").unwrap();
    assert_eq!(view.namespace, None);
    assert_eq!(view.users, vec!["alice@x", "bob@x"]);

    let admin = response.roles.iter().find(|r| r.name == "admin").unwrap();
    assert_eq!(admin.namespace.as_deref(), Some("kube-system"));
    assert_eq!(admin.users, vec!["alice@x"]);

    // A caught-up cursor yields no work.
    let unchanged = access::roles_for_destination(&mut tx, "proj", response.max_update_index)
        .await
        .unwrap();
    assert!(unchanged.roles.is_empty());
    assert_eq!(unchanged.max_update_index, response.max_update_index);
}

#[tokio::test]
async fn config_file_wins_on_restart() {
    let Some(db) = test_db().await else { return };
    let org = test_org(&db).await;

    let full: config::Config = serde_yaml::from_str(
        r#"
permissions:
  - user: cfg@x
    role: view
    destination: prod
  - user: cfg@x
    role: admin
"#,
    )
    .unwrap();
    config::apply(&db, org.id, &full).await.unwrap();

    let trimmed: config::Config = serde_yaml::from_str(
        r#"
permissions:
  - user: cfg@x
    role: view
    destination: prod
"#,
    )
    .unwrap();
    config::apply(&db, org.id, &trimmed).await.unwrap();

    let mut tx = db.read(org.id).await.unwrap();
    let cfg_user = get_identity(&mut tx, GetIdentity::ByName("cfg@x".to_string()))
        .await
        .unwrap();
    let page = list_grants(
        &mut tx,
        ListGrantsOptions {
            by_subject: Some(Subject::user(cfg_user.id)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(page.grants.len(), 1);
    assert_eq!(page.grants[0].privilege, "view");
}
