//! Grant CRUD.
//!
//! Listing arbitrary subjects requires an admin grant; a user may always
//! list their own, inherited grants included.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;

use infra_common::api::{CreateGrantRequest, Grant, ListGrantsQuery, ListResponse};
use infra_common::{Id, Subject};

use crate::access;
use crate::error::Result;
use crate::server::auth::{require_admin, require_self_or_admin, Access};
use crate::server::validate::Rules;
use crate::server::AppState;
use crate::store::{grants, models};

pub async fn list_grants(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Query(query): Query<ListGrantsQuery>,
) -> Result<Json<ListResponse<Grant>>> {
    let own = query.subject == Some(Subject::user(access.user_id()));
    if !own {
        require_admin(&state.db, &access).await?;
    }

    let mut tx = state.db.read(access.organization_id()).await?;
    let page = grants::list_grants(
        &mut tx,
        grants::ListGrantsOptions {
            by_subject: query.subject,
            include_inherited_from_groups: query.inherited,
            by_privileges: query.privilege.into_iter().collect(),
            by_resource: query.resource,
            by_destination: query.destination,
            limit: query.limit,
            after: query.after,
            ..Default::default()
        },
    )
    .await?;
    Ok(Json(
        page.grants
            .iter()
            .map(models::Grant::to_api)
            .collect::<Vec<_>>()
            .into(),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveGrantsQuery {
    pub destination: String,
}

/// Effective grants for one user on one destination: direct grants plus
/// those inherited through groups, deduplicated.
pub async fn list_user_grants(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Path(id): Path<Id>,
    Query(query): Query<EffectiveGrantsQuery>,
) -> Result<Json<ListResponse<Grant>>> {
    require_self_or_admin(&state.db, &access, id).await?;

    let mut rules = Rules::new();
    rules.required("destination", &query.destination);
    rules.finish()?;

    let mut tx = state.db.read(access.organization_id()).await?;
    let grants = access::effective_grants(&mut tx, id, &query.destination, false).await?;
    Ok(Json(
        grants
            .iter()
            .map(models::Grant::to_api)
            .collect::<Vec<_>>()
            .into(),
    ))
}

pub async fn create_grant(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Json(request): Json<CreateGrantRequest>,
) -> Result<(StatusCode, Json<Grant>)> {
    require_admin(&state.db, &access).await?;

    let mut rules = Rules::new();
    rules
        .required("privilege", &request.privilege)
        .required("resource", &request.resource);
    rules.finish()?;

    let mut tx = state.db.write(access.organization_id()).await?;
    let mut grant = models::Grant {
        id: Id::zero(),
        organization_id: access.organization_id(),
        subject: request.subject,
        privilege: request.privilege,
        resource: request.resource,
        created_by: access.user_id(),
        update_index: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    grants::create_grant(&mut tx, &mut grant).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(grant.to_api())))
}

pub async fn delete_grant(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Path(id): Path<Id>,
) -> Result<StatusCode> {
    require_admin(&state.db, &access).await?;
    let mut tx = state.db.write(access.organization_id()).await?;
    // 404 for grants that do not exist (or are another tenant's).
    grants::get_grant(&mut tx, grants::GetGrant::ById(id)).await?;
    grants::delete_grants(
        &mut tx,
        grants::DeleteGrantsOptions {
            by_id: Some(id),
            ..Default::default()
        },
    )
    .await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
