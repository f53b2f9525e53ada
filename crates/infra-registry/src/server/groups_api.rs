//! Group CRUD and membership edits.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;

use infra_common::api::{CreateGroupRequest, Group, ListResponse, UpdateGroupMembersRequest};
use infra_common::Id;

use crate::error::Result;
use crate::server::auth::{require_admin, Access};
use crate::server::validate::Rules;
use crate::server::AppState;
use crate::store::{groups, models, providers};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListGroupsQuery {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub after: Option<Id>,
}

pub async fn list_groups(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Query(query): Query<ListGroupsQuery>,
) -> Result<Json<ListResponse<Group>>> {
    let mut tx = state.db.read(access.organization_id()).await?;
    let items = groups::list_groups(
        &mut tx,
        groups::ListGroupsOptions {
            by_name: query.name,
            by_member: None,
            limit: query.limit,
            after: query.after,
        },
    )
    .await?;
    Ok(Json(
        items.iter().map(models::Group::to_api).collect::<Vec<_>>().into(),
    ))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Group>)> {
    require_admin(&state.db, &access).await?;

    let mut rules = Rules::new();
    rules.required("name", &request.name);
    rules.finish()?;

    let mut tx = state.db.write(access.organization_id()).await?;
    // Manually managed groups live under the built-in provider.
    let provider_id = match request.provider_id {
        Some(id) => id,
        None => providers::infra_provider(&mut tx).await?.id,
    };
    let mut group = models::Group {
        id: Id::zero(),
        organization_id: access.organization_id(),
        provider_id,
        name: request.name,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    groups::create_group(&mut tx, &mut group).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(group.to_api())))
}

pub async fn update_group_members(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Path(id): Path<Id>,
    Json(request): Json<UpdateGroupMembersRequest>,
) -> Result<StatusCode> {
    require_admin(&state.db, &access).await?;
    let mut tx = state.db.write(access.organization_id()).await?;
    // 404 before mutating anything.
    groups::get_group(&mut tx, groups::GetGroup::ById(id)).await?;
    for user_id in &request.add {
        groups::add_group_member(&mut tx, id, *user_id).await?;
    }
    for user_id in &request.remove {
        groups::remove_group_member(&mut tx, id, *user_id).await?;
    }
    tx.commit().await?;
    Ok(StatusCode::OK)
}

pub async fn delete_group(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Path(id): Path<Id>,
) -> Result<StatusCode> {
    require_admin(&state.db, &access).await?;
    let mut tx = state.db.write(access.organization_id()).await?;
    groups::delete_group(&mut tx, id).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
