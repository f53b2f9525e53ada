//! Destination registration and the role pull engines drive.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;

use infra_common::api::{
    CreateDestinationRequest, CreateDestinationResponse, Destination, ListResponse,
    ListRolesQuery, ListRolesResponse,
};
use infra_common::Id;

use crate::access;
use crate::error::Result;
use crate::server::auth::{require_connector, Access};
use crate::server::validate::Rules;
use crate::server::AppState;
use crate::store::{destinations, models};

/// Engine heartbeat: register or refresh this cluster's destination record.
pub async fn create_destination(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Json(request): Json<CreateDestinationRequest>,
) -> Result<(StatusCode, Json<CreateDestinationResponse>)> {
    require_connector(&state.db, &access).await?;

    let mut rules = Rules::new();
    rules
        .required("name", &request.name)
        .required("endpoint", &request.endpoint);
    rules.finish()?;

    let mut tx = state.db.write(access.organization_id()).await?;
    let mut destination = models::Destination {
        id: Id::zero(),
        organization_id: access.organization_id(),
        name: request.name,
        ca: request.ca,
        endpoint: request.endpoint,
        namespace: request.namespace,
        sa_token: request.sa_token,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    destinations::upsert_destination(&mut tx, &mut destination).await?;
    tx.commit().await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateDestinationResponse { id: destination.id }),
    ))
}

pub async fn list_destinations(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
) -> Result<Json<ListResponse<Destination>>> {
    let mut tx = state.db.read(access.organization_id()).await?;
    let items = destinations::list_destinations(&mut tx).await?;
    Ok(Json(
        items
            .iter()
            .map(models::Destination::to_api)
            .collect::<Vec<_>>()
            .into(),
    ))
}

/// Roles currently projected onto a destination, with the update-index
/// cursor for the engine's next pull.
pub async fn list_roles(
    State(state): State<AppState>,
    Extension(access): Extension<Access>,
    Path(id): Path<Id>,
    Query(query): Query<ListRolesQuery>,
) -> Result<Json<ListRolesResponse>> {
    require_connector(&state.db, &access).await?;
    let mut tx = state.db.read(access.organization_id()).await?;
    let destination =
        destinations::get_destination(&mut tx, destinations::GetDestination::ById(id)).await?;
    let response = access::roles_for_destination(&mut tx, &destination.name, query.since).await?;
    Ok(Json(response))
}
