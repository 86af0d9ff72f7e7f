//! Link lifecycle endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use gtp_common::db::models::MeasureLink;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ApiError;
use crate::registry::{self, LinkFilter, MetadataPatch, NewLink};
use crate::AppContext;

#[derive(Debug, Serialize)]
pub struct LinkListResponse {
    pub links: Vec<MeasureLink>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct UnlinkQuery {
    #[serde(default)]
    pub new_primary: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SetPrimaryRequest {
    pub goal_id: Uuid,
}

/// POST /links - Create a measure link
pub async fn create_link(
    State(ctx): State<AppContext>,
    Json(req): Json<NewLink>,
) -> Result<Json<MeasureLink>, ApiError> {
    let link = registry::create_link(&ctx.db, &ctx.events, req).await?;
    Ok(Json(link))
}

/// GET /links - List links, filterable by measure/goal/strategy/person
/// or personal-only
pub async fn list_links(
    State(ctx): State<AppContext>,
    Query(filter): Query<LinkFilter>,
) -> Result<Json<LinkListResponse>, ApiError> {
    let links = registry::list_links(&ctx.db, &filter).await?;
    Ok(Json(LinkListResponse { links }))
}

/// GET /links/:id
pub async fn get_link(
    State(ctx): State<AppContext>,
    Path(link_id): Path<Uuid>,
) -> Result<Json<MeasureLink>, ApiError> {
    let link = registry::get_link(&ctx.db, link_id).await?;
    Ok(Json(link))
}

/// DELETE /links/:id - Unlink, optionally promoting a replacement primary
pub async fn unlink(
    State(ctx): State<AppContext>,
    Path(link_id): Path<Uuid>,
    Query(query): Query<UnlinkQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    registry::unlink(&ctx.db, &ctx.events, link_id, query.new_primary).await?;
    Ok(Json(StatusResponse {
        status: "unlinked".to_string(),
    }))
}

/// PUT /links/:id/metadata - Partial metadata update
pub async fn update_metadata(
    State(ctx): State<AppContext>,
    Path(link_id): Path<Uuid>,
    Json(patch): Json<MetadataPatch>,
) -> Result<Json<MeasureLink>, ApiError> {
    let link = registry::update_metadata(&ctx.db, link_id, patch).await?;
    Ok(Json(link))
}

/// POST /links/:id/primary - Atomic primary swap for a goal
pub async fn set_primary(
    State(ctx): State<AppContext>,
    Path(link_id): Path<Uuid>,
    Json(req): Json<SetPrimaryRequest>,
) -> Result<Json<MeasureLink>, ApiError> {
    let link = registry::set_primary(&ctx.db, &ctx.events, link_id, req.goal_id).await?;
    Ok(Json(link))
}
