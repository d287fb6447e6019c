use super::conversations::PageParams;
use super::{ApiError, ApiResult, AppState};
use crate::auth::AuthUser;
use crate::notifications::NotificationPage;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub(crate) struct UnreadCountResponse {
    unread_count: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct MarkedResponse {
    marked_read: usize,
}

pub(crate) async fn list_notifications(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(params): Query<PageParams>,
) -> ApiResult<NotificationPage> {
    let (limit, offset) = params.resolve();
    let page = state.notifications().list(user.id, limit, offset).await?;
    Ok(Json(page))
}

pub(crate) async fn unread_count(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<UnreadCountResponse> {
    let unread_count = state.notifications().unread_count(user.id).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

pub(crate) async fn mark_all_read(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<MarkedResponse> {
    let marked_read = state.notifications().mark_all_read(user.id).await?;
    Ok(Json(MarkedResponse { marked_read }))
}

pub(crate) async fn mark_read(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.notifications().mark_read(id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
