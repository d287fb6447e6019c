use super::{ApiError, ApiResult, AppState};
use crate::auth::AuthUser;
use crate::database::models::FollowRecord;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub(crate) struct PresenceResponse {
    user_id: i64,
    online: bool,
}

pub(crate) async fn follow_user(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(followee_id): Path<i64>,
) -> Result<(StatusCode, Json<FollowRecord>), ApiError> {
    let record = state.follows().follow(user.id, followee_id).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub(crate) async fn unfollow_user(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(followee_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.follows().unfollow(user.id, followee_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn presence(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Path(user_id): Path<i64>,
) -> ApiResult<PresenceResponse> {
    state.users().require(user_id).await?;
    let online = state.presence.is_online(user_id).await;
    Ok(Json(PresenceResponse { user_id, online }))
}
