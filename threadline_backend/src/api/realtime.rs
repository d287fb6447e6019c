use super::AppState;
use crate::auth::{bearer_token, TokenQuery};
use crate::realtime::session::{run_personal_session, run_thread_session};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;

pub(crate) async fn thread_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(thread_id): Path<i64>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    let token = bearer_token(query.token, &headers);
    let ctx = state.realtime();
    ws.on_upgrade(move |socket| run_thread_session(socket, ctx, thread_id, token))
}

pub(crate) async fn personal_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    let token = bearer_token(query.token, &headers);
    let ctx = state.realtime();
    ws.on_upgrade(move |socket| run_personal_session(socket, ctx, token))
}
