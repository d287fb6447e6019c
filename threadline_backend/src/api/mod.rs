mod conversations;
mod media;
mod notifications;
mod realtime;
mod users;

use crate::auth::{Authenticator, TokenKeys};
use crate::config::ThreadlineConfig;
use crate::conversations::ConversationService;
use crate::database::Database;
use crate::error::ServiceError;
use crate::follows::FollowService;
use crate::media::MediaService;
use crate::notifications::NotificationService;
use crate::presence::Presence;
use crate::realtime::fanout::Fanout;
use crate::realtime::groups::EventBus;
use crate::realtime::RealtimeContext;
use crate::users::UserService;
use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: ThreadlineConfig,
    pub database: Database,
    pub auth: Authenticator,
    pub presence: Presence,
    pub bus: Arc<dyn EventBus>,
}

impl AppState {
    pub fn new(
        config: ThreadlineConfig,
        database: Database,
        presence: Presence,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let auth = Authenticator::new(
            TokenKeys::new(&config.auth),
            UserService::new(database.clone()),
        );
        Self {
            config,
            database,
            auth,
            presence,
            bus,
        }
    }

    pub fn users(&self) -> UserService {
        UserService::new(self.database.clone())
    }

    pub fn conversations(&self) -> ConversationService {
        ConversationService::new(
            self.database.clone(),
            self.config.view.clone(),
            self.presence.clone(),
        )
    }

    pub fn notifications(&self) -> NotificationService {
        NotificationService::new(self.database.clone(), Arc::clone(&self.bus))
    }

    pub fn follows(&self) -> FollowService {
        FollowService::new(self.database.clone(), self.notifications())
    }

    pub fn media(&self) -> MediaService {
        MediaService::new(self.config.paths.clone(), self.config.media.clone())
    }

    pub fn fanout(&self) -> Fanout {
        Fanout::new(Arc::clone(&self.bus), self.conversations())
    }

    pub fn realtime(&self) -> RealtimeContext {
        RealtimeContext {
            auth: self.auth.clone(),
            users: self.users(),
            conversations: self.conversations(),
            presence: self.presence.clone(),
            bus: Arc::clone(&self.bus),
            fanout: self.fanout(),
            config: self.config.realtime.clone(),
        }
    }
}

pub(crate) type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn into_response_parts(self) -> (StatusCode, ErrorResponse) {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse {
                    error: "authentication required".into(),
                },
            ),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, ErrorResponse { error: msg }),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse { error: msg }),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse { error: msg }),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, ErrorResponse { error: msg }),
            ApiError::Internal(err) => {
                tracing::error!(error = ?err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: "internal server error".into(),
                    },
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.into_response_parts();
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unauthorized => ApiError::Unauthorized,
            ServiceError::Forbidden(msg) => ApiError::Forbidden(msg),
            ServiceError::NotFound(msg) => ApiError::NotFound(msg),
            ServiceError::Validation(msg) => ApiError::BadRequest(msg),
            ServiceError::Conflict(msg) => ApiError::Conflict(msg),
            ServiceError::Internal(err) => ApiError::Internal(err),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn build_router(state: AppState) -> Router {
    // Two attachments plus multipart framing.
    let body_limit = state.config.media.max_upload_bytes * 2 + 64 * 1024;
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route("/conversations/unread-count", get(conversations::unread_total))
        .route("/start", post(conversations::start_conversation))
        .route("/threads/:id", axum::routing::delete(conversations::delete_thread))
        .route("/threads/:id/messages", get(conversations::list_messages))
        .route("/threads/:id/mark-read", post(conversations::mark_read))
        .route("/threads/:id/send-file", post(conversations::send_file))
        .route("/media/:name", get(media::download_media))
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/notifications/mark-read", post(notifications::mark_all_read))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route(
            "/users/:id/follow",
            post(users::follow_user).delete(users::unfollow_user),
        )
        .route("/users/:id/presence", get(users::presence))
        .route("/ws/chat/:thread_id", get(realtime::thread_socket))
        .route("/ws/conversations", get(realtime::personal_socket))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Tries to bind to the given port, or finds the next available port
async fn find_available_port(start_port: u16) -> Result<(TcpListener, u16)> {
    const MAX_PORT_ATTEMPTS: u16 = 100;

    for offset in 0..MAX_PORT_ATTEMPTS {
        let port = start_port.saturating_add(offset);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => {
                if offset == 0 {
                    tracing::debug!(port, error = %e, "Port in use, trying next port");
                }
                continue;
            }
        }
    }

    anyhow::bail!(
        "Could not find available port in range {}-{}",
        start_port,
        start_port.saturating_add(MAX_PORT_ATTEMPTS - 1)
    )
}

pub async fn serve_http(state: AppState) -> Result<()> {
    let requested_port = state.config.api_port;
    let router = build_router(state);

    let (listener, actual_port) = find_available_port(requested_port).await?;
    let addr = SocketAddr::from(([0, 0, 0, 0], actual_port));
    if actual_port != requested_port {
        tracing::warn!(
            requested_port,
            actual_port,
            "Configured port was in use, bound to next available port"
        );
    }

    tracing::info!(?addr, "HTTP server listening");
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn render(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn service_errors_map_to_statuses() {
        let cases = [
            (ServiceError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ServiceError::Forbidden("no".into()), StatusCode::FORBIDDEN),
            (ServiceError::NotFound("gone".into()), StatusCode::NOT_FOUND),
            (ServiceError::Validation("empty".into()), StatusCode::BAD_REQUEST),
            (ServiceError::Conflict("dup".into()), StatusCode::CONFLICT),
            (
                ServiceError::Internal(anyhow::anyhow!("disk on fire")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let (status, body) = render(ApiError::from(err)).await;
            assert_eq!(status, expected);
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn internal_errors_are_not_leaked() {
        let (_, body) = render(ApiError::Internal(anyhow::anyhow!("secret path /var/db"))).await;
        assert_eq!(body["error"], "internal server error");
    }
}
