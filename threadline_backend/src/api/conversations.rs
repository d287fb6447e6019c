use super::{ApiError, ApiResult, AppState};
use crate::auth::AuthUser;
use crate::conversations::{ConversationView, MessageContent, MessagePage, MessageView};
use crate::media::{AttachmentKind, MediaService};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

const DEFAULT_PAGE: usize = 20;
const MAX_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
pub(crate) struct CreateConversationRequest {
    user_id: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ThreadCreatedResponse {
    thread_id: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StartConversationRequest {
    user_id: i64,
    text: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct StartConversationResponse {
    thread_id: i64,
    message: MessageView,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PageParams {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

impl PageParams {
    pub(crate) fn resolve(&self) -> (usize, usize) {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        (limit, self.offset.unwrap_or(0))
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct UnreadTotalResponse {
    unread_count: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct MarkReadResponse {
    status: &'static str,
    marked_read: usize,
    thread_id: i64,
    user_id: i64,
}

pub(crate) async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Vec<ConversationView>> {
    let conversations = state.conversations().list_threads(user.id).await?;
    Ok(Json(conversations))
}

pub(crate) async fn create_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<CreateConversationRequest>,
) -> ApiResult<ThreadCreatedResponse> {
    let thread = state
        .conversations()
        .find_or_create_thread(user.id, payload.user_id)
        .await?;
    Ok(Json(ThreadCreatedResponse {
        thread_id: thread.id,
    }))
}

pub(crate) async fn unread_total(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<UnreadTotalResponse> {
    let unread_count = state.conversations().total_unread(user.id).await?;
    Ok(Json(UnreadTotalResponse { unread_count }))
}

/// First contact: find-or-create the thread and send the opening message.
pub(crate) async fn start_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<StartConversationRequest>,
) -> Result<(StatusCode, Json<StartConversationResponse>), ApiError> {
    let conversations = state.conversations();
    let thread = conversations
        .find_or_create_thread(user.id, payload.user_id)
        .await?;
    let mut message = conversations
        .append_message(thread.id, user.id, MessageContent::text(payload.text))
        .await?;
    state
        .fanout()
        .message_sent(&message, &[user.id, payload.user_id])
        .await;
    message.is_own = Some(true);
    Ok((
        StatusCode::CREATED,
        Json(StartConversationResponse {
            thread_id: thread.id,
            message,
        }),
    ))
}

pub(crate) async fn list_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(thread_id): Path<i64>,
    Query(params): Query<PageParams>,
) -> ApiResult<MessagePage> {
    let (limit, offset) = params.resolve();
    let page = state
        .conversations()
        .messages(thread_id, user.id, limit, offset)
        .await?;
    Ok(Json(page))
}

pub(crate) async fn mark_read(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(thread_id): Path<i64>,
) -> ApiResult<MarkReadResponse> {
    let conversations = state.conversations();
    let participants = conversations.require_participant(thread_id, user.id).await?;
    let newly_read = conversations.mark_thread_read(thread_id, user.id).await?;
    state
        .fanout()
        .mark_read_updated(thread_id, user.id, &participants)
        .await;
    Ok(Json(MarkReadResponse {
        status: "ok",
        marked_read: newly_read.len(),
        thread_id,
        user_id: user.id,
    }))
}

pub(crate) async fn send_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(thread_id): Path<i64>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<MessageView>), ApiError> {
    let conversations = state.conversations();
    let participants = conversations.require_participant(thread_id, user.id).await?;
    let media = state.media();
    let mut content = MessageContent::default();

    if let Err(err) = read_message_form(&media, &mut multipart, &mut content).await {
        discard_uploads(&media, &content).await;
        return Err(err);
    }

    let uploads = content.clone();
    let mut message = match conversations
        .append_message(thread_id, user.id, content)
        .await
    {
        Ok(message) => message,
        Err(err) => {
            discard_uploads(&media, &uploads).await;
            return Err(err.into());
        }
    };
    state.fanout().message_sent(&message, &participants).await;
    message.is_own = Some(true);
    Ok((StatusCode::CREATED, Json(message)))
}

/// Reads the multipart fields into `content`, storing attachments as they
/// arrive. On error, whatever was already stored is left in `content`.
async fn read_message_form(
    media: &MediaService,
    multipart: &mut Multipart,
    content: &mut MessageContent,
) -> Result<(), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("malformed multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "text" => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(format!("unreadable text field: {err}")))?;
                content.text = Some(text);
            }
            "shared_post_id" => {
                let raw = field.text().await.map_err(|err| {
                    ApiError::BadRequest(format!("unreadable shared_post_id: {err}"))
                })?;
                if !raw.trim().is_empty() {
                    let id = raw
                        .trim()
                        .parse()
                        .map_err(|_| ApiError::BadRequest("shared_post_id must be an integer".into()))?;
                    content.shared_post_id = Some(id);
                }
            }
            "image" | "file" => {
                let kind = if name == "image" {
                    AttachmentKind::Image
                } else {
                    AttachmentKind::File
                };
                let file_name = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::BadRequest(format!("unreadable {name} field: {err}")))?;
                if bytes.is_empty() {
                    continue;
                }
                let stored = media
                    .save_attachment(kind, file_name.as_deref(), &bytes)
                    .await?;
                let slot = match kind {
                    AttachmentKind::Image => &mut content.image,
                    AttachmentKind::File => &mut content.file,
                };
                if let Some(replaced) = slot.replace(stored) {
                    media.discard(&replaced).await;
                }
            }
            other => tracing::debug!(field = other, "ignoring unknown multipart field"),
        }
    }
    Ok(())
}

async fn discard_uploads(media: &MediaService, content: &MessageContent) {
    for attachment in content.image.iter().chain(content.file.iter()) {
        media.discard(attachment).await;
    }
}

pub(crate) async fn delete_thread(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(thread_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let participants = state
        .conversations()
        .delete_thread(thread_id, user.id)
        .await?;
    state.fanout().thread_removed(thread_id, &participants);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_params_default_and_clamp() {
        let params = PageParams {
            limit: None,
            offset: None,
        };
        assert_eq!(params.resolve(), (20, 0));
        let params = PageParams {
            limit: Some(1000),
            offset: Some(40),
        };
        assert_eq!(params.resolve(), (100, 40));
        let params = PageParams {
            limit: Some(0),
            offset: None,
        };
        assert_eq!(params.resolve(), (1, 0));
    }
}
