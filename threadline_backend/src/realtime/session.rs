//! Per-socket session lifecycles.
//!
//! A thread session goes `Connecting -> Authorizing -> Joined -> Closed`;
//! a personal session goes `Connecting -> Authorizing ->
//! ListeningForOwnEvents -> Closed`. Connect-time failures end in a close
//! frame with a distinguishing code, never a data frame.

use super::events::RealtimeEvent;
use super::groups::{thread_group, user_group, ConnectionId};
use super::RealtimeContext;
use crate::conversations::{MessageContent, MessageView};
use crate::database::models::UserRecord;
use crate::error::ServiceError;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use tokio::sync::mpsc;

pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_FORBIDDEN: u16 = 4003;
pub const CLOSE_NOT_FOUND: u16 = 4004;
pub const CLOSE_INTERNAL: u16 = 1011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authorizing,
    Joined,
    ListeningForOwnEvents,
    Closed,
}

/// Inbound client frames. Anything else is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Send { text: String },
    MarkRead,
    Ping,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

pub fn parse_frame(raw: &str) -> Option<ClientFrame> {
    let frame: RawFrame = serde_json::from_str(raw).ok()?;
    match frame.kind.as_deref() {
        Some("mark_read") => Some(ClientFrame::MarkRead),
        Some("ping") => Some(ClientFrame::Ping),
        Some("message") | None => frame.text.map(|text| ClientFrame::Send { text }),
        Some(_) => None,
    }
}

pub fn close_code_for(err: &ServiceError) -> u16 {
    match err {
        ServiceError::Unauthorized => CLOSE_UNAUTHORIZED,
        ServiceError::Forbidden(_) => CLOSE_FORBIDDEN,
        ServiceError::NotFound(_) => CLOSE_NOT_FOUND,
        _ => CLOSE_INTERNAL,
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    if let Err(err) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(code, error = %err, "close frame not delivered");
    }
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &RealtimeEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(payload) => sink.send(Message::Text(payload)).await,
        Err(err) => {
            tracing::warn!(kind = event.kind(), error = %err, "failed to encode event");
            Ok(())
        }
    }
}

struct Session {
    conn: ConnectionId,
    state: SessionState,
}

impl Session {
    fn new() -> Self {
        Self {
            conn: ConnectionId::new(),
            state: SessionState::Connecting,
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(conn = %self.conn, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    async fn authorize(
        &mut self,
        ctx: &RealtimeContext,
        token: Option<String>,
    ) -> Result<UserRecord, ServiceError> {
        self.transition(SessionState::Authorizing);
        match token {
            Some(token) => ctx.auth.resolve(&token).await.ok_or(ServiceError::Unauthorized),
            None => Err(ServiceError::Unauthorized),
        }
    }
}

/// Drives a socket bound to one thread's group.
pub async fn run_thread_session(
    socket: WebSocket,
    ctx: RealtimeContext,
    thread_id: i64,
    token: Option<String>,
) {
    let mut session = Session::new();
    let user = match session.authorize(&ctx, token).await {
        Ok(user) => user,
        Err(err) => {
            session.transition(SessionState::Closed);
            close_with(socket, close_code_for(&err), "unauthorized").await;
            return;
        }
    };
    let participants = match ctx.conversations.require_participant(thread_id, user.id).await {
        Ok(participants) => participants,
        Err(err) => {
            tracing::info!(thread_id, user_id = user.id, error = %err, "thread session refused");
            session.transition(SessionState::Closed);
            let reason = match err {
                ServiceError::Forbidden(_) => "forbidden",
                ServiceError::NotFound(_) => "thread not found",
                _ => "internal error",
            };
            close_with(socket, close_code_for(&err), reason).await;
            return;
        }
    };

    let group = thread_group(thread_id);
    let (tx, mut rx) = mpsc::channel(ctx.config.send_queue);
    ctx.bus.subscribe(&group, &session.conn, tx);
    session.transition(SessionState::Joined);
    tracing::info!(thread_id, user_id = user.id, conn = %session.conn, "joined thread");

    match ctx.conversations.mark_thread_read(thread_id, user.id).await {
        Ok(newly_read) => ctx.fanout.read_receipt(thread_id, user.id, &newly_read),
        Err(err) => tracing::warn!(thread_id, user_id = user.id, error = %err, "join-time mark read failed"),
    }

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(raw))) => {
                    handle_thread_frame(&ctx, thread_id, &user, &participants, &raw).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(conn = %session.conn, error = %err, "socket read failed");
                    break;
                }
            },
            event = rx.recv() => {
                let Some(event) = event else { break };
                let event = personalize(&ctx, &user, event).await;
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    ctx.bus.unsubscribe(&group, &session.conn);
    session.transition(SessionState::Closed);
    tracing::info!(thread_id, user_id = user.id, conn = %session.conn, "left thread");
}

async fn handle_thread_frame(
    ctx: &RealtimeContext,
    thread_id: i64,
    user: &UserRecord,
    participants: &[i64],
    raw: &str,
) {
    let Some(frame) = parse_frame(raw) else {
        tracing::debug!(thread_id, user_id = user.id, "dropping unrecognised frame");
        return;
    };
    match frame {
        ClientFrame::Send { text } => {
            match ctx
                .conversations
                .append_message(thread_id, user.id, MessageContent::text(text))
                .await
            {
                Ok(message) => ctx.fanout.message_sent(&message, participants).await,
                Err(ServiceError::Validation(reason)) => {
                    tracing::debug!(thread_id, user_id = user.id, %reason, "dropping invalid message");
                }
                Err(err) => {
                    tracing::warn!(thread_id, user_id = user.id, error = %err, "failed to append message");
                }
            }
        }
        ClientFrame::MarkRead => {
            match ctx.conversations.mark_thread_read(thread_id, user.id).await {
                Ok(_) => {
                    ctx.fanout
                        .mark_read_updated(thread_id, user.id, participants)
                        .await
                }
                Err(err) => {
                    tracing::warn!(thread_id, user_id = user.id, error = %err, "mark read failed")
                }
            }
        }
        ClientFrame::Ping => {}
    }
}

/// Fills in per-receiver fields on `message_created`; other events pass
/// through untouched.
async fn personalize(ctx: &RealtimeContext, user: &UserRecord, event: RealtimeEvent) -> RealtimeEvent {
    match event {
        RealtimeEvent::MessageCreated(mut message) => {
            if message.sender_id.is_none() {
                message.sender_id = resolve_sender(ctx, &message).await;
            }
            message.is_own = Some(message.sender_id == Some(user.id));
            RealtimeEvent::MessageCreated(message)
        }
        other => other,
    }
}

async fn resolve_sender(ctx: &RealtimeContext, message: &MessageView) -> Option<i64> {
    match ctx.users.get_by_username(&message.sender).await {
        Ok(Some(sender)) => Some(sender.id),
        Ok(None) => {
            tracing::warn!(message_id = message.id, sender = %message.sender, "sender not found");
            None
        }
        Err(err) => {
            tracing::warn!(message_id = message.id, error = %err, "sender lookup failed");
            None
        }
    }
}

/// Drives a socket bound to the caller's personal group and keeps their
/// presence counter alive for as long as it stays open.
pub async fn run_personal_session(socket: WebSocket, ctx: RealtimeContext, token: Option<String>) {
    let mut session = Session::new();
    let user = match session.authorize(&ctx, token).await {
        Ok(user) => user,
        Err(err) => {
            session.transition(SessionState::Closed);
            close_with(socket, close_code_for(&err), "unauthorized").await;
            return;
        }
    };

    let group = user_group(user.id);
    let (tx, mut rx) = mpsc::channel(ctx.config.send_queue);
    ctx.bus.subscribe(&group, &session.conn, tx);
    session.transition(SessionState::ListeningForOwnEvents);
    if ctx.presence.increment(user.id).await == 1 {
        ctx.fanout.presence_changed(user.id, true).await;
    }

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(ctx.config.presence_refresh(ctx.presence.ttl()));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(raw))) => {
                    if parse_frame(&raw) == Some(ClientFrame::Ping) {
                        ctx.presence.refresh(user.id).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(conn = %session.conn, error = %err, "socket read failed");
                    break;
                }
            },
            event = rx.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                ctx.presence.refresh(user.id).await;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    ctx.bus.unsubscribe(&group, &session.conn);
    if ctx.presence.decrement(user.id).await == 0 {
        ctx.fanout.presence_changed(user.id, false).await;
    }
    session.transition(SessionState::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_parse_by_shape() {
        assert_eq!(parse_frame(r#"{"type":"mark_read"}"#), Some(ClientFrame::MarkRead));
        assert_eq!(parse_frame(r#"{"type":"ping"}"#), Some(ClientFrame::Ping));
        assert_eq!(
            parse_frame(r#"{"text":"hello"}"#),
            Some(ClientFrame::Send {
                text: "hello".into()
            })
        );
        assert_eq!(parse_frame(r#"{"type":"typing"}"#), None);
        assert_eq!(parse_frame(r#"{}"#), None);
        assert_eq!(parse_frame("not json"), None);
    }

    #[test]
    fn connect_failures_map_to_close_codes() {
        assert_eq!(close_code_for(&ServiceError::Unauthorized), CLOSE_UNAUTHORIZED);
        assert_eq!(close_code_for(&ServiceError::Forbidden("x".into())), CLOSE_FORBIDDEN);
        assert_eq!(close_code_for(&ServiceError::NotFound("x".into())), CLOSE_NOT_FOUND);
        assert_eq!(
            close_code_for(&ServiceError::Internal(anyhow::anyhow!("boom"))),
            CLOSE_INTERNAL
        );
    }
}
