use crate::conversations::MessageView;
use crate::notifications::NotificationView;
use serde::{Deserialize, Serialize};

/// Everything pushed to a client socket. Serialized with a `type` field so
/// clients can dispatch on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    MessageCreated(MessageView),
    ReadReceipt {
        thread_id: i64,
        message_id: i64,
        reader_id: i64,
    },
    ConversationUpdated(ConversationUpdate),
    MarkReadUpdated {
        chat_id: i64,
        user_id: i64,
        unread_count: usize,
    },
    ThreadRemoved {
        chat_id: i64,
    },
    Notification(NotificationView),
    PresenceUpdate {
        user_id: i64,
        online: bool,
    },
}

impl RealtimeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeEvent::MessageCreated(_) => "message_created",
            RealtimeEvent::ReadReceipt { .. } => "read_receipt",
            RealtimeEvent::ConversationUpdated(_) => "conversation_updated",
            RealtimeEvent::MarkReadUpdated { .. } => "mark_read_updated",
            RealtimeEvent::ThreadRemoved { .. } => "thread_removed",
            RealtimeEvent::Notification(_) => "notification",
            RealtimeEvent::PresenceUpdate { .. } => "presence_update",
        }
    }
}

/// Conversation-list delta sent to one participant's personal group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationUpdate {
    pub chat_id: i64,
    pub message: String,
    pub timestamp: String,
    pub sender: SenderRef,
    pub is_sender: bool,
    pub unread_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderRef {
    pub id: Option<i64>,
    pub username: String,
}
