use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub avatar: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: i64,
    /// `"<low id>:<high id>"`; unique so a pair can only ever own one thread.
    pub pair_key: String,
    pub created_at: String,
    pub last_activity_at: String,
}

/// A thread as seen from one participant's conversation list.
#[derive(Debug, Clone)]
pub struct ThreadActivity {
    pub thread: ThreadRecord,
    pub last_message_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub thread_id: i64,
    pub sender_id: i64,
    pub text: Option<String>,
    pub image_path: Option<String>,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub shared_post_id: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub thread_id: i64,
    pub sender_id: i64,
    pub text: Option<String>,
    pub image_path: Option<String>,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub shared_post_id: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub recipient_id: i64,
    pub sender_id: i64,
    pub kind: String,
    pub post_id: Option<i64>,
    pub content: String,
    pub created_at: String,
    pub is_read: bool,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient_id: i64,
    pub sender_id: i64,
    pub kind: String,
    pub post_id: Option<i64>,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowRecord {
    pub follower_id: i64,
    pub followee_id: i64,
    pub created_at: String,
}
