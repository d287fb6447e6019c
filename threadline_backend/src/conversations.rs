//! Threads, messages and read state between pairs of users.

use crate::config::ViewConfig;
use crate::database::models::{MessageRecord, NewMessage, ThreadRecord, UserRecord};
use crate::database::repositories::{
    MessageRepository, SqliteRepositories, ThreadRepository, UserRepository,
};
use crate::database::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::media::StoredAttachment;
use crate::presence::Presence;
use crate::users::UserSummary;
use crate::utils::{clock_time, now_utc_iso};
use serde::{Deserialize, Serialize};

const PREVIEW_CHARS: usize = 100;

/// What a sender may attach to one message. At least one part must be
/// present after trimming the text.
#[derive(Debug, Clone, Default)]
pub struct MessageContent {
    pub text: Option<String>,
    pub image: Option<StoredAttachment>,
    pub file: Option<StoredAttachment>,
    pub shared_post_id: Option<i64>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            text: Some(body.into()),
            ..Self::default()
        }
    }

    fn normalized(mut self) -> ServiceResult<Self> {
        self.text = self
            .text
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        if self.text.is_none()
            && self.image.is_none()
            && self.file.is_none()
            && self.shared_post_id.is_none()
        {
            return Err(ServiceError::Validation(
                "message needs text or an attachment".into(),
            ));
        }
        Ok(self)
    }
}

/// A message rendered for clients, both over REST and inside
/// `message_created` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: i64,
    pub thread_id: i64,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
    pub text: String,
    pub image: Option<String>,
    pub file: Option<String>,
    pub file_name: Option<String>,
    pub shared_post_id: Option<i64>,
    pub created_at: String,
    pub time: String,
    pub read_by_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_own: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub count: usize,
    pub limit: usize,
    pub offset: usize,
    pub results: Vec<MessageView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub id: i64,
    pub partner: UserSummary,
    pub last_message: Option<String>,
    pub time: Option<String>,
    pub last_message_at: Option<String>,
    pub unread_count: usize,
    pub online: bool,
}

#[derive(Clone)]
pub struct ConversationService {
    database: Database,
    view: ViewConfig,
    presence: Presence,
}

impl ConversationService {
    pub fn new(database: Database, view: ViewConfig, presence: Presence) -> Self {
        Self {
            database,
            view,
            presence,
        }
    }

    /// Returns the one thread shared by the unordered pair, creating it on
    /// first contact. Concurrent first contacts converge on the same row
    /// through the unique pair key.
    pub async fn find_or_create_thread(&self, user_a: i64, user_b: i64) -> ServiceResult<ThreadRecord> {
        if user_a == user_b {
            return Err(ServiceError::Validation(
                "cannot start a conversation with yourself".into(),
            ));
        }
        self.database
            .run(move |repos| {
                for id in [user_a, user_b] {
                    if repos.users().get(id)?.is_none() {
                        return Err(ServiceError::NotFound(format!("user {id} not found")));
                    }
                }
                let pair_key = pair_key(user_a, user_b);
                let tx = repos
                    .conn()
                    .unchecked_transaction()
                    .map_err(anyhow::Error::from)?;
                let threads = repos.threads();
                threads.insert_if_absent(&pair_key, &now_utc_iso())?;
                let thread = threads.get_by_pair_key(&pair_key)?.ok_or_else(|| {
                    anyhow::anyhow!("thread for pair {pair_key} vanished after insert")
                })?;
                threads.add_participant(thread.id, user_a)?;
                threads.add_participant(thread.id, user_b)?;
                tx.commit().map_err(anyhow::Error::from)?;
                Ok(thread)
            })
            .await
    }

    /// Participants of the thread, provided `user_id` is one of them.
    pub async fn require_participant(&self, thread_id: i64, user_id: i64) -> ServiceResult<Vec<i64>> {
        self.database
            .run(move |repos| check_participant(&repos, thread_id, user_id))
            .await
    }

    pub async fn append_message(
        &self,
        thread_id: i64,
        sender_id: i64,
        content: MessageContent,
    ) -> ServiceResult<MessageView> {
        let content = content.normalized()?;
        let view = self.view.clone();
        self.database
            .run(move |repos| {
                check_participant(&repos, thread_id, sender_id)?;
                let created_at = now_utc_iso();
                let message = NewMessage {
                    thread_id,
                    sender_id,
                    text: content.text,
                    image_path: content.image.map(|image| image.stored_name),
                    file_name: content.file.as_ref().and_then(|f| f.original_name.clone()),
                    file_path: content.file.map(|file| file.stored_name),
                    shared_post_id: content.shared_post_id,
                    created_at: created_at.clone(),
                };
                let tx = repos
                    .conn()
                    .unchecked_transaction()
                    .map_err(anyhow::Error::from)?;
                let id = repos.messages().create(&message)?;
                repos.messages().mark_read(id, sender_id, &created_at)?;
                repos.threads().touch(thread_id, &created_at)?;
                tx.commit().map_err(anyhow::Error::from)?;
                let record = repos
                    .messages()
                    .get(id)?
                    .ok_or_else(|| anyhow::anyhow!("message {id} missing after insert"))?;
                Ok(render_message(&repos, &view, record)?)
            })
            .await
    }

    pub async fn unread_count(&self, thread_id: i64, user_id: i64) -> ServiceResult<usize> {
        self.database
            .run(move |repos| Ok(repos.messages().count_unread(thread_id, user_id)?))
            .await
    }

    pub async fn total_unread(&self, user_id: i64) -> ServiceResult<usize> {
        self.database
            .run(move |repos| Ok(repos.messages().count_unread_total(user_id)?))
            .await
    }

    /// Marks everything in the thread as read by `user_id` and returns the
    /// ids that were newly read, oldest first.
    pub async fn mark_thread_read(&self, thread_id: i64, user_id: i64) -> ServiceResult<Vec<i64>> {
        self.database
            .run(move |repos| {
                check_participant(&repos, thread_id, user_id)?;
                let now = now_utc_iso();
                let tx = repos
                    .conn()
                    .unchecked_transaction()
                    .map_err(anyhow::Error::from)?;
                let messages = repos.messages();
                let mut newly_read = Vec::new();
                for id in messages.unread_ids(thread_id, user_id)? {
                    if messages.mark_read(id, user_id, &now)? {
                        newly_read.push(id);
                    }
                }
                repos.threads().touch(thread_id, &now)?;
                tx.commit().map_err(anyhow::Error::from)?;
                Ok(newly_read)
            })
            .await
    }

    /// Conversation list for `user_id`, most recent message first. Reading
    /// a thread never moves it.
    pub async fn list_threads(&self, user_id: i64) -> ServiceResult<Vec<ConversationView>> {
        let view = self.view.clone();
        let mut conversations = self
            .database
            .run(move |repos| {
                let mut conversations = Vec::new();
                for activity in repos.threads().list_for_user(user_id)? {
                    let thread_id = activity.thread.id;
                    let partner = repos
                        .threads()
                        .participants(thread_id)?
                        .into_iter()
                        .find(|id| *id != user_id);
                    let Some(partner) = partner.map(|id| repos.users().get(id)).transpose()?.flatten()
                    else {
                        tracing::debug!(thread_id, "skipping thread without a partner");
                        continue;
                    };
                    let last = repos.messages().last_for_thread(thread_id)?;
                    conversations.push(ConversationView {
                        id: thread_id,
                        partner: partner.into(),
                        last_message: last.as_ref().map(preview),
                        time: last
                            .as_ref()
                            .map(|message| clock_time(&message.created_at, view.utc_offset)),
                        last_message_at: activity.last_message_at,
                        unread_count: repos.messages().count_unread(thread_id, user_id)?,
                        online: false,
                    });
                }
                Ok::<_, ServiceError>(conversations)
            })
            .await?;
        for conversation in &mut conversations {
            conversation.online = self.presence.is_online(conversation.partner.id).await;
        }
        Ok(conversations)
    }

    pub async fn messages(
        &self,
        thread_id: i64,
        viewer_id: i64,
        limit: usize,
        offset: usize,
    ) -> ServiceResult<MessagePage> {
        let view = self.view.clone();
        self.database
            .run(move |repos| {
                check_participant(&repos, thread_id, viewer_id)?;
                let count = repos.messages().count_for_thread(thread_id)?;
                let mut results = Vec::new();
                for record in repos.messages().list_for_thread(thread_id, limit, offset)? {
                    let mut message = render_message(&repos, &view, record)?;
                    message.is_own = Some(message.sender_id == Some(viewer_id));
                    results.push(message);
                }
                Ok(MessagePage {
                    count,
                    limit,
                    offset,
                    results,
                })
            })
            .await
    }

    /// Deletes the thread with its messages and read receipts in one
    /// transaction. Returns the former participants.
    pub async fn delete_thread(&self, thread_id: i64, user_id: i64) -> ServiceResult<Vec<i64>> {
        self.database
            .run(move |repos| {
                let participants = check_participant(&repos, thread_id, user_id)?;
                let tx = repos
                    .conn()
                    .unchecked_transaction()
                    .map_err(anyhow::Error::from)?;
                let removed = repos.messages().delete_for_thread(thread_id)?;
                repos.threads().delete(thread_id)?;
                tx.commit().map_err(anyhow::Error::from)?;
                tracing::info!(thread_id, user_id, messages = removed, "thread deleted");
                Ok(participants)
            })
            .await
    }

    pub async fn partners_of(&self, user_id: i64) -> ServiceResult<Vec<i64>> {
        self.database
            .run(move |repos| Ok(repos.threads().partners_of(user_id)?))
            .await
    }
}

fn pair_key(user_a: i64, user_b: i64) -> String {
    format!("{}:{}", user_a.min(user_b), user_a.max(user_b))
}

fn check_participant(
    repos: &SqliteRepositories<'_>,
    thread_id: i64,
    user_id: i64,
) -> ServiceResult<Vec<i64>> {
    if repos.threads().get(thread_id)?.is_none() {
        return Err(ServiceError::NotFound(format!("thread {thread_id} not found")));
    }
    let participants = repos.threads().participants(thread_id)?;
    if !participants.contains(&user_id) {
        return Err(ServiceError::Forbidden(
            "not a participant of this thread".into(),
        ));
    }
    Ok(participants)
}

fn render_message(
    repos: &SqliteRepositories<'_>,
    view: &ViewConfig,
    record: MessageRecord,
) -> anyhow::Result<MessageView> {
    let sender: Option<UserRecord> = repos.users().get(record.sender_id)?;
    let read_by_ids = repos.messages().readers(record.id)?;
    Ok(MessageView {
        id: record.id,
        thread_id: record.thread_id,
        sender: sender.map(|user| user.username).unwrap_or_default(),
        sender_id: Some(record.sender_id),
        text: record.text.unwrap_or_default(),
        image: record.image_path.as_deref().map(|name| view.media_url(name)),
        file: record.file_path.as_deref().map(|name| view.media_url(name)),
        file_name: record.file_name,
        shared_post_id: record.shared_post_id,
        time: clock_time(&record.created_at, view.utc_offset),
        created_at: record.created_at,
        read_by_ids,
        is_own: None,
    })
}

fn preview(message: &MessageRecord) -> String {
    if let Some(text) = message.text.as_deref().filter(|text| !text.is_empty()) {
        return text.chars().take(PREVIEW_CHARS).collect();
    }
    if message.image_path.is_some() {
        "[image]".into()
    } else if message.file_path.is_some() {
        "[file]".into()
    } else {
        "[shared post]".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserService;
    use rusqlite::Connection;
    use std::time::Duration;

    struct Fixture {
        db: Database,
        conversations: ConversationService,
        alice: i64,
        bob: i64,
        carol: i64,
    }

    async fn fixture() -> Fixture {
        let db = Database::from_connection(Connection::open_in_memory().unwrap(), true);
        db.ensure_migrations().unwrap();
        let users = UserService::new(db.clone());
        let alice = users.create_user("alice", None).await.unwrap().id;
        let bob = users.create_user("bob", None).await.unwrap().id;
        let carol = users.create_user("carol", None).await.unwrap().id;
        let conversations = ConversationService::new(
            db.clone(),
            ViewConfig::default(),
            Presence::in_memory(Duration::from_secs(60)),
        );
        Fixture {
            db,
            conversations,
            alice,
            bob,
            carol,
        }
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent_for_unordered_pair() {
        let f = fixture().await;
        let first = f.conversations.find_or_create_thread(f.alice, f.bob).await.unwrap();
        let second = f.conversations.find_or_create_thread(f.bob, f.alice).await.unwrap();
        assert_eq!(first.id, second.id);
        let participants = f.conversations.require_participant(first.id, f.alice).await.unwrap();
        assert_eq!(participants, vec![f.alice, f.bob]);
    }

    fn reject_inserts_into(db: &Database, table: &str) {
        let sql = format!(
            "CREATE TRIGGER reject_{table} BEFORE INSERT ON {table} \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;"
        );
        db.with_repositories(|repos| Ok(repos.conn().execute_batch(&sql)?))
            .unwrap();
    }

    fn row_count(db: &Database, table: &str) -> i64 {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        db.with_repositories(|repos| Ok(repos.conn().query_row(&sql, [], |row| row.get(0))?))
            .unwrap()
    }

    #[tokio::test]
    async fn failed_receipt_rolls_back_the_message() {
        let f = fixture().await;
        let thread = f.conversations.find_or_create_thread(f.alice, f.bob).await.unwrap();
        reject_inserts_into(&f.db, "message_reads");

        let result = f
            .conversations
            .append_message(thread.id, f.alice, MessageContent::text("hi"))
            .await;
        assert!(matches!(result, Err(ServiceError::Internal(_))));
        assert_eq!(row_count(&f.db, "messages"), 0);
    }

    #[tokio::test]
    async fn failed_participant_insert_leaves_no_thread() {
        let f = fixture().await;
        reject_inserts_into(&f.db, "thread_participants");

        assert!(f.conversations.find_or_create_thread(f.alice, f.bob).await.is_err());
        assert_eq!(row_count(&f.db, "threads"), 0);
    }

    #[tokio::test]
    async fn self_and_unknown_pairs_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.conversations.find_or_create_thread(f.alice, f.alice).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            f.conversations.find_or_create_thread(f.alice, 999).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn sender_reads_own_message_and_partner_sees_unread() {
        let f = fixture().await;
        let thread = f.conversations.find_or_create_thread(f.alice, f.bob).await.unwrap();
        let message = f
            .conversations
            .append_message(thread.id, f.alice, MessageContent::text("  hi  "))
            .await
            .unwrap();
        assert_eq!(message.text, "hi");
        assert_eq!(message.sender, "alice");
        assert_eq!(message.read_by_ids, vec![f.alice]);
        assert_eq!(f.conversations.unread_count(thread.id, f.bob).await.unwrap(), 1);
        assert_eq!(f.conversations.unread_count(thread.id, f.alice).await.unwrap(), 0);

        let newly_read = f.conversations.mark_thread_read(thread.id, f.bob).await.unwrap();
        assert_eq!(newly_read, vec![message.id]);
        assert_eq!(f.conversations.unread_count(thread.id, f.bob).await.unwrap(), 0);
        assert!(f.conversations.mark_thread_read(thread.id, f.bob).await.unwrap().is_empty());

        f.conversations
            .append_message(thread.id, f.alice, MessageContent::text("again"))
            .await
            .unwrap();
        assert_eq!(f.conversations.total_unread(f.bob).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_message_and_outsiders_rejected() {
        let f = fixture().await;
        let thread = f.conversations.find_or_create_thread(f.alice, f.bob).await.unwrap();
        assert!(matches!(
            f.conversations
                .append_message(thread.id, f.alice, MessageContent::text("   "))
                .await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            f.conversations
                .append_message(thread.id, f.carol, MessageContent::text("hello"))
                .await,
            Err(ServiceError::Forbidden(_))
        ));
        assert!(matches!(
            f.conversations.require_participant(4242, f.alice).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reading_does_not_reorder_conversation_list() {
        let f = fixture().await;
        let with_bob = f.conversations.find_or_create_thread(f.alice, f.bob).await.unwrap();
        let with_carol = f.conversations.find_or_create_thread(f.alice, f.carol).await.unwrap();
        f.conversations
            .append_message(with_bob.id, f.bob, MessageContent::text("older"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.conversations
            .append_message(with_carol.id, f.carol, MessageContent::text("newer"))
            .await
            .unwrap();

        let order = |list: Vec<ConversationView>| list.into_iter().map(|c| c.id).collect::<Vec<_>>();
        let before = order(f.conversations.list_threads(f.alice).await.unwrap());
        assert_eq!(before, vec![with_carol.id, with_bob.id]);

        tokio::time::sleep(Duration::from_millis(5)).await;
        f.conversations.mark_thread_read(with_bob.id, f.alice).await.unwrap();
        let after = f.conversations.list_threads(f.alice).await.unwrap();
        assert_eq!(order(after.clone()), before);
        assert_eq!(after[1].unread_count, 0);
        assert_eq!(after[0].unread_count, 1);
        assert_eq!(after[0].partner.username, "carol");
        assert_eq!(after[0].last_message.as_deref(), Some("newer"));
    }

    #[tokio::test]
    async fn history_is_paginated_oldest_first() {
        let f = fixture().await;
        let thread = f.conversations.find_or_create_thread(f.alice, f.bob).await.unwrap();
        for n in 0..5 {
            f.conversations
                .append_message(thread.id, f.alice, MessageContent::text(format!("m{n}")))
                .await
                .unwrap();
        }
        let page = f.conversations.messages(thread.id, f.bob, 2, 1).await.unwrap();
        assert_eq!(page.count, 5);
        let texts: Vec<_> = page.results.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m1", "m2"]);
        assert!(page.results.iter().all(|m| m.is_own == Some(false)));
    }

    #[tokio::test]
    async fn delete_thread_cascades_and_checks_participation() {
        let f = fixture().await;
        let thread = f.conversations.find_or_create_thread(f.alice, f.bob).await.unwrap();
        f.conversations
            .append_message(thread.id, f.alice, MessageContent::text("bye"))
            .await
            .unwrap();
        assert!(matches!(
            f.conversations.delete_thread(thread.id, f.carol).await,
            Err(ServiceError::Forbidden(_))
        ));
        let participants = f.conversations.delete_thread(thread.id, f.bob).await.unwrap();
        assert_eq!(participants, vec![f.alice, f.bob]);
        assert!(f.conversations.list_threads(f.alice).await.unwrap().is_empty());
        assert_eq!(f.conversations.total_unread(f.bob).await.unwrap(), 0);
    }

    #[test]
    fn preview_falls_back_to_attachment_labels() {
        let mut record = MessageRecord {
            id: 1,
            thread_id: 1,
            sender_id: 1,
            text: None,
            image_path: Some("a.png".into()),
            file_path: None,
            file_name: None,
            shared_post_id: None,
            created_at: now_utc_iso(),
        };
        assert_eq!(preview(&record), "[image]");
        record.image_path = None;
        record.shared_post_id = Some(3);
        assert_eq!(preview(&record), "[shared post]");
    }
}
