mod follows;
mod messages;
mod notifications;
mod threads;
mod users;

use super::models::{
    FollowRecord, MessageRecord, NewMessage, NewNotification, NotificationRecord, ThreadActivity,
    ThreadRecord, UserRecord,
};
use anyhow::Result;
use rusqlite::Connection;

pub trait UserRepository {
    fn create(&self, username: &str, avatar: Option<&str>, created_at: &str) -> Result<i64>;
    fn get(&self, id: i64) -> Result<Option<UserRecord>>;
    fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>>;
}

pub trait ThreadRepository {
    /// Inserts a thread for `pair_key` unless one already exists.
    fn insert_if_absent(&self, pair_key: &str, created_at: &str) -> Result<()>;
    fn get(&self, id: i64) -> Result<Option<ThreadRecord>>;
    fn get_by_pair_key(&self, pair_key: &str) -> Result<Option<ThreadRecord>>;
    fn add_participant(&self, thread_id: i64, user_id: i64) -> Result<()>;
    fn participants(&self, thread_id: i64) -> Result<Vec<i64>>;
    /// Threads containing `user_id`, newest message first. Threads without
    /// messages sort by creation time.
    fn list_for_user(&self, user_id: i64) -> Result<Vec<ThreadActivity>>;
    /// Every user that shares at least one thread with `user_id`.
    fn partners_of(&self, user_id: i64) -> Result<Vec<i64>>;
    fn touch(&self, thread_id: i64, at: &str) -> Result<()>;
    fn delete(&self, thread_id: i64) -> Result<bool>;
}

pub trait MessageRepository {
    fn create(&self, message: &NewMessage) -> Result<i64>;
    fn get(&self, id: i64) -> Result<Option<MessageRecord>>;
    /// Oldest first.
    fn list_for_thread(&self, thread_id: i64, limit: usize, offset: usize)
        -> Result<Vec<MessageRecord>>;
    fn count_for_thread(&self, thread_id: i64) -> Result<usize>;
    fn last_for_thread(&self, thread_id: i64) -> Result<Option<MessageRecord>>;
    fn readers(&self, message_id: i64) -> Result<Vec<i64>>;
    /// Returns true when the read was newly recorded.
    fn mark_read(&self, message_id: i64, user_id: i64, read_at: &str) -> Result<bool>;
    /// Messages in the thread neither sent nor yet read by `user_id`, oldest first.
    fn unread_ids(&self, thread_id: i64, user_id: i64) -> Result<Vec<i64>>;
    fn count_unread(&self, thread_id: i64, user_id: i64) -> Result<usize>;
    fn count_unread_total(&self, user_id: i64) -> Result<usize>;
    fn delete_for_thread(&self, thread_id: i64) -> Result<usize>;
}

pub trait NotificationRepository {
    fn create(&self, notification: &NewNotification) -> Result<i64>;
    fn get(&self, id: i64) -> Result<Option<NotificationRecord>>;
    /// Newest first.
    fn list_for_recipient(
        &self,
        recipient_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<NotificationRecord>>;
    fn count_for_recipient(&self, recipient_id: i64) -> Result<usize>;
    fn count_unread(&self, recipient_id: i64) -> Result<usize>;
    fn mark_all_read(&self, recipient_id: i64) -> Result<usize>;
    fn mark_read(&self, id: i64, recipient_id: i64) -> Result<bool>;
    fn delete_by_kind(&self, sender_id: i64, recipient_id: i64, kind: &str) -> Result<usize>;
}

pub trait FollowRepository {
    /// Returns false when the relationship already existed.
    fn create(&self, record: &FollowRecord) -> Result<bool>;
    fn delete(&self, follower_id: i64, followee_id: i64) -> Result<bool>;
    fn exists(&self, follower_id: i64, followee_id: i64) -> Result<bool>;
}

/// Hands out rusqlite-backed repositories bound to one locked connection.
pub struct SqliteRepositories<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRepositories<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn users(&self) -> impl UserRepository + '_ {
        users::SqliteUserRepository { conn: self.conn }
    }

    pub fn threads(&self) -> impl ThreadRepository + '_ {
        threads::SqliteThreadRepository { conn: self.conn }
    }

    pub fn messages(&self) -> impl MessageRepository + '_ {
        messages::SqliteMessageRepository { conn: self.conn }
    }

    pub fn notifications(&self) -> impl NotificationRepository + '_ {
        notifications::SqliteNotificationRepository { conn: self.conn }
    }

    pub fn follows(&self) -> impl FollowRepository + '_ {
        follows::SqliteFollowRepository { conn: self.conn }
    }

    pub fn conn(&self) -> &'conn Connection {
        self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::utils::now_utc_iso;

    fn setup() -> Database {
        let conn = Connection::open_in_memory().expect("in-memory db");
        let db = Database::from_connection(conn, true);
        db.ensure_migrations().expect("migrations");
        db
    }

    fn text_message(thread_id: i64, sender_id: i64, text: &str) -> NewMessage {
        NewMessage {
            thread_id,
            sender_id,
            text: Some(text.into()),
            image_path: None,
            file_path: None,
            file_name: None,
            shared_post_id: None,
            created_at: now_utc_iso(),
        }
    }

    #[test]
    fn pair_key_is_unique() {
        let db = setup();
        db.with_repositories(|repos| {
            let threads = repos.threads();
            threads.insert_if_absent("1:2", &now_utc_iso())?;
            threads.insert_if_absent("1:2", &now_utc_iso())?;
            let count: i64 =
                repos
                    .conn()
                    .query_row("SELECT COUNT(*) FROM threads", [], |row| row.get(0))?;
            assert_eq!(count, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn unread_excludes_own_and_read_messages() {
        let db = setup();
        db.with_repositories(|repos| {
            let alice = repos.users().create("alice", None, &now_utc_iso())?;
            let bob = repos.users().create("bob", None, &now_utc_iso())?;
            repos.threads().insert_if_absent("1:2", &now_utc_iso())?;
            let thread = repos.threads().get_by_pair_key("1:2")?.unwrap();
            repos.threads().add_participant(thread.id, alice)?;
            repos.threads().add_participant(thread.id, bob)?;

            let messages = repos.messages();
            let first = messages.create(&text_message(thread.id, alice, "hi"))?;
            messages.create(&text_message(thread.id, bob, "hey"))?;
            assert_eq!(messages.count_unread(thread.id, bob)?, 1);
            assert_eq!(messages.unread_ids(thread.id, bob)?, vec![first]);

            assert!(messages.mark_read(first, bob, &now_utc_iso())?);
            assert!(!messages.mark_read(first, bob, &now_utc_iso())?);
            assert_eq!(messages.count_unread(thread.id, bob)?, 0);
            assert_eq!(messages.readers(first)?, vec![bob]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn message_without_content_is_rejected_by_schema() {
        let db = setup();
        let result = db.with_repositories(|repos| {
            let alice = repos.users().create("alice", None, &now_utc_iso())?;
            repos.threads().insert_if_absent("1:1", &now_utc_iso())?;
            let thread = repos.threads().get_by_pair_key("1:1")?.unwrap();
            repos.messages().create(&text_message(thread.id, alice, "   "))
        });
        assert!(result.is_err());
    }
}
