use crate::database::models::{ThreadActivity, ThreadRecord};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(super) struct SqliteThreadRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

fn map_thread(row: &Row<'_>) -> rusqlite::Result<ThreadRecord> {
    Ok(ThreadRecord {
        id: row.get(0)?,
        pair_key: row.get(1)?,
        created_at: row.get(2)?,
        last_activity_at: row.get(3)?,
    })
}

impl<'conn> super::ThreadRepository for SqliteThreadRepository<'conn> {
    fn insert_if_absent(&self, pair_key: &str, created_at: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO threads (pair_key, created_at, last_activity_at)
            VALUES (?1, ?2, ?2)
            ON CONFLICT(pair_key) DO NOTHING
            "#,
            params![pair_key, created_at],
        )?;
        Ok(())
    }

    fn get(&self, id: i64) -> Result<Option<ThreadRecord>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, pair_key, created_at, last_activity_at
                FROM threads
                WHERE id = ?1
                "#,
                params![id],
                map_thread,
            )
            .optional()?;
        Ok(row)
    }

    fn get_by_pair_key(&self, pair_key: &str) -> Result<Option<ThreadRecord>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, pair_key, created_at, last_activity_at
                FROM threads
                WHERE pair_key = ?1
                "#,
                params![pair_key],
                map_thread,
            )
            .optional()?;
        Ok(row)
    }

    fn add_participant(&self, thread_id: i64, user_id: i64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO thread_participants (thread_id, user_id)
            VALUES (?1, ?2)
            "#,
            params![thread_id, user_id],
        )?;
        Ok(())
    }

    fn participants(&self, thread_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT user_id
            FROM thread_participants
            WHERE thread_id = ?1
            ORDER BY user_id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![thread_id], |row| row.get(0))?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    fn list_for_user(&self, user_id: i64) -> Result<Vec<ThreadActivity>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, pair_key, created_at, last_activity_at, last_message_at
            FROM (
                SELECT t.id, t.pair_key, t.created_at, t.last_activity_at,
                       (SELECT MAX(m.created_at) FROM messages m WHERE m.thread_id = t.id) AS last_message_at
                FROM threads t
                JOIN thread_participants tp ON tp.thread_id = t.id
                WHERE tp.user_id = ?1
            )
            ORDER BY COALESCE(last_message_at, created_at) DESC, id DESC
            "#,
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(ThreadActivity {
                thread: map_thread(row)?,
                last_message_at: row.get(4)?,
            })
        })?;
        let mut threads = Vec::new();
        for row in rows {
            threads.push(row?);
        }
        Ok(threads)
    }

    fn partners_of(&self, user_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT DISTINCT other.user_id
            FROM thread_participants mine
            JOIN thread_participants other ON other.thread_id = mine.thread_id
            WHERE mine.user_id = ?1 AND other.user_id <> ?1
            ORDER BY other.user_id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    fn touch(&self, thread_id: i64, at: &str) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE threads
            SET last_activity_at = ?1
            WHERE id = ?2
            "#,
            params![at, thread_id],
        )?;
        Ok(())
    }

    fn delete(&self, thread_id: i64) -> Result<bool> {
        let removed = self.conn.execute(
            r#"
            DELETE FROM thread_participants
            WHERE thread_id = ?1
            "#,
            params![thread_id],
        )?;
        tracing::debug!(thread_id, participants = removed, "removed thread participants");
        let deleted = self.conn.execute(
            r#"
            DELETE FROM threads
            WHERE id = ?1
            "#,
            params![thread_id],
        )?;
        Ok(deleted > 0)
    }
}
