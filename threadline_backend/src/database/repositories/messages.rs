use crate::database::models::{MessageRecord, NewMessage};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(super) struct SqliteMessageRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

const MESSAGE_COLUMNS: &str = "id, thread_id, sender_id, text, image_path, file_path, file_name, shared_post_id, created_at";

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        sender_id: row.get(2)?,
        text: row.get(3)?,
        image_path: row.get(4)?,
        file_path: row.get(5)?,
        file_name: row.get(6)?,
        shared_post_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn count(value: i64) -> usize {
    usize::try_from(value).unwrap_or_default()
}

impl<'conn> super::MessageRepository for SqliteMessageRepository<'conn> {
    fn create(&self, message: &NewMessage) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO messages (thread_id, sender_id, text, image_path, file_path, file_name, shared_post_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                message.thread_id,
                message.sender_id,
                message.text,
                message.image_path,
                message.file_path,
                message.file_name,
                message.shared_post_id,
                message.created_at
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get(&self, id: i64) -> Result<Option<MessageRecord>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], map_message)
            .optional()?;
        Ok(row)
    }

    fn list_for_thread(
        &self,
        thread_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MessageRecord>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 \
             ORDER BY created_at ASC, id ASC LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![thread_id, limit as i64, offset as i64],
            map_message,
        )?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn count_for_thread(&self, thread_id: i64) -> Result<usize> {
        let total: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*)
            FROM messages
            WHERE thread_id = ?1
            "#,
            params![thread_id],
            |row| row.get(0),
        )?;
        Ok(count(total))
    }

    fn last_for_thread(&self, thread_id: i64) -> Result<Option<MessageRecord>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&sql, params![thread_id], map_message)
            .optional()?;
        Ok(row)
    }

    fn readers(&self, message_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT user_id
            FROM message_reads
            WHERE message_id = ?1
            ORDER BY read_at ASC, user_id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![message_id], |row| row.get(0))?;
        let mut readers = Vec::new();
        for row in rows {
            readers.push(row?);
        }
        Ok(readers)
    }

    fn mark_read(&self, message_id: i64, user_id: i64, read_at: &str) -> Result<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![message_id, user_id, read_at],
        )?;
        Ok(inserted > 0)
    }

    fn unread_ids(&self, thread_id: i64, user_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT m.id
            FROM messages m
            WHERE m.thread_id = ?1
              AND m.sender_id <> ?2
              AND NOT EXISTS (
                  SELECT 1 FROM message_reads r
                  WHERE r.message_id = m.id AND r.user_id = ?2
              )
            ORDER BY m.created_at ASC, m.id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![thread_id, user_id], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    fn count_unread(&self, thread_id: i64, user_id: i64) -> Result<usize> {
        let total: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*)
            FROM messages m
            WHERE m.thread_id = ?1
              AND m.sender_id <> ?2
              AND NOT EXISTS (
                  SELECT 1 FROM message_reads r
                  WHERE r.message_id = m.id AND r.user_id = ?2
              )
            "#,
            params![thread_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count(total))
    }

    fn count_unread_total(&self, user_id: i64) -> Result<usize> {
        let total: i64 = self.conn.query_row(
            r#"
            SELECT COUNT(*)
            FROM messages m
            JOIN thread_participants tp ON tp.thread_id = m.thread_id AND tp.user_id = ?1
            WHERE m.sender_id <> ?1
              AND NOT EXISTS (
                  SELECT 1 FROM message_reads r
                  WHERE r.message_id = m.id AND r.user_id = ?1
              )
            "#,
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count(total))
    }

    fn delete_for_thread(&self, thread_id: i64) -> Result<usize> {
        self.conn.execute(
            r#"
            DELETE FROM message_reads
            WHERE message_id IN (SELECT id FROM messages WHERE thread_id = ?1)
            "#,
            params![thread_id],
        )?;
        let deleted = self.conn.execute(
            r#"
            DELETE FROM messages
            WHERE thread_id = ?1
            "#,
            params![thread_id],
        )?;
        Ok(deleted)
    }
}
