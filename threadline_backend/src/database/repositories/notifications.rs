use crate::database::models::{NewNotification, NotificationRecord};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(super) struct SqliteNotificationRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

fn map_notification(row: &Row<'_>) -> rusqlite::Result<NotificationRecord> {
    Ok(NotificationRecord {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        sender_id: row.get(2)?,
        kind: row.get(3)?,
        post_id: row.get(4)?,
        content: row.get(5)?,
        created_at: row.get(6)?,
        is_read: row.get::<_, i64>(7)? != 0,
    })
}

impl<'conn> super::NotificationRepository for SqliteNotificationRepository<'conn> {
    fn create(&self, notification: &NewNotification) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO notifications (recipient_id, sender_id, kind, post_id, content, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                notification.recipient_id,
                notification.sender_id,
                notification.kind,
                notification.post_id,
                notification.content,
                notification.created_at
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get(&self, id: i64) -> Result<Option<NotificationRecord>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, recipient_id, sender_id, kind, post_id, content, created_at, is_read
                FROM notifications
                WHERE id = ?1
                "#,
                params![id],
                map_notification,
            )
            .optional()?;
        Ok(row)
    }

    fn list_for_recipient(
        &self,
        recipient_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<NotificationRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, recipient_id, sender_id, kind, post_id, content, created_at, is_read
            FROM notifications
            WHERE recipient_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )?;
        let rows = stmt.query_map(
            params![recipient_id, limit as i64, offset as i64],
            map_notification,
        )?;
        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    fn count_for_recipient(&self, recipient_id: i64) -> Result<usize> {
        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1",
            params![recipient_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(total).unwrap_or_default())
    }

    fn count_unread(&self, recipient_id: i64) -> Result<usize> {
        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND is_read = 0",
            params![recipient_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(total).unwrap_or_default())
    }

    fn mark_all_read(&self, recipient_id: i64) -> Result<usize> {
        let updated = self.conn.execute(
            r#"
            UPDATE notifications
            SET is_read = 1
            WHERE recipient_id = ?1 AND is_read = 0
            "#,
            params![recipient_id],
        )?;
        Ok(updated)
    }

    fn mark_read(&self, id: i64, recipient_id: i64) -> Result<bool> {
        let updated = self.conn.execute(
            r#"
            UPDATE notifications
            SET is_read = 1
            WHERE id = ?1 AND recipient_id = ?2
            "#,
            params![id, recipient_id],
        )?;
        Ok(updated > 0)
    }

    fn delete_by_kind(&self, sender_id: i64, recipient_id: i64, kind: &str) -> Result<usize> {
        let deleted = self.conn.execute(
            r#"
            DELETE FROM notifications
            WHERE sender_id = ?1 AND recipient_id = ?2 AND kind = ?3
            "#,
            params![sender_id, recipient_id, kind],
        )?;
        Ok(deleted)
    }
}
