use crate::database::models::FollowRecord;
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

pub(super) struct SqliteFollowRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

impl<'conn> super::FollowRepository for SqliteFollowRepository<'conn> {
    fn create(&self, record: &FollowRecord) -> Result<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO follows (follower_id, followee_id, created_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![record.follower_id, record.followee_id, record.created_at],
        )?;
        Ok(inserted > 0)
    }

    fn delete(&self, follower_id: i64, followee_id: i64) -> Result<bool> {
        let deleted = self.conn.execute(
            r#"
            DELETE FROM follows
            WHERE follower_id = ?1 AND followee_id = ?2
            "#,
            params![follower_id, followee_id],
        )?;
        Ok(deleted > 0)
    }

    fn exists(&self, follower_id: i64, followee_id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM follows WHERE follower_id = ?1 AND followee_id = ?2",
                params![follower_id, followee_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
