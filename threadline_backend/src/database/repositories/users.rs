use crate::database::models::UserRecord;
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(super) struct SqliteUserRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        avatar: row.get(2)?,
        created_at: row.get(3)?,
    })
}

impl<'conn> super::UserRepository for SqliteUserRepository<'conn> {
    fn create(&self, username: &str, avatar: Option<&str>, created_at: &str) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO users (username, avatar, created_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![username, avatar, created_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get(&self, id: i64) -> Result<Option<UserRecord>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, username, avatar, created_at
                FROM users
                WHERE id = ?1
                "#,
                params![id],
                map_user,
            )
            .optional()?;
        Ok(row)
    }

    fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, username, avatar, created_at
                FROM users
                WHERE username = ?1
                "#,
                params![username],
                map_user,
            )
            .optional()?;
        Ok(row)
    }
}
