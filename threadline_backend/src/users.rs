use crate::database::models::UserRecord;
use crate::database::repositories::UserRepository;
use crate::database::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::utils::now_utc_iso;
use serde::{Deserialize, Serialize};

/// Public face of a user embedded in conversation and notification views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
    pub avatar: Option<String>,
}

impl From<UserRecord> for UserSummary {
    fn from(record: UserRecord) -> Self {
        Self {
            id: record.id,
            username: record.username,
            avatar: record.avatar,
        }
    }
}

#[derive(Clone)]
pub struct UserService {
    database: Database,
}

impl UserService {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn create_user(
        &self,
        username: &str,
        avatar: Option<String>,
    ) -> ServiceResult<UserRecord> {
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(ServiceError::Validation("username must not be empty".into()));
        }
        self.database
            .run(move |repos| {
                let users = repos.users();
                if users.get_by_username(&username)?.is_some() {
                    return Err(ServiceError::Conflict(format!(
                        "username {username} is taken"
                    )));
                }
                let created_at = now_utc_iso();
                let id = users.create(&username, avatar.as_deref(), &created_at)?;
                Ok(UserRecord {
                    id,
                    username,
                    avatar,
                    created_at,
                })
            })
            .await
    }

    pub async fn get(&self, id: i64) -> ServiceResult<Option<UserRecord>> {
        self.database
            .run(move |repos| Ok(repos.users().get(id)?))
            .await
    }

    pub async fn require(&self, id: i64) -> ServiceResult<UserRecord> {
        self.get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {id} not found")))
    }

    pub async fn get_by_username(&self, username: &str) -> ServiceResult<Option<UserRecord>> {
        let username = username.to_string();
        self.database
            .run(move |repos| Ok(repos.users().get_by_username(&username)?))
            .await
    }
}
