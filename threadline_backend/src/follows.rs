use crate::database::models::FollowRecord;
use crate::database::repositories::{FollowRepository, NotificationRepository, UserRepository};
use crate::database::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::notifications::{NotificationKind, NotificationService};
use crate::utils::now_utc_iso;

const FOLLOW_MESSAGE: &str = "started following you";

#[derive(Clone)]
pub struct FollowService {
    database: Database,
    notifications: NotificationService,
}

impl FollowService {
    pub fn new(database: Database, notifications: NotificationService) -> Self {
        Self {
            database,
            notifications,
        }
    }

    pub async fn follow(&self, follower_id: i64, followee_id: i64) -> ServiceResult<FollowRecord> {
        if follower_id == followee_id {
            return Err(ServiceError::Validation("you cannot follow yourself".into()));
        }
        let record = self
            .database
            .run(move |repos| {
                if repos.users().get(followee_id)?.is_none() {
                    return Err(ServiceError::NotFound(format!("user {followee_id} not found")));
                }
                let record = FollowRecord {
                    follower_id,
                    followee_id,
                    created_at: now_utc_iso(),
                };
                if !repos.follows().create(&record)? {
                    return Err(ServiceError::Conflict("already following this user".into()));
                }
                Ok(record)
            })
            .await?;

        if let Err(err) = self
            .notifications
            .notify(follower_id, followee_id, NotificationKind::Follow, None, FOLLOW_MESSAGE)
            .await
        {
            tracing::warn!(follower_id, followee_id, error = %err, "follow notification not recorded");
        }
        Ok(record)
    }

    /// Removes the follow together with the notification it produced.
    pub async fn unfollow(&self, follower_id: i64, followee_id: i64) -> ServiceResult<()> {
        self.database
            .run(move |repos| {
                let tx = repos
                    .conn()
                    .unchecked_transaction()
                    .map_err(anyhow::Error::from)?;
                if !repos.follows().delete(follower_id, followee_id)? {
                    return Err(ServiceError::NotFound("not following this user".into()));
                }
                repos.notifications().delete_by_kind(
                    follower_id,
                    followee_id,
                    NotificationKind::Follow.as_str(),
                )?;
                tx.commit().map_err(anyhow::Error::from)?;
                Ok(())
            })
            .await
    }

    pub async fn is_following(&self, follower_id: i64, followee_id: i64) -> ServiceResult<bool> {
        self.database
            .run(move |repos| Ok(repos.follows().exists(follower_id, followee_id)?))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::groups::GroupHub;
    use crate::users::UserService;
    use rusqlite::Connection;
    use std::sync::Arc;

    async fn setup() -> (FollowService, NotificationService, i64, i64) {
        let db = Database::from_connection(Connection::open_in_memory().unwrap(), true);
        db.ensure_migrations().unwrap();
        let users = UserService::new(db.clone());
        let alice = users.create_user("alice", None).await.unwrap().id;
        let bob = users.create_user("bob", None).await.unwrap().id;
        let notifications = NotificationService::new(db.clone(), Arc::new(GroupHub::new()));
        (FollowService::new(db, notifications.clone()), notifications, alice, bob)
    }

    #[tokio::test]
    async fn follow_notifies_and_rejects_duplicates() {
        let (follows, notifications, alice, bob) = setup().await;
        follows.follow(alice, bob).await.unwrap();
        assert!(follows.is_following(alice, bob).await.unwrap());
        assert_eq!(notifications.unread_count(bob).await.unwrap(), 1);

        assert!(matches!(
            follows.follow(alice, bob).await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            follows.follow(alice, alice).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            follows.follow(alice, 99).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unfollow_removes_follow_notification() {
        let (follows, notifications, alice, bob) = setup().await;
        follows.follow(alice, bob).await.unwrap();
        follows.unfollow(alice, bob).await.unwrap();
        assert!(!follows.is_following(alice, bob).await.unwrap());
        assert_eq!(notifications.list(bob, 20, 0).await.unwrap().count, 0);
        assert!(matches!(
            follows.unfollow(alice, bob).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
