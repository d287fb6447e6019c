//! Durable notifications with best-effort live delivery.

use crate::database::models::{NewNotification, NotificationRecord};
use crate::database::repositories::{NotificationRepository, UserRepository};
use crate::database::Database;
use crate::error::{ServiceError, ServiceResult};
use crate::realtime::events::RealtimeEvent;
use crate::realtime::groups::{user_group, EventBus};
use crate::users::UserSummary;
use crate::utils::{now_utc_iso, time_since};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Like,
    Comment,
    Follow,
    Mention,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Like => "like",
            NotificationKind::Comment => "comment",
            NotificationKind::Follow => "follow",
            NotificationKind::Mention => "mention",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationView {
    pub id: i64,
    pub notification_type: String,
    pub user: UserSummary,
    pub content: String,
    pub post_id: Option<i64>,
    pub created_at: String,
    pub time: String,
    pub is_read: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationPage {
    pub count: usize,
    pub unread_count: usize,
    pub results: Vec<NotificationView>,
}

#[derive(Clone)]
pub struct NotificationService {
    database: Database,
    bus: Arc<dyn EventBus>,
}

impl NotificationService {
    pub fn new(database: Database, bus: Arc<dyn EventBus>) -> Self {
        Self { database, bus }
    }

    /// Persists a notification and pushes it to the recipient's personal
    /// group. Self-notifications are skipped. Only persistence failures are
    /// returned; delivery failures are logged.
    pub async fn notify(
        &self,
        sender_id: i64,
        recipient_id: i64,
        kind: NotificationKind,
        post_id: Option<i64>,
        content: &str,
    ) -> ServiceResult<Option<NotificationView>> {
        if sender_id == recipient_id {
            return Ok(None);
        }
        let record = NewNotification {
            recipient_id,
            sender_id,
            kind: kind.as_str().to_string(),
            post_id,
            content: content.to_string(),
            created_at: now_utc_iso(),
        };
        let view = self
            .database
            .run(move |repos| {
                let id = repos.notifications().create(&record)?;
                let stored = repos
                    .notifications()
                    .get(id)?
                    .ok_or_else(|| anyhow::anyhow!("notification {id} missing after insert"))?;
                Ok::<_, ServiceError>(render(&repos, stored)?)
            })
            .await?;
        self.deliver(recipient_id, view.clone());
        Ok(Some(view))
    }

    fn deliver(&self, recipient_id: i64, view: NotificationView) {
        let notification_id = view.id;
        match self
            .bus
            .publish(&user_group(recipient_id), RealtimeEvent::Notification(view))
        {
            Ok(delivered) => {
                tracing::debug!(recipient_id, notification_id, delivered, "notification pushed")
            }
            Err(err) => tracing::warn!(
                recipient_id,
                notification_id,
                error = %err,
                "failed to push notification"
            ),
        }
    }

    pub async fn list(
        &self,
        recipient_id: i64,
        limit: usize,
        offset: usize,
    ) -> ServiceResult<NotificationPage> {
        self.database
            .run(move |repos| {
                let notifications = repos.notifications();
                let mut results = Vec::new();
                for record in notifications.list_for_recipient(recipient_id, limit, offset)? {
                    results.push(render(&repos, record)?);
                }
                Ok(NotificationPage {
                    count: notifications.count_for_recipient(recipient_id)?,
                    unread_count: notifications.count_unread(recipient_id)?,
                    results,
                })
            })
            .await
    }

    pub async fn unread_count(&self, recipient_id: i64) -> ServiceResult<usize> {
        self.database
            .run(move |repos| Ok(repos.notifications().count_unread(recipient_id)?))
            .await
    }

    pub async fn mark_all_read(&self, recipient_id: i64) -> ServiceResult<usize> {
        self.database
            .run(move |repos| Ok(repos.notifications().mark_all_read(recipient_id)?))
            .await
    }

    pub async fn mark_read(&self, id: i64, recipient_id: i64) -> ServiceResult<()> {
        self.database
            .run(move |repos| {
                if repos.notifications().mark_read(id, recipient_id)? {
                    Ok(())
                } else {
                    Err(ServiceError::NotFound(format!("notification {id} not found")))
                }
            })
            .await
    }
}

fn render(
    repos: &crate::database::repositories::SqliteRepositories<'_>,
    record: NotificationRecord,
) -> anyhow::Result<NotificationView> {
    let sender = repos
        .users()
        .get(record.sender_id)?
        .map(UserSummary::from)
        .unwrap_or(UserSummary {
            id: record.sender_id,
            username: String::new(),
            avatar: None,
        });
    Ok(NotificationView {
        id: record.id,
        notification_type: record.kind,
        user: sender,
        content: record.content,
        post_id: record.post_id,
        time: time_since(&record.created_at),
        created_at: record.created_at,
        is_read: record.is_read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::groups::{ConnectionId, GroupHub};
    use crate::users::UserService;
    use rusqlite::Connection;
    use tokio::sync::mpsc;

    struct Fixture {
        notifications: NotificationService,
        hub: Arc<GroupHub>,
        alice: i64,
        bob: i64,
    }

    async fn fixture() -> Fixture {
        let db = Database::from_connection(Connection::open_in_memory().unwrap(), true);
        db.ensure_migrations().unwrap();
        let users = UserService::new(db.clone());
        let alice = users.create_user("alice", None).await.unwrap().id;
        let bob = users.create_user("bob", None).await.unwrap().id;
        let hub = Arc::new(GroupHub::new());
        let notifications = NotificationService::new(db, hub.clone());
        Fixture {
            notifications,
            hub,
            alice,
            bob,
        }
    }

    #[tokio::test]
    async fn self_notification_is_skipped() {
        let f = fixture().await;
        let (tx, mut rx) = mpsc::channel(4);
        f.hub.subscribe(&user_group(f.alice), &ConnectionId::new(), tx);
        let result = f
            .notifications
            .notify(f.alice, f.alice, NotificationKind::Like, Some(1), "liked your post")
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(f.notifications.list(f.alice, 20, 0).await.unwrap().count, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn follow_notification_is_stored_and_pushed_once() {
        let f = fixture().await;
        let (tx, mut rx) = mpsc::channel(4);
        f.hub.subscribe(&user_group(f.bob), &ConnectionId::new(), tx);

        let view = f
            .notifications
            .notify(f.alice, f.bob, NotificationKind::Follow, None, "started following you")
            .await
            .unwrap()
            .expect("notification");
        assert!(!view.is_read);
        assert_eq!(view.notification_type, "follow");
        assert_eq!(view.user.username, "alice");

        assert_eq!(rx.try_recv().ok(), Some(RealtimeEvent::Notification(view)));
        assert!(rx.try_recv().is_err());
        let page = f.notifications.list(f.bob, 20, 0).await.unwrap();
        assert_eq!((page.count, page.unread_count), (1, 1));
    }

    #[tokio::test]
    async fn mark_read_paths() {
        let f = fixture().await;
        for kind in [NotificationKind::Like, NotificationKind::Comment] {
            f.notifications
                .notify(f.alice, f.bob, kind, Some(7), "hello")
                .await
                .unwrap();
        }
        let page = f.notifications.list(f.bob, 20, 0).await.unwrap();
        assert_eq!(page.results[0].notification_type, "comment");

        f.notifications.mark_read(page.results[0].id, f.bob).await.unwrap();
        assert_eq!(f.notifications.unread_count(f.bob).await.unwrap(), 1);
        assert!(matches!(
            f.notifications.mark_read(page.results[1].id, f.alice).await,
            Err(ServiceError::NotFound(_))
        ));
        assert_eq!(f.notifications.mark_all_read(f.bob).await.unwrap(), 1);
        assert_eq!(f.notifications.unread_count(f.bob).await.unwrap(), 0);
    }
}
