//! Post-mutation broadcast sequences shared by the socket and REST paths.

use super::events::{ConversationUpdate, RealtimeEvent, SenderRef};
use super::groups::{thread_group, user_group, EventBus};
use crate::conversations::{ConversationService, MessageView};
use std::sync::Arc;

#[derive(Clone)]
pub struct Fanout {
    bus: Arc<dyn EventBus>,
    conversations: ConversationService,
}

impl Fanout {
    pub fn new(bus: Arc<dyn EventBus>, conversations: ConversationService) -> Self {
        Self { bus, conversations }
    }

    fn publish(&self, group: &str, event: RealtimeEvent) {
        let kind = event.kind();
        match self.bus.publish(group, event) {
            Ok(delivered) => tracing::trace!(%group, kind, delivered, "published"),
            Err(err) => tracing::warn!(%group, kind, error = %err, "broadcast failed"),
        }
    }

    /// `message_created` to the thread, then one `conversation_updated` per
    /// participant carrying that participant's own unread count.
    pub async fn message_sent(&self, message: &MessageView, participants: &[i64]) {
        self.publish(
            &thread_group(message.thread_id),
            RealtimeEvent::MessageCreated(message.clone()),
        );
        for &participant in participants {
            let unread_count = match self
                .conversations
                .unread_count(message.thread_id, participant)
                .await
            {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(
                        thread_id = message.thread_id,
                        participant,
                        error = %err,
                        "unread count unavailable, skipping conversation update"
                    );
                    continue;
                }
            };
            let update = ConversationUpdate {
                chat_id: message.thread_id,
                message: summary(message),
                timestamp: message.created_at.clone(),
                sender: SenderRef {
                    id: message.sender_id,
                    username: message.sender.clone(),
                },
                is_sender: message.sender_id == Some(participant),
                unread_count,
            };
            self.publish(
                &user_group(participant),
                RealtimeEvent::ConversationUpdated(update),
            );
        }
    }

    /// One receipt for the most recent newly read message.
    pub fn read_receipt(&self, thread_id: i64, reader_id: i64, newly_read: &[i64]) {
        let Some(&message_id) = newly_read.last() else {
            return;
        };
        self.publish(
            &thread_group(thread_id),
            RealtimeEvent::ReadReceipt {
                thread_id,
                message_id,
                reader_id,
            },
        );
    }

    /// `mark_read_updated` to every participant's personal group only.
    pub async fn mark_read_updated(&self, thread_id: i64, reader_id: i64, participants: &[i64]) {
        for &participant in participants {
            match self.conversations.unread_count(thread_id, participant).await {
                Ok(unread_count) => self.publish(
                    &user_group(participant),
                    RealtimeEvent::MarkReadUpdated {
                        chat_id: thread_id,
                        user_id: reader_id,
                        unread_count,
                    },
                ),
                Err(err) => tracing::warn!(
                    thread_id,
                    participant,
                    error = %err,
                    "unread count unavailable, skipping mark-read update"
                ),
            }
        }
    }

    pub fn thread_removed(&self, thread_id: i64, participants: &[i64]) {
        for &participant in participants {
            self.publish(
                &user_group(participant),
                RealtimeEvent::ThreadRemoved { chat_id: thread_id },
            );
        }
    }

    /// Tells everyone who shares a thread with `user_id` about a presence flip.
    pub async fn presence_changed(&self, user_id: i64, online: bool) {
        let partners = match self.conversations.partners_of(user_id).await {
            Ok(partners) => partners,
            Err(err) => {
                tracing::warn!(user_id, error = %err, "could not load partners for presence update");
                return;
            }
        };
        for partner in partners {
            self.publish(
                &user_group(partner),
                RealtimeEvent::PresenceUpdate { user_id, online },
            );
        }
    }
}

fn summary(message: &MessageView) -> String {
    if !message.text.is_empty() {
        message.text.clone()
    } else if message.image.is_some() {
        "[image]".into()
    } else if message.file.is_some() {
        "[file]".into()
    } else {
        "[shared post]".into()
    }
}
