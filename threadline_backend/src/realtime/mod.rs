pub mod events;
pub mod fanout;
pub mod groups;
pub mod session;

use crate::auth::Authenticator;
use crate::config::RealtimeConfig;
use crate::conversations::ConversationService;
use crate::presence::Presence;
use crate::users::UserService;
use fanout::Fanout;
use groups::EventBus;
use std::sync::Arc;

/// Everything a socket session needs, cloned into each connection task.
#[derive(Clone)]
pub struct RealtimeContext {
    pub auth: Authenticator,
    pub users: UserService,
    pub conversations: ConversationService,
    pub presence: Presence,
    pub bus: Arc<dyn EventBus>,
    pub fanout: Fanout,
    pub config: RealtimeConfig,
}
