use crate::api::{self, AppState};
use crate::bootstrap::{self, BootstrapResources};
use crate::config::ThreadlineConfig;
use crate::database::Database;
use crate::presence::Presence;
use crate::realtime::groups::{EventBus, GroupHub};
use anyhow::Result;
use std::sync::Arc;

/// Bootstraps the backend once and hands out the shared handles every
/// entrypoint (HTTP server, CLI subcommands, tests) needs.
pub struct ThreadlineNode {
    config: ThreadlineConfig,
    bootstrap: BootstrapResources,
    presence: Presence,
    bus: Arc<dyn EventBus>,
}

impl ThreadlineNode {
    pub async fn start(config: ThreadlineConfig) -> Result<Self> {
        let bootstrap = bootstrap::initialize(&config)?;
        let presence = Presence::connect(&config.presence).await;
        let bus: Arc<dyn EventBus> = Arc::new(GroupHub::new());

        tracing::info!(
            directories_created = ?bootstrap.directories_created,
            database_initialized = bootstrap.database_initialized,
            db_path = %config.paths.db_path.display(),
            "threadline node initialized"
        );

        Ok(Self {
            config,
            bootstrap,
            presence,
            bus,
        })
    }

    pub fn state(&self) -> AppState {
        AppState::new(
            self.config.clone(),
            self.bootstrap.database.clone(),
            self.presence.clone(),
            Arc::clone(&self.bus),
        )
    }

    /// Runs the REST and WebSocket server until shutdown.
    pub async fn run_http_server(&self) -> Result<()> {
        api::serve_http(self.state()).await
    }

    pub fn database(&self) -> Database {
        self.bootstrap.database.clone()
    }

    pub fn config(&self) -> &ThreadlineConfig {
        &self.config
    }
}
