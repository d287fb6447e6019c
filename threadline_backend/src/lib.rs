pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod conversations;
pub mod database;
pub mod error;
pub mod follows;
pub mod media;
pub mod node;
pub mod notifications;
pub mod presence;
pub mod realtime;
pub mod telemetry;
pub mod users;
pub mod utils;
