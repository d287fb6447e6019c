use anyhow::{anyhow, Result};
use chrono::{FixedOffset, Offset, Utc};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEV_JWT_SECRET: &str = "threadline-dev-secret";

#[derive(Debug, Clone)]
pub struct ThreadlineConfig {
    pub api_port: u16,
    pub paths: ThreadlinePaths,
    pub auth: AuthConfig,
    pub presence: PresenceConfig,
    pub media: MediaConfig,
    pub realtime: RealtimeConfig,
    pub view: ViewConfig,
}

impl ThreadlineConfig {
    pub fn from_env() -> Result<Self> {
        let paths = match env_non_empty("THREADLINE_BASE_DIR") {
            Some(base) => ThreadlinePaths::from_base_dir(base)?,
            None => ThreadlinePaths::discover()?,
        };
        let api_port = env_parse("THREADLINE_API_PORT").unwrap_or(8080);
        Ok(Self {
            api_port,
            paths,
            auth: AuthConfig::from_env(),
            presence: PresenceConfig::from_env(),
            media: MediaConfig::from_env(),
            realtime: RealtimeConfig::from_env(),
            view: ViewConfig::from_env(),
        })
    }

    /// Defaults rooted at `base`; used by tests and embedded callers.
    pub fn for_base_dir<P: AsRef<Path>>(base: P, api_port: u16) -> Result<Self> {
        Ok(Self {
            api_port,
            paths: ThreadlinePaths::from_base_dir(base)?,
            auth: AuthConfig::default(),
            presence: PresenceConfig::default(),
            media: MediaConfig::default(),
            realtime: RealtimeConfig::default(),
            view: ViewConfig::default(),
        })
    }
}

#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.into(),
        }
    }
}

impl AuthConfig {
    pub fn from_env() -> Self {
        match env_non_empty("THREADLINE_JWT_SECRET") {
            Some(jwt_secret) => Self { jwt_secret },
            None => {
                tracing::warn!("THREADLINE_JWT_SECRET not set, using the development secret");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub ttl: Duration,
    /// When set, presence counters are kept in Redis so every server
    /// process sees the same value.
    pub redis_url: Option<String>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            redis_url: None,
        }
    }
}

impl PresenceConfig {
    pub fn from_env() -> Self {
        let ttl = env_parse::<u64>("THREADLINE_PRESENCE_TTL_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Self::default().ttl);
        Self {
            ttl,
            redis_url: env_non_empty("THREADLINE_REDIS_URL"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub max_upload_bytes: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl MediaConfig {
    pub fn from_env() -> Self {
        let max_upload_bytes = env_parse("THREADLINE_MAX_UPLOAD_BYTES")
            .unwrap_or_else(|| Self::default().max_upload_bytes);
        Self { max_upload_bytes }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Outbound events buffered per connection before new ones are dropped.
    pub send_queue: usize,
    pub heartbeat: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            send_queue: 256,
            heartbeat: Duration::from_secs(30),
        }
    }
}

impl RealtimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            send_queue: env_parse::<usize>("THREADLINE_SEND_QUEUE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.send_queue),
            heartbeat: defaults.heartbeat,
        }
    }

    /// How often an open personal socket refreshes its presence counter.
    /// Stays under half the counter's expiry so a live connection never
    /// lapses between refreshes.
    pub fn presence_refresh(&self, presence_ttl: Duration) -> Duration {
        self.heartbeat
            .min(presence_ttl / 2)
            .max(Duration::from_secs(1))
    }
}

/// Presentation settings applied when records are rendered for clients.
#[derive(Debug, Clone)]
pub struct ViewConfig {
    pub public_base_url: Option<String>,
    pub utc_offset: FixedOffset,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            public_base_url: None,
            utc_offset: Utc.fix(),
        }
    }
}

impl ViewConfig {
    pub fn from_env() -> Self {
        let utc_offset = env_parse::<i32>("THREADLINE_DISPLAY_UTC_OFFSET_MINUTES")
            .and_then(|minutes| FixedOffset::east_opt(minutes * 60))
            .unwrap_or_else(|| Utc.fix());
        let public_base_url = env_non_empty("THREADLINE_PUBLIC_BASE_URL")
            .map(|raw| raw.trim_end_matches('/').to_string());
        Self {
            public_base_url,
            utc_offset,
        }
    }

    pub fn media_url(&self, stored_name: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{base}/media/{stored_name}"),
            None => format!("/media/{stored_name}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThreadlinePaths {
    pub base: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub media_dir: PathBuf,
    pub uploads_dir: PathBuf,
}

impl ThreadlinePaths {
    pub fn discover() -> Result<Self> {
        let exe_path = std::env::current_exe()
            .map_err(|err| anyhow!("failed to resolve current executable: {err}"))?;
        let base = exe_path
            .parent()
            .ok_or_else(|| anyhow!("executable path missing parent"))?
            .to_path_buf();
        Self::from_base_dir(base)
    }

    pub fn from_base_dir<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let data_dir = base.join("data");
        let db_path = data_dir.join("threadline.db");
        let media_dir = base.join("media");
        let uploads_dir = media_dir.join("uploads");

        Ok(Self {
            base,
            data_dir,
            db_path,
            media_dir,
            uploads_dir,
        })
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|raw| !raw.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rooted_at_base() {
        let paths = ThreadlinePaths::from_base_dir("/srv/threadline").unwrap();
        assert_eq!(paths.db_path, PathBuf::from("/srv/threadline/data/threadline.db"));
        assert_eq!(paths.uploads_dir, PathBuf::from("/srv/threadline/media/uploads"));
    }

    #[test]
    fn media_url_uses_public_base_when_present() {
        let mut view = ViewConfig::default();
        assert_eq!(view.media_url("a.png"), "/media/a.png");
        view.public_base_url = Some("https://cdn.example.com".into());
        assert_eq!(view.media_url("a.png"), "https://cdn.example.com/media/a.png");
    }

    #[test]
    fn presence_refresh_stays_inside_ttl() {
        let realtime = RealtimeConfig::default();
        assert_eq!(realtime.presence_refresh(Duration::from_secs(60)), Duration::from_secs(30));
        assert_eq!(realtime.presence_refresh(Duration::from_secs(10)), Duration::from_secs(5));
        assert_eq!(realtime.presence_refresh(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn auth_config_debug_hides_secret() {
        let rendered = format!("{:?}", AuthConfig::default());
        assert!(!rendered.contains(DEV_JWT_SECRET));
    }
}
