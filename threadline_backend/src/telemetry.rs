use crate::utils::APP_NAME;
use tracing_subscriber::EnvFilter;

fn default_directives() -> String {
    format!("{APP_NAME}=info,tower_http=info")
}

/// Installs the global fmt subscriber. `RUST_LOG` replaces the default
/// directives; once a subscriber is installed, later calls do nothing.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_parse() {
        assert!(EnvFilter::try_new(default_directives()).is_ok());
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
