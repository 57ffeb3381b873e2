use std::path::PathBuf;
use std::time::Duration;

pub const BASE_DIR_ENV: &str = "MCP_ENGINE_BASE_DIR";
pub const SERVER_INSTANCE_ID_ENV: &str = "MCP_ENGINE_SERVER_INSTANCE_ID";
pub const PREFERRED_ROOT_ENV: &str = "MCP_ENGINE_PREFERRED_ROOT";
pub const STARTING_DIR_ENV: &str = "MCP_ENGINE_STARTING_DIR";
pub const SHUTDOWN_TIMEOUT_MS_ENV: &str = "MCP_ENGINE_SHUTDOWN_TIMEOUT_MS";

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration assembled from CLI flags with env var fallbacks.
/// Empty strings mean "unset" throughout, matching how the values travel
/// through the watchdog re-exec flags.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub base_dir: String,
    pub server_instance_id: String,
    pub preferred_engine_root: String,
    pub preferred_starting_directory: String,
    pub shutdown_timeout: Option<Duration>,
    pub debug_events_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            base_dir: env_string(BASE_DIR_ENV),
            server_instance_id: env_string(SERVER_INSTANCE_ID_ENV),
            preferred_engine_root: env_string(PREFERRED_ROOT_ENV),
            preferred_starting_directory: env_string(STARTING_DIR_ENV),
            shutdown_timeout: env_string(SHUTDOWN_TIMEOUT_MS_ENV)
                .parse::<u64>()
                .ok()
                .map(Duration::from_millis),
            debug_events_dir: None,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

fn env_string(key: &str) -> String {
    std::env::var(key)
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_unset() {
        let config = Config::default();
        assert!(config.base_dir.is_empty());
        assert!(config.server_instance_id.is_empty());
        assert_eq!(config.shutdown_timeout(), DEFAULT_SHUTDOWN_TIMEOUT);
    }

    #[test]
    fn explicit_shutdown_timeout_wins() {
        let config = Config {
            shutdown_timeout: Some(Duration::from_millis(250)),
            ..Config::default()
        };
        assert_eq!(config.shutdown_timeout(), Duration::from_millis(250));
    }
}
