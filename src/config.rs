//! Runtime configuration.
//!
//! Tinpot is configured from the environment with CLI-flag overrides; there
//! is no config file. Precedence: flag > environment variable > default.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by the coordinator and worker subcommands.
#[derive(Debug, Clone)]
pub struct Config {
    /// Broker URL, `tcp://host:port` form (`MQTT_BROKER`).
    pub broker_url: String,
    /// Coordinator HTTP listen port (`PORT`).
    pub http_port: u16,
    /// Directory of Lua action scripts for the worker (`ACTIONS_DIR`).
    pub actions_dir: PathBuf,
    /// Deadline for synchronous execution requests (`SYNC_TIMEOUT_SECS`).
    pub sync_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: "tcp://localhost:1883".to_string(),
            http_port: 8000,
            actions_dir: PathBuf::from("actions"),
            sync_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(broker) = std::env::var("MQTT_BROKER") {
            self.broker_url = broker;
        }
        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(p) => self.http_port = p,
                Err(_) => log::warn!("ignoring invalid PORT value {port:?}"),
            }
        }
        if let Ok(dir) = std::env::var("ACTIONS_DIR") {
            self.actions_dir = PathBuf::from(dir);
        }
        if let Ok(secs) = std::env::var("SYNC_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(s) => self.sync_timeout = Duration::from_secs(s),
                Err(_) => log::warn!("ignoring invalid SYNC_TIMEOUT_SECS value {secs:?}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment mutations are process-global; serialize the tests that
    // touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.broker_url, "tcp://localhost:1883");
        assert_eq!(config.http_port, 8000);
        assert_eq!(config.actions_dir, PathBuf::from("actions"));
        assert_eq!(config.sync_timeout, Duration::from_secs(30));
    }

    #[test]
    fn env_overrides_apply() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        std::env::set_var("MQTT_BROKER", "tcp://broker.internal:1884");
        std::env::set_var("PORT", "9000");
        std::env::set_var("ACTIONS_DIR", "/srv/actions");
        std::env::set_var("SYNC_TIMEOUT_SECS", "5");

        let config = Config::from_env();
        assert_eq!(config.broker_url, "tcp://broker.internal:1884");
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.actions_dir, PathBuf::from("/srv/actions"));
        assert_eq!(config.sync_timeout, Duration::from_secs(5));

        std::env::remove_var("MQTT_BROKER");
        std::env::remove_var("PORT");
        std::env::remove_var("ACTIONS_DIR");
        std::env::remove_var("SYNC_TIMEOUT_SECS");
    }

    #[test]
    fn invalid_numeric_env_values_are_ignored() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        std::env::set_var("PORT", "not-a-port");
        std::env::set_var("SYNC_TIMEOUT_SECS", "soon");

        let config = Config::from_env();
        assert_eq!(config.http_port, 8000);
        assert_eq!(config.sync_timeout, Duration::from_secs(30));

        std::env::remove_var("PORT");
        std::env::remove_var("SYNC_TIMEOUT_SECS");
    }
}
