//! Server configuration, loaded from environment variables with validated defaults.

use std::env;
use std::time::Duration;

use crate::error::ConfigError;

/// Server configuration.
///
/// Loaded once at startup via [`Config::from_env`] and shared read-only
/// (behind an `Arc`) for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub node_env: String,
    pub max_clients_per_room: usize,
    pub max_connections_per_ip_per_room: usize,
    pub ping_interval: Duration,
    pub cleanup_interval: Duration,
    pub grace_period: Duration,
    pub reap_interval: Duration,
    pub anomaly_threshold: usize,
    pub api_base_url: String,
    pub enable_code_editor_features: bool,
}

impl Config {
    /// Load configuration from the environment, applying defaults and
    /// validating the values per spec.md §6.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort(raw))?,
            Err(_) => 1234,
        };
        if port == 0 {
            return Err(ConfigError::InvalidPort(port.to_string()));
        }

        let node_env = env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string());

        let max_clients_per_room: usize = env::var("MAX_CLIENTS_PER_ROOM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);
        if max_clients_per_room < 1 {
            return Err(ConfigError::InvalidMaxClientsPerRoom(max_clients_per_room));
        }

        let max_connections_per_ip_per_room: usize = env::var("MAX_CONNECTIONS_PER_IP_PER_ROOM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let ping_interval_ms: u64 = env::var("WEBSOCKET_PING_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30_000);
        if ping_interval_ms < 1000 {
            return Err(ConfigError::InvalidPingInterval(ping_interval_ms));
        }

        let cleanup_interval_ms: u64 = env::var("CLEANUP_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300_000);

        let grace_period_ms: u64 = env::var("GRACE_PERIOD_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(120_000);
        if grace_period_ms < 5000 {
            return Err(ConfigError::InvalidGracePeriod(grace_period_ms));
        }

        let reap_interval_ms: u64 = env::var("REAP_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(20_000);

        let anomaly_threshold: usize = env::var("ANOMALY_CLIENT_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let api_base_url =
            env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000/api".to_string());

        let enable_code_editor_features = env::var("ENABLE_CODE_EDITOR_FEATURES")
            .map(|s| s != "false")
            .unwrap_or(true);

        if enable_code_editor_features && url::Url::parse(&api_base_url).is_err() {
            return Err(ConfigError::InvalidApiBaseUrl(api_base_url));
        }

        Ok(Self {
            port,
            node_env,
            max_clients_per_room,
            max_connections_per_ip_per_room,
            ping_interval: Duration::from_millis(ping_interval_ms),
            cleanup_interval: Duration::from_millis(cleanup_interval_ms),
            grace_period: Duration::from_millis(grace_period_ms),
            reap_interval: Duration::from_millis(reap_interval_ms),
            anomaly_threshold,
            api_base_url,
            enable_code_editor_features,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn is_production(&self) -> bool {
        self.node_env == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: &[&str] = &[
        "PORT",
        "NODE_ENV",
        "MAX_CLIENTS_PER_ROOM",
        "MAX_CONNECTIONS_PER_IP_PER_ROOM",
        "WEBSOCKET_PING_INTERVAL",
        "CLEANUP_INTERVAL",
        "GRACE_PERIOD_MS",
        "REAP_INTERVAL_MS",
        "ANOMALY_CLIENT_THRESHOLD",
        "API_BASE_URL",
        "ENABLE_CODE_EDITOR_FEATURES",
    ];

    /// SAFETY: `env::set_var`/`remove_var` are unsafe in this edition because they
    /// race with other threads reading the environment; these tests run
    /// single-threaded with respect to the keys in `KEYS` and always restore them.
    fn with_clean_env<R>(f: impl FnOnce() -> R) -> R {
        unsafe {
            for key in KEYS {
                env::remove_var(key);
            }
        }
        let result = f();
        unsafe {
            for key in KEYS {
                env::remove_var(key);
            }
        }
        result
    }

    #[test]
    fn defaults_match_spec() {
        with_clean_env(|| {
            let config = Config::from_env().unwrap();
            assert_eq!(config.port, 1234);
            assert_eq!(config.max_clients_per_room, 50);
            assert_eq!(config.max_connections_per_ip_per_room, 10);
            assert_eq!(config.ping_interval, Duration::from_millis(30_000));
            assert_eq!(config.grace_period, Duration::from_millis(120_000));
            assert_eq!(config.api_base_url, "http://localhost:3000/api");
            assert!(config.enable_code_editor_features);
        });
    }

    #[test]
    fn rejects_ping_interval_below_floor() {
        with_clean_env(|| {
            unsafe { env::set_var("WEBSOCKET_PING_INTERVAL", "500") };
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidPingInterval(500)));
        });
    }

    #[test]
    fn rejects_grace_period_below_floor() {
        with_clean_env(|| {
            unsafe { env::set_var("GRACE_PERIOD_MS", "100") };
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidGracePeriod(100)));
        });
    }

    #[test]
    fn rejects_bad_api_base_url_when_code_editor_enabled() {
        with_clean_env(|| {
            unsafe { env::set_var("API_BASE_URL", "not a url") };
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidApiBaseUrl(_)));
        });
    }

    #[test]
    fn skips_url_validation_when_code_editor_features_disabled() {
        with_clean_env(|| {
            unsafe {
                env::set_var("API_BASE_URL", "not a url");
                env::set_var("ENABLE_CODE_EDITOR_FEATURES", "false");
            }
            let config = Config::from_env().unwrap();
            assert!(!config.enable_code_editor_features);
        });
    }
}
