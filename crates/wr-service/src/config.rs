//! Waiting Room configuration.
//!
//! Configuration is loaded from environment variables. The Redis URL may carry
//! credentials and is redacted in Debug output.

use crate::queue::QueueManagerConfig;
use crate::scheduler::{
    SchedulerConfig, DEFAULT_BATCH_SIZE, DEFAULT_INITIAL_DELAY, DEFAULT_INTERVAL,
    DEFAULT_SCAN_HINT,
};
use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_HTTP_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default per-call store timeout in milliseconds.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;

/// Default number of memoized admission tokens.
pub const DEFAULT_TOKEN_CACHE_CAPACITY: usize = 100_000;

/// Default lifetime of the admission token cookie in seconds.
pub const DEFAULT_TOKEN_COOKIE_MAX_AGE_SECONDS: u64 = 300;

/// Waiting Room configuration.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (host, port, credentials).
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// HTTP server bind address (default: "0.0.0.0:8080").
    pub http_bind_address: String,

    /// Run sweeps (Active) or skip them (Disabled). Default: false.
    pub scheduler_enabled: bool,

    /// Users promoted per queue per sweep (default: 60).
    pub scheduler_batch_size: i64,

    /// Delay before the first sweep in milliseconds (default: 5000).
    pub scheduler_initial_delay_ms: u64,

    /// Sweep cadence in milliseconds, also the sweep timeout (default: 1000).
    pub scheduler_interval_ms: u64,

    /// SCAN `COUNT` hint (default: 60).
    pub scheduler_scan_hint: u64,

    /// Timeout for a single store call in milliseconds (default: 2000).
    pub store_timeout_ms: u64,

    /// Promote through the atomic server-side script (default: true).
    pub atomic_promotion: bool,

    /// Maximum number of memoized tokens; 0 disables caching (default: 100000).
    pub token_cache_capacity: usize,

    /// Max-Age of the token cookie in seconds (default: 300).
    pub token_cookie_max_age_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("http_bind_address", &self.http_bind_address)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("scheduler_batch_size", &self.scheduler_batch_size)
            .field(
                "scheduler_initial_delay_ms",
                &self.scheduler_initial_delay_ms,
            )
            .field("scheduler_interval_ms", &self.scheduler_interval_ms)
            .field("scheduler_scan_hint", &self.scheduler_scan_hint)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("atomic_promotion", &self.atomic_promotion)
            .field("token_cache_capacity", &self.token_cache_capacity)
            .field(
                "token_cookie_max_age_seconds",
                &self.token_cookie_max_age_seconds,
            )
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let http_bind_address = vars
            .get("WR_HTTP_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HTTP_BIND_ADDRESS.to_string());

        let scheduler_enabled = parse_bool(vars, "WR_SCHEDULER_ENABLED", false)?;

        let scheduler_batch_size = parse(vars, "WR_SCHEDULER_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if scheduler_batch_size <= 0 {
            return Err(ConfigError::InvalidValue(format!(
                "WR_SCHEDULER_BATCH_SIZE must be positive, got {scheduler_batch_size}"
            )));
        }

        let scheduler_initial_delay_ms = parse(
            vars,
            "WR_SCHEDULER_INITIAL_DELAY_MS",
            duration_ms(DEFAULT_INITIAL_DELAY),
        )?;

        let scheduler_interval_ms = parse(
            vars,
            "WR_SCHEDULER_INTERVAL_MS",
            duration_ms(DEFAULT_INTERVAL),
        )?;
        if scheduler_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "WR_SCHEDULER_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        let scheduler_scan_hint = parse(vars, "WR_SCHEDULER_SCAN_HINT", DEFAULT_SCAN_HINT)?;

        let store_timeout_ms = parse(vars, "WR_STORE_TIMEOUT_MS", DEFAULT_STORE_TIMEOUT_MS)?;
        if store_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "WR_STORE_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        let atomic_promotion = parse_bool(vars, "WR_ATOMIC_PROMOTION", true)?;

        let token_cache_capacity = parse(
            vars,
            "WR_TOKEN_CACHE_CAPACITY",
            DEFAULT_TOKEN_CACHE_CAPACITY,
        )?;

        let token_cookie_max_age_seconds = parse(
            vars,
            "WR_TOKEN_COOKIE_MAX_AGE_SECONDS",
            DEFAULT_TOKEN_COOKIE_MAX_AGE_SECONDS,
        )?;

        Ok(Config {
            redis_url,
            http_bind_address,
            scheduler_enabled,
            scheduler_batch_size,
            scheduler_initial_delay_ms,
            scheduler_interval_ms,
            scheduler_scan_hint,
            store_timeout_ms,
            atomic_promotion,
            token_cache_capacity,
            token_cookie_max_age_seconds,
        })
    }

    /// Scheduler settings derived from this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            enabled: self.scheduler_enabled,
            batch_size: self.scheduler_batch_size,
            initial_delay: Duration::from_millis(self.scheduler_initial_delay_ms),
            interval: Duration::from_millis(self.scheduler_interval_ms),
            scan_hint: self.scheduler_scan_hint,
        }
    }

    /// Queue manager settings derived from this configuration.
    pub fn queue_manager_config(&self) -> QueueManagerConfig {
        QueueManagerConfig {
            store_timeout: self.store_timeout(),
            atomic_promotion: self.atomic_promotion,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn parse<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{name}={raw:?}: {e}"))),
    }
}

fn parse_bool(
    vars: &HashMap<String, String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(name).map(|raw| raw.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(value) => match value.as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(format!(
                "{name}={value:?}: expected a boolean"
            ))),
        },
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "REDIS_URL".to_string(),
            "redis://:hunter2@localhost:6379".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(
            config.redis_url.expose_secret(),
            "redis://:hunter2@localhost:6379"
        );
        assert_eq!(config.http_bind_address, DEFAULT_HTTP_BIND_ADDRESS);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.scheduler_batch_size, 60);
        assert_eq!(config.scheduler_initial_delay_ms, 5000);
        assert_eq!(config.scheduler_interval_ms, 1000);
        assert_eq!(config.scheduler_scan_hint, 60);
        assert_eq!(config.store_timeout_ms, DEFAULT_STORE_TIMEOUT_MS);
        assert!(config.atomic_promotion);
        assert_eq!(config.token_cache_capacity, DEFAULT_TOKEN_CACHE_CAPACITY);
        assert_eq!(config.token_cookie_max_age_seconds, 300);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("WR_HTTP_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string());
        vars.insert("WR_SCHEDULER_ENABLED".to_string(), "true".to_string());
        vars.insert("WR_SCHEDULER_BATCH_SIZE".to_string(), "25".to_string());
        vars.insert("WR_SCHEDULER_INITIAL_DELAY_MS".to_string(), "0".to_string());
        vars.insert("WR_SCHEDULER_INTERVAL_MS".to_string(), "250".to_string());
        vars.insert("WR_SCHEDULER_SCAN_HINT".to_string(), "500".to_string());
        vars.insert("WR_STORE_TIMEOUT_MS".to_string(), "100".to_string());
        vars.insert("WR_ATOMIC_PROMOTION".to_string(), "false".to_string());
        vars.insert("WR_TOKEN_CACHE_CAPACITY".to_string(), "0".to_string());
        vars.insert(
            "WR_TOKEN_COOKIE_MAX_AGE_SECONDS".to_string(),
            "60".to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.http_bind_address, "127.0.0.1:9000");
        assert!(config.scheduler_enabled);
        assert!(!config.atomic_promotion);
        assert_eq!(config.token_cache_capacity, 0);
        assert_eq!(config.token_cookie_max_age_seconds, 60);

        let scheduler = config.scheduler_config();
        assert!(scheduler.enabled);
        assert_eq!(scheduler.batch_size, 25);
        assert_eq!(scheduler.initial_delay, Duration::ZERO);
        assert_eq!(scheduler.interval, Duration::from_millis(250));
        assert_eq!(scheduler.scan_hint, 500);

        let manager = config.queue_manager_config();
        assert_eq!(manager.store_timeout, Duration::from_millis(100));
        assert!(!manager.atomic_promotion);
    }

    #[test]
    fn test_missing_redis_url() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(ref v)) if v == "REDIS_URL"));
    }

    #[test]
    fn test_malformed_values_rejected() {
        let cases = [
            ("WR_SCHEDULER_ENABLED", "maybe"),
            ("WR_SCHEDULER_BATCH_SIZE", "sixty"),
            ("WR_SCHEDULER_INTERVAL_MS", "-1"),
            ("WR_STORE_TIMEOUT_MS", "2s"),
            ("WR_ATOMIC_PROMOTION", ""),
            ("WR_TOKEN_CACHE_CAPACITY", "1e5"),
        ];

        for (name, value) in cases {
            let mut vars = base_vars();
            vars.insert(name.to_string(), value.to_string());
            let result = Config::from_vars(&vars);
            assert!(
                matches!(result, Err(ConfigError::InvalidValue(_))),
                "{name}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_interval_and_batch_rejected() {
        for (name, value) in [
            ("WR_SCHEDULER_INTERVAL_MS", "0"),
            ("WR_SCHEDULER_BATCH_SIZE", "0"),
            ("WR_SCHEDULER_BATCH_SIZE", "-5"),
            ("WR_STORE_TIMEOUT_MS", "0"),
        ] {
            let mut vars = base_vars();
            vars.insert(name.to_string(), value.to_string());
            assert!(
                matches!(Config::from_vars(&vars), Err(ConfigError::InvalidValue(_))),
                "{name}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_boolean_spellings() {
        for (value, expected) in [("1", true), ("YES", true), ("off", false), (" False ", false)] {
            let mut vars = base_vars();
            vars.insert("WR_SCHEDULER_ENABLED".to_string(), value.to_string());
            let config = Config::from_vars(&vars).unwrap();
            assert_eq!(config.scheduler_enabled, expected, "value {value:?}");
        }
    }

    #[test]
    fn test_debug_redacts_redis_url() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
        assert!(debug_output.contains("scheduler_enabled"));
    }
}
