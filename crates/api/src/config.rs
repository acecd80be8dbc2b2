//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use command::{DEFAULT_EXPIRES_AFTER_SECS, IdempotencyConfig};
use relay::{DEFAULT_BUS_SOURCE, RelayConfig};
use saga::SagaConfig;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` — `json` for JSON log lines, anything else for text
/// - `DATABASE_URL` — PostgreSQL URL; unset runs on the in-memory store
/// - `DATABASE_MAX_CONNECTIONS` — pool size (default: `5`)
/// - `IDEMPOTENCY_TTL_SECS` — idempotency record lifetime (default: `600`)
/// - `RELAY_POLL_INTERVAL_MS` — outbox poll interval (default: `500`)
/// - `RELAY_BATCH_SIZE` — feed entries per poll (default: `25`)
/// - `RELAY_MAX_ATTEMPTS` — failures before an event is surfaced (default: `5`)
/// - `RELAY_CONCURRENCY` — records dispatched in parallel (default: `8`)
/// - `RELAY_SWEEP_INTERVAL_MS` — pause between unprocessed sweeps (default: `30000`)
/// - `RELAY_SWEEP_GRACE_MS` — age before a sweep dispatches an event (default: `60000`)
/// - `EVENT_BUS_SOURCE` — source of published events (default: `"orders.outbox"`)
/// - `SAGA_STEP_TIMEOUT_MS` — per-step saga timeout (default: `10000`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub idempotency_ttl_secs: i64,
    pub relay_poll_interval_ms: u64,
    pub relay_batch_size: usize,
    pub relay_max_attempts: u32,
    pub relay_concurrency: usize,
    pub relay_sweep_interval_ms: u64,
    pub relay_sweep_grace_ms: u64,
    pub event_bus_source: String,
    pub saga_step_timeout_ms: u64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key lookup. Unparsable values fall back
    /// to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = Parsed(&lookup);

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parsed.get("PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: lookup("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            database_max_connections: parsed
                .get("DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            idempotency_ttl_secs: parsed
                .get("IDEMPOTENCY_TTL_SECS")
                .unwrap_or(defaults.idempotency_ttl_secs),
            relay_poll_interval_ms: parsed
                .get("RELAY_POLL_INTERVAL_MS")
                .unwrap_or(defaults.relay_poll_interval_ms),
            relay_batch_size: parsed
                .get("RELAY_BATCH_SIZE")
                .unwrap_or(defaults.relay_batch_size),
            relay_max_attempts: parsed
                .get("RELAY_MAX_ATTEMPTS")
                .unwrap_or(defaults.relay_max_attempts),
            relay_concurrency: parsed
                .get("RELAY_CONCURRENCY")
                .unwrap_or(defaults.relay_concurrency),
            relay_sweep_interval_ms: parsed
                .get("RELAY_SWEEP_INTERVAL_MS")
                .unwrap_or(defaults.relay_sweep_interval_ms),
            relay_sweep_grace_ms: parsed
                .get("RELAY_SWEEP_GRACE_MS")
                .unwrap_or(defaults.relay_sweep_grace_ms),
            event_bus_source: lookup("EVENT_BUS_SOURCE").unwrap_or(defaults.event_bus_source),
            saga_step_timeout_ms: parsed
                .get("SAGA_STEP_TIMEOUT_MS")
                .unwrap_or(defaults.saga_step_timeout_ms),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idempotency_config(&self) -> IdempotencyConfig {
        let defaults = IdempotencyConfig::default();
        IdempotencyConfig {
            expires_after: chrono::Duration::try_seconds(self.idempotency_ttl_secs)
                .unwrap_or(defaults.expires_after),
            ..defaults
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            poll_interval: Duration::from_millis(self.relay_poll_interval_ms),
            batch_size: self.relay_batch_size.max(1),
            max_attempts: self.relay_max_attempts.max(1),
            concurrency: self.relay_concurrency.max(1),
            bus_source: self.event_bus_source.clone(),
            sweep_interval: Duration::from_millis(self.relay_sweep_interval_ms),
            sweep_grace: Duration::from_millis(self.relay_sweep_grace_ms),
        }
    }

    pub fn saga_config(&self) -> SagaConfig {
        SagaConfig {
            step_timeout: Duration::from_millis(self.saga_step_timeout_ms),
        }
    }
}

struct Parsed<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Parsed<'_, F> {
    fn get<T: FromStr>(&self, key: &str) -> Option<T> {
        (self.0)(key).and_then(|v| v.trim().parse().ok())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            database_url: None,
            database_max_connections: 5,
            idempotency_ttl_secs: DEFAULT_EXPIRES_AFTER_SECS,
            relay_poll_interval_ms: 500,
            relay_batch_size: 25,
            relay_max_attempts: 5,
            relay_concurrency: 8,
            relay_sweep_interval_ms: 30_000,
            relay_sweep_grace_ms: 60_000,
            event_bus_source: DEFAULT_BUS_SOURCE.to_string(),
            saga_step_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert!(config.database_url.is_none());
        assert_eq!(config.idempotency_ttl_secs, 600);
        assert_eq!(config.relay_batch_size, 25);
        assert_eq!(config.event_bus_source, "orders.outbox");
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_lookup_overrides_defaults() {
        let config = from_pairs(&[
            ("PORT", "8081"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/orders"),
            ("IDEMPOTENCY_TTL_SECS", "30"),
            ("RELAY_MAX_ATTEMPTS", "2"),
            ("RELAY_SWEEP_GRACE_MS", "1500"),
            ("SAGA_STEP_TIMEOUT_MS", "250"),
        ]);

        assert_eq!(config.port, 8081);
        assert!(config.log_json);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/orders")
        );
        assert_eq!(
            config.idempotency_config().expires_after,
            chrono::Duration::seconds(30)
        );
        assert_eq!(config.relay_config().max_attempts, 2);
        assert_eq!(
            config.relay_config().sweep_grace,
            Duration::from_millis(1500)
        );
        assert_eq!(
            config.relay_config().sweep_interval,
            Duration::from_secs(30)
        );
        assert_eq!(
            config.saga_config().step_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = from_pairs(&[
            ("PORT", "eighty"),
            ("RELAY_BATCH_SIZE", "-1"),
            ("DATABASE_URL", " "),
        ]);

        assert_eq!(config.port, 3000);
        assert_eq!(config.relay_batch_size, 25);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_relay_config_never_zero() {
        let config = Config {
            relay_batch_size: 0,
            relay_concurrency: 0,
            ..Config::default()
        };
        let relay = config.relay_config();
        assert_eq!(relay.batch_size, 1);
        assert_eq!(relay.concurrency, 1);
    }
}
