//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use common::EmployeeId;
use saga::{ConsumerSettings, RelaySettings, RuntimeSettings, Timeouts};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` — `text` or `json` (default: `text`)
/// - `DATABASE_URL` — PostgreSQL connection string; in-memory stores when unset
/// - `STORE_TIMEOUT_MS` — bound on each store call (default: `2000`)
/// - `BROKER_RECEIVE_TIMEOUT_MS` — bound on one receive poll (default: `1000`)
/// - `HANDLER_TIMEOUT_MS` — bound on handling one message (default: `10000`)
/// - `VISIBILITY_TIMEOUT_MS` — unsettled deliveries come back after this (default: `30000`)
/// - `MAX_DELIVERY_ATTEMPTS` — deliveries before dead-lettering (default: `5`)
/// - `CONSUMER_CONCURRENCY` — in-flight messages per consumer (default: `8`)
/// - `RELAY_INTERVAL_MS` / `RELAY_GRACE_MS` — outbox sweep pacing (default: `1000` / `500`)
/// - `PARTICIPANTS` — comma-separated employee ids known to the directory
///
/// Values that fail to parse fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub store_timeout_ms: u64,
    pub broker_receive_timeout_ms: u64,
    pub handler_timeout_ms: u64,
    pub visibility_timeout_ms: u64,
    pub max_delivery_attempts: u32,
    pub consumer_concurrency: usize,
    pub relay_interval_ms: u64,
    pub relay_grace_ms: u64,
    pub participants: Vec<EmployeeId>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        fn parse_key<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }
        let lookup = &lookup;

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_key(lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.log_format),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            store_timeout_ms: parse_key(lookup, "STORE_TIMEOUT_MS").unwrap_or(defaults.store_timeout_ms),
            broker_receive_timeout_ms: parse_key(lookup, "BROKER_RECEIVE_TIMEOUT_MS")
                .unwrap_or(defaults.broker_receive_timeout_ms),
            handler_timeout_ms: parse_key(lookup, "HANDLER_TIMEOUT_MS")
                .unwrap_or(defaults.handler_timeout_ms),
            visibility_timeout_ms: parse_key(lookup, "VISIBILITY_TIMEOUT_MS")
                .unwrap_or(defaults.visibility_timeout_ms),
            max_delivery_attempts: parse_key(lookup, "MAX_DELIVERY_ATTEMPTS")
                .unwrap_or(defaults.max_delivery_attempts),
            consumer_concurrency: parse_key(lookup, "CONSUMER_CONCURRENCY")
                .unwrap_or(defaults.consumer_concurrency),
            relay_interval_ms: parse_key(lookup, "RELAY_INTERVAL_MS").unwrap_or(defaults.relay_interval_ms),
            relay_grace_ms: parse_key(lookup, "RELAY_GRACE_MS").unwrap_or(defaults.relay_grace_ms),
            participants: lookup("PARTICIPANTS")
                .map(|v| parse_participants(&v))
                .unwrap_or_default(),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            store: Duration::from_millis(self.store_timeout_ms),
            collaborator: Duration::from_millis(self.store_timeout_ms),
        }
    }

    /// Bound on handling one message, never shorter than the worst case of
    /// one step outcome: four store calls and a notification.
    ///
    /// A handler cut off between its commit and the notification would
    /// leave the redelivery looking like a duplicate, so the notification
    /// would never be sent.
    pub fn handler_timeout(&self) -> Duration {
        let timeouts = self.timeouts();
        let worst_case = timeouts.store * 4 + timeouts.collaborator;
        Duration::from_millis(self.handler_timeout_ms).max(worst_case)
    }

    /// How long a delivery may stay unsettled, always longer than a
    /// handler may run.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
            .max(self.handler_timeout() + Duration::from_secs(1))
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            consumer: ConsumerSettings {
                concurrency: self.consumer_concurrency,
                receive_timeout: Duration::from_millis(self.broker_receive_timeout_ms),
                handler_timeout: self.handler_timeout(),
            },
            relay: RelaySettings {
                interval: Duration::from_millis(self.relay_interval_ms),
                grace: Duration::from_millis(self.relay_grace_ms),
                ..RelaySettings::default()
            },
        }
    }
}

/// Parses a comma-separated id list, skipping anything that is not a
/// positive integer.
fn parse_participants(value: &str) -> Vec<EmployeeId> {
    value
        .split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .map(EmployeeId::new)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            store_timeout_ms: 2000,
            broker_receive_timeout_ms: 1000,
            handler_timeout_ms: 10000,
            visibility_timeout_ms: 30000,
            max_delivery_attempts: 5,
            consumer_concurrency: 8,
            relay_interval_ms: 1000,
            relay_grace_ms: 500,
            participants: Vec::new(),
        }
    }
}
