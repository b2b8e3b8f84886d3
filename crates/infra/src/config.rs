//! Configuration loaded from the process environment.
//!
//! Unset variables take their defaults; unparsable ones are logged and also
//! fall back to the default instead of failing startup.

use std::str::FromStr;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use tracing::warn;

pub const DEFAULT_RESERVATION_TTL_SECS: u64 = 900;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 100;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;
pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// TTL applied when a reservation request does not carry one.
    pub default_reservation_ttl: Duration,
    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,
    /// Longest wait for a single stock row lock.
    pub lock_timeout: Duration,
    /// Extra attempts after a version conflict at commit.
    pub max_conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_reservation_ttl: Duration::from_secs(DEFAULT_RESERVATION_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            max_conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            default_reservation_ttl: parse_var(&lookup, "RESERVATION_DEFAULT_TTL_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_reservation_ttl),
            sweep_interval: parse_var(&lookup, "RESERVATION_EXPIRY_SWEEP_SECS")
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            sweep_batch_size: parse_var(&lookup, "RESERVATION_SWEEP_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.sweep_batch_size),
            lock_timeout: parse_var(&lookup, "STOCK_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            max_conflict_retries: parse_var(&lookup, "STOCK_CONFLICT_RETRIES")
                .unwrap_or(defaults.max_conflict_retries),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_sweep_batch_size(mut self, batch_size: usize) -> Self {
        self.sweep_batch_size = batch_size;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

/// Postgres connection settings (`INVENTORY_DB_*`).
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Server-side `lock_timeout`; a row lock wait past it fails with `55P03`.
    pub lock_timeout: Duration,
    /// Server-side `statement_timeout`; a statement running past it fails with `57014`.
    pub statement_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5433,
            user: "inventory_user".to_string(),
            password: "inventory_password".to_string(),
            database: "inventory_db".to_string(),
            ssl_mode: "disable".to_string(),
            max_connections: 25,
            min_connections: 5,
            max_lifetime: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            connect_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            statement_timeout: Duration::from_millis(DEFAULT_STATEMENT_TIMEOUT_MS),
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("lock_timeout", &self.lock_timeout)
            .field("statement_timeout", &self.statement_timeout)
            .finish_non_exhaustive()
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("INVENTORY_DB_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "INVENTORY_DB_PORT").unwrap_or(defaults.port),
            user: lookup("INVENTORY_DB_USER").unwrap_or(defaults.user),
            password: lookup("INVENTORY_DB_PASSWORD").unwrap_or(defaults.password),
            database: lookup("INVENTORY_DB_NAME").unwrap_or(defaults.database),
            ssl_mode: lookup("INVENTORY_DB_SSLMODE").unwrap_or(defaults.ssl_mode),
            lock_timeout: parse_var(&lookup, "STOCK_LOCK_TIMEOUT_MS")
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            statement_timeout: parse_var(&lookup, "INVENTORY_DB_STATEMENT_TIMEOUT_MS")
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.statement_timeout),
            ..defaults
        }
    }

    /// Every connection starts with `lock_timeout` and `statement_timeout` set,
    /// so no write can block on another session's row lock indefinitely.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        let ssl_mode: PgSslMode = self.ssl_mode.parse()?;
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(ssl_mode)
            .options([
                ("lock_timeout", format!("{}ms", self.lock_timeout.as_millis())),
                ("statement_timeout", format!("{}ms", self.statement_timeout.as_millis())),
            ]))
    }

    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .max_lifetime(self.max_lifetime)
            .idle_timeout(self.idle_timeout)
            .acquire_timeout(self.connect_timeout)
            .test_before_acquire(true)
    }

    /// Open the pool and wait for a first connection (bounded by `connect_timeout`).
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        self.pool_options().connect_with(self.connect_options()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(EngineConfig::from_lookup(lookup(&[])), EngineConfig::default());
        let db = DatabaseConfig::from_lookup(lookup(&[]));
        assert_eq!(db.max_connections, 25);
        assert_eq!(db.min_connections, 5);
    }

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("RESERVATION_DEFAULT_TTL_SECS", "120"),
            ("RESERVATION_EXPIRY_SWEEP_SECS", "soon"),
            ("RESERVATION_SWEEP_BATCH_SIZE", "0"),
            ("STOCK_LOCK_TIMEOUT_MS", " 250 "),
            ("STOCK_CONFLICT_RETRIES", "5"),
        ]));
        assert_eq!(config.default_reservation_ttl, Duration::from_secs(120));
        assert_eq!(config.sweep_interval, Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS));
        assert_eq!(config.sweep_batch_size, DEFAULT_SWEEP_BATCH_SIZE);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.max_conflict_retries, 5);
    }

    #[test]
    fn database_settings_build_connect_options() {
        let db = DatabaseConfig::from_lookup(lookup(&[
            ("INVENTORY_DB_HOST", "db.internal"),
            ("INVENTORY_DB_PORT", "6543"),
            ("INVENTORY_DB_SSLMODE", "require"),
        ]));
        assert_eq!(db.host, "db.internal");
        assert_eq!(db.port, 6543);
        let options = db.connect_options().unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert!(!format!("{db:?}").contains("inventory_password"));
    }

    #[test]
    fn connections_carry_server_side_timeouts() {
        let db = DatabaseConfig::from_lookup(lookup(&[
            ("STOCK_LOCK_TIMEOUT_MS", "750"),
            ("INVENTORY_DB_STATEMENT_TIMEOUT_MS", "0"),
        ]));
        assert_eq!(db.lock_timeout, Duration::from_millis(750));
        assert_eq!(
            db.statement_timeout,
            Duration::from_millis(DEFAULT_STATEMENT_TIMEOUT_MS)
        );

        let options = db.connect_options().unwrap();
        let startup = options.get_options().unwrap_or_default();
        assert!(startup.contains("lock_timeout=750ms"), "{startup}");
        assert!(startup.contains("statement_timeout=30000ms"), "{startup}");
    }

    #[test]
    fn unknown_ssl_mode_is_an_error() {
        let db = DatabaseConfig {
            ssl_mode: "sometimes".to_string(),
            ..DatabaseConfig::default()
        };
        assert!(db.connect_options().is_err());
    }
}
