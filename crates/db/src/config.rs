//! Connection settings for the local database.

use std::fmt;
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;

use crate::error::ConnectionError;

/// Default maximum pool size.
const DEFAULT_POOL_SIZE: u32 = 5;

/// Default time to wait for a single connection attempt.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Where and how to reach the local database.
///
/// Credentials never leave the execution host; `Debug` output redacts the
/// password.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    /// Maximum connections held by the shared pool.
    pub max_connections: u32,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            max_connections: DEFAULT_POOL_SIZE,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl DatabaseConfig {
    /// Load settings from the process environment.
    ///
    /// | Env Var                  | Default     |
    /// |--------------------------|-------------|
    /// | `DB_HOST`                | `localhost` |
    /// | `DB_PORT`                | `5432`      |
    /// | `DB_NAME`                | `postgres`  |
    /// | `DB_USER`                | `postgres`  |
    /// | `DB_PASSWORD`            | `postgres`  |
    /// | `DB_POOL_SIZE`           | `5`         |
    /// | `DB_CONNECT_TIMEOUT_SECS`| `10`        |
    pub fn from_env() -> Result<Self, ConnectionError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConnectionError> {
        let defaults = Self::default();

        let port = match lookup("DB_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ConnectionError::Config(format!("DB_PORT must be a valid port, got '{raw}'")))?,
            None => defaults.port,
        };

        let max_connections = match lookup("DB_POOL_SIZE") {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConnectionError::Config(format!(
                        "DB_POOL_SIZE must be a positive integer, got '{raw}'"
                    )))
                }
            },
            None => defaults.max_connections,
        };

        let connect_timeout = match lookup("DB_CONNECT_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.trim().parse::<u64>().map_err(|_| {
                ConnectionError::Config(format!(
                    "DB_CONNECT_TIMEOUT_SECS must be a whole number of seconds, got '{raw}'"
                ))
            })?),
            None => defaults.connect_timeout,
        };

        Ok(Self {
            host: lookup("DB_HOST").unwrap_or(defaults.host),
            port,
            name: lookup("DB_NAME").unwrap_or(defaults.name),
            user: lookup("DB_USER").unwrap_or(defaults.user),
            password: lookup("DB_PASSWORD").unwrap_or(defaults.password),
            max_connections,
            connect_timeout,
        })
    }

    /// `host:port`, for logs and diagnostics.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// sqlx connect options built from these settings.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
    }

    /// Environment variables that hand these settings to a job process.
    pub fn to_env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("DB_HOST".to_string(), self.host.clone()),
            ("DB_PORT".to_string(), self.port.to_string()),
            ("DB_NAME".to_string(), self.name.clone()),
            ("DB_USER".to_string(), self.user.clone()),
            ("DB_PASSWORD".to_string(), self.password.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = DatabaseConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, DatabaseConfig::default());
        assert_eq!(config.address(), "localhost:5432");
    }

    #[test]
    fn reads_all_fields() {
        let config = DatabaseConfig::from_lookup(lookup_from(&[
            ("DB_HOST", "db.internal"),
            ("DB_PORT", "6543"),
            ("DB_NAME", "warehouse"),
            ("DB_USER", "etl"),
            ("DB_PASSWORD", "hunter2"),
            ("DB_POOL_SIZE", "2"),
            ("DB_CONNECT_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 6543);
        assert_eq!(config.name, "warehouse");
        assert_eq!(config.user, "etl");
        assert_eq!(config.password, "hunter2");
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn rejects_bad_port() {
        let result = DatabaseConfig::from_lookup(lookup_from(&[("DB_PORT", "not-a-port")]));
        assert_matches!(result, Err(ConnectionError::Config(msg)) if msg.contains("DB_PORT"));
    }

    #[test]
    fn rejects_zero_pool_size() {
        let result = DatabaseConfig::from_lookup(lookup_from(&[("DB_POOL_SIZE", "0")]));
        assert_matches!(result, Err(ConnectionError::Config(_)));
    }

    #[test]
    fn debug_redacts_password() {
        let config = DatabaseConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn env_vars_round_trip_through_lookup() {
        let config = DatabaseConfig {
            host: "10.0.0.5".to_string(),
            port: 5433,
            ..Default::default()
        };
        let vars: HashMap<String, String> = config.to_env_vars().into_iter().collect();
        let reloaded = DatabaseConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(reloaded.host, "10.0.0.5");
        assert_eq!(reloaded.port, 5433);
        assert_eq!(reloaded.password, config.password);
    }
}
