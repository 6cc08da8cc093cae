//! Runtime configuration read from environment variables.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `LEDGER_STORE` | `memory` | `memory` or `postgres` |
//! | `LEDGER_LOCK_TIMEOUT_MS` | `5000` | bounded wait for a row lock |
//! | `DATABASE_URL` | built from `DB_*` | Postgres connection string |
//! | `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`, `DB_NAME`, `DB_SSLMODE` | `localhost`, `5432`, `user`, `pass`, `mydb`, `disable` | DSN parts |
//! | `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS` | `10`, `5` | pool size |

use crate::error::ConfigError;
use std::time::Duration;

/// Which ledger store backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Postgres,
}

/// Connection pool settings for the Postgres backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub backend: Backend,
    pub lock_timeout: Duration,
    pub database: DatabaseConfig,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns a variable's value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let backend = match get("LEDGER_STORE", "memory").trim().to_ascii_lowercase().as_str() {
            "memory" => Backend::Memory,
            "postgres" => Backend::Postgres,
            other => return Err(ConfigError::UnknownBackend(other.to_string())),
        };

        let lock_timeout = Duration::from_millis(parse_number(
            "LEDGER_LOCK_TIMEOUT_MS",
            &get("LEDGER_LOCK_TIMEOUT_MS", "5000"),
        )?);

        let url = lookup("DATABASE_URL").unwrap_or_else(|| {
            format!(
                "postgres://{}:{}@{}:{}/{}?sslmode={}",
                get("DB_USER", "user"),
                get("DB_PASSWORD", "pass"),
                get("DB_HOST", "localhost"),
                get("DB_PORT", "5432"),
                get("DB_NAME", "mydb"),
                get("DB_SSLMODE", "disable"),
            )
        });

        let database = DatabaseConfig {
            url,
            max_connections: parse_number("DB_MAX_CONNECTIONS", &get("DB_MAX_CONNECTIONS", "10"))?,
            min_connections: parse_number("DB_MIN_CONNECTIONS", &get("DB_MIN_CONNECTIONS", "5"))?,
            max_lifetime: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            acquire_timeout: Duration::from_secs(10),
        };

        Ok(Config {
            backend,
            lock_timeout,
            database,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
