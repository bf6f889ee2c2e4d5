//! Runtime configuration, read from the environment (and `.env` via
//! `dotenvy`, loaded by `main` before this runs).
use crate::errors::{Error, Result};
use crate::model::UniquenessKey;
use sqlx::postgres::PgConnectOptions;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BODY_LIMIT_BYTES: usize = 50 * 1024 * 1024;

/// Where the database lives. Either a full URL or the individual parts.
#[derive(Clone)]
pub enum DatabaseConfig {
    Url(String),
    Parts {
        host: String,
        port: u16,
        user: String,
        password: String,
        name: String,
    },
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        match self {
            Self::Url(url) => PgConnectOptions::from_str(url)
                .map_err(|e| Error::Config(format!("Invalid DATABASE_URL: {}", e))),
            Self::Parts {
                host,
                port,
                user,
                password,
                name,
            } => Ok(PgConnectOptions::new()
                .host(host)
                .port(*port)
                .username(user)
                .password(password)
                .database(name)),
        }
    }

    /// Printable form with credentials removed.
    pub fn describe(&self) -> String {
        match self {
            Self::Url(url) => match url.rsplit_once('@') {
                Some((_, host_part)) => format!("postgres://****@{}", host_part),
                None => "postgres://****".to_string(),
            },
            Self::Parts {
                host,
                port,
                user,
                name,
                ..
            } => format!("postgres://{}:****@{}:{}/{}", user, host, port, name),
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

#[derive(Clone)]
pub struct Config {
    pub api_key: String,
    pub database: DatabaseConfig,
    pub host: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,
    pub body_limit: usize,
    pub uniqueness_key: UniquenessKey,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let require = |name: &str| {
            get(name).ok_or_else(|| Error::Config(format!("{} must be set", name)))
        };

        let api_key = require("API_KEY")?;

        let database = match get("DATABASE_URL") {
            Some(url) => DatabaseConfig::Url(url),
            None => DatabaseConfig::Parts {
                host: require("DB_HOST")?,
                port: parse_or("DB_PORT", get("DB_PORT"), DEFAULT_DB_PORT)?,
                user: require("DB_USER")?,
                password: require("DB_PASS")?,
                name: require("DB_NAME")?,
            },
        };

        let uniqueness_key = match get("UNIQUENESS_KEY") {
            Some(raw) => UniquenessKey::parse(&raw).ok_or_else(|| {
                Error::Config(format!(
                    "UNIQUENESS_KEY must be `timestamp_device` or `timestamp`, got `{}`",
                    raw
                ))
            })?,
            None => UniquenessKey::default(),
        };

        Ok(Self {
            api_key,
            database,
            host: get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or("PORT", get("PORT"), DEFAULT_PORT)?,
            db_max_connections: parse_or(
                "DB_MAX_CONNECTIONS",
                get("DB_MAX_CONNECTIONS"),
                DEFAULT_DB_MAX_CONNECTIONS,
            )?,
            db_acquire_timeout: Duration::from_secs(parse_or(
                "DB_ACQUIRE_TIMEOUT_SECS",
                get("DB_ACQUIRE_TIMEOUT_SECS"),
                DEFAULT_DB_ACQUIRE_TIMEOUT_SECS,
            )?),
            body_limit: parse_or(
                "BODY_LIMIT_BYTES",
                get("BODY_LIMIT_BYTES"),
                DEFAULT_BODY_LIMIT_BYTES,
            )?,
            uniqueness_key,
        })
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded:");
        info!("  database          : {}", self.database.describe());
        info!("  http address      : {}", self.http_addr());
        info!("  max connections   : {}", self.db_max_connections);
        info!("  acquire timeout   : {:?}", self.db_acquire_timeout);
        info!("  body limit        : {} bytes", self.body_limit);
        info!("  uniqueness key    : {:?}", self.uniqueness_key);
        info!("  api key           : ****");
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &"****")
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_max_connections", &self.db_max_connections)
            .field("db_acquire_timeout", &self.db_acquire_timeout)
            .field("body_limit", &self.body_limit)
            .field("uniqueness_key", &self.uniqueness_key)
            .finish()
    }
}

fn parse_or<T: FromStr>(name: &str, raw: Option<String>, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {}: {}", name, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    const PARTS: &[(&str, &str)] = &[
        ("API_KEY", "s3cret"),
        ("DB_HOST", "db"),
        ("DB_USER", "climate"),
        ("DB_PASS", "hunter2"),
        ("DB_NAME", "readings"),
    ];

    #[test]
    fn test_defaults_from_db_parts() {
        let config = load(PARTS).unwrap();

        assert_eq!(config.api_key, "s3cret");
        assert_eq!(config.http_addr(), "0.0.0.0:3000");
        assert_eq!(config.db_max_connections, 20);
        assert_eq!(config.db_acquire_timeout, Duration::from_secs(10));
        assert_eq!(config.body_limit, 50 * 1024 * 1024);
        assert_eq!(config.uniqueness_key, UniquenessKey::TimestampDevice);
        match config.database {
            DatabaseConfig::Parts { port, .. } => assert_eq!(port, 5432),
            other => panic!("unexpected database config {:?}", other),
        }
    }

    #[test]
    fn test_api_key_required() {
        let vars: Vec<_> = PARTS.iter().filter(|(k, _)| *k != "API_KEY").copied().collect();
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("API_KEY must be set"));

        let mut vars = PARTS.to_vec();
        vars[0] = ("API_KEY", "  ");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_db_password_required_without_url() {
        let vars: Vec<_> = PARTS.iter().filter(|(k, _)| *k != "DB_PASS").copied().collect();
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("DB_PASS"));
    }

    #[test]
    fn test_database_url_takes_precedence() {
        let config = load(&[
            ("API_KEY", "k"),
            ("DATABASE_URL", "postgres://climate:hunter2@db:5432/readings"),
            ("PORT", "8080"),
            ("UNIQUENESS_KEY", "timestamp"),
        ])
        .unwrap();

        assert!(matches!(config.database, DatabaseConfig::Url(_)));
        assert_eq!(config.port, 8080);
        assert_eq!(config.uniqueness_key, UniquenessKey::Timestamp);
        assert!(config.database.connect_options().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut vars = PARTS.to_vec();
        vars.push(("PORT", "eighty"));
        assert!(load(&vars).is_err());

        let mut vars = PARTS.to_vec();
        vars.push(("UNIQUENESS_KEY", "device"));
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_credentials_masked() {
        let config = load(PARTS).unwrap();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("s3cret"));

        let url = DatabaseConfig::Url("postgres://climate:hunter2@db:5432/readings".to_string());
        assert_eq!(url.describe(), "postgres://****@db:5432/readings");
    }
}
