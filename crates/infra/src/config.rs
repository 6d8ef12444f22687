//! Configuration loading and representation.
//!
//! Settings are read through a [`ConfigReader`], a flat key/value view. The
//! process uses [`EnvConfig`] (`WORKFLOWS_*` environment variables); tests use
//! [`MapConfig`].

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::{StreamOptions, StreamStart};

pub const SETTING_MONGO_URL: &str = "mongo_url";
pub const SETTING_DB_NAME: &str = "db_name";
pub const SETTING_DB_USERNAME: &str = "db_username";
pub const SETTING_DB_PASSWORD: &str = "db_password";
pub const SETTING_DB_SSL: &str = "db_ssl";
pub const SETTING_DB_SSL_SKIP_VERIFY: &str = "db_ssl_skipverify";
pub const SETTING_STREAM_START: &str = "stream_start";
pub const SETTING_JOBS_COLLECTION_SIZE: &str = "jobs_collection_size";

pub const DEFAULT_MONGO_URL: &str = "mongodb://mongo-workflows:27017";
pub const DEFAULT_DB_NAME: &str = "workflows";
pub const DEFAULT_ENV_PREFIX: &str = "WORKFLOWS";

/// Capped collection size for the jobs collection (10 MiB).
pub const DEFAULT_JOBS_COLLECTION_SIZE: u64 = 10 * 1024 * 1024;

/// Bound on connection bootstrap (connect + ping).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for setting {key}")]
    Invalid { key: String, value: String },
}

impl ConfigError {
    fn invalid(key: &str, value: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.into(),
        }
    }
}

/// Flat key/value configuration source.
pub trait ConfigReader {
    /// Raw value for `key`, if set.
    fn get(&self, key: &str) -> Option<String>;

    fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "" => Ok(default),
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, raw)),
            },
        }
    }
}

/// Environment-backed reader: `db_name` is looked up as `<PREFIX>_DB_NAME`.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    prefix: String,
}

impl EnvConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key.to_ascii_uppercase())
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENV_PREFIX)
    }
}

impl ConfigReader for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.var_name(key)).ok()
    }
}

/// In-memory reader for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    values: HashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }
}

impl ConfigReader for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// TLS toggle for the store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlsSettings {
    /// Accept certificates that fail verification.
    pub skip_verify: bool,
}

/// Connection settings for the backing document store.
#[derive(Clone, PartialEq, Eq)]
pub struct MongoSettings {
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsSettings>,
    pub connect_timeout: Duration,
}

impl MongoSettings {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            username: None,
            password: None,
            tls: None,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_tls(mut self, skip_verify: bool) -> Self {
        self.tls = Some(TlsSettings { skip_verify });
        self
    }
}

// Keep the password out of logs.
impl core::fmt::Debug for MongoSettings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MongoSettings")
            .field("uri", &self.uri)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Everything the job store needs at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub mongo: MongoSettings,
    pub database: String,
    pub jobs_collection_size: u64,
    pub stream: StreamOptions,
}

impl StoreSettings {
    pub fn from_reader(reader: &impl ConfigReader) -> Result<Self, ConfigError> {
        let mut mongo = MongoSettings::new(reader.get_string(SETTING_MONGO_URL, DEFAULT_MONGO_URL));

        let username = reader.get_string(SETTING_DB_USERNAME, "");
        if !username.is_empty() {
            mongo.username = Some(username);
            mongo.password = Some(reader.get_string(SETTING_DB_PASSWORD, ""));
        }

        if reader.get_bool(SETTING_DB_SSL, false)? {
            mongo = mongo.with_tls(reader.get_bool(SETTING_DB_SSL_SKIP_VERIFY, false)?);
        }

        let start_raw = reader.get_string(SETTING_STREAM_START, "beginning");
        let start = start_raw
            .parse::<StreamStart>()
            .map_err(|_| ConfigError::invalid(SETTING_STREAM_START, start_raw))?;

        let jobs_collection_size = match reader.get(SETTING_JOBS_COLLECTION_SIZE) {
            None => DEFAULT_JOBS_COLLECTION_SIZE,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(size) if size > 0 => size,
                _ => return Err(ConfigError::invalid(SETTING_JOBS_COLLECTION_SIZE, raw)),
            },
        };

        Ok(Self {
            mongo,
            database: reader.get_string(SETTING_DB_NAME, DEFAULT_DB_NAME),
            jobs_collection_size,
            stream: StreamOptions {
                start,
                ..StreamOptions::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let settings = StoreSettings::from_reader(&MapConfig::new()).unwrap();
        assert_eq!(settings.mongo.uri, DEFAULT_MONGO_URL);
        assert_eq!(settings.database, DEFAULT_DB_NAME);
        assert!(settings.mongo.username.is_none());
        assert!(settings.mongo.tls.is_none());
        assert_eq!(settings.mongo.connect_timeout, CONNECT_TIMEOUT);
        assert_eq!(settings.jobs_collection_size, DEFAULT_JOBS_COLLECTION_SIZE);
        assert_eq!(settings.stream.start, StreamStart::Beginning);
    }

    #[test]
    fn password_is_ignored_without_username() {
        let cfg = MapConfig::new().set(SETTING_DB_PASSWORD, "secret");
        let settings = StoreSettings::from_reader(&cfg).unwrap();
        assert!(settings.mongo.username.is_none());
        assert!(settings.mongo.password.is_none());
    }

    #[test]
    fn credentials_and_tls_are_read() {
        let cfg = MapConfig::new()
            .set(SETTING_MONGO_URL, "mongodb://db:27017/?replicaSet=rs0")
            .set(SETTING_DB_NAME, "jobs")
            .set(SETTING_DB_USERNAME, "worker")
            .set(SETTING_DB_PASSWORD, "pw")
            .set(SETTING_DB_SSL, "true")
            .set(SETTING_DB_SSL_SKIP_VERIFY, "1")
            .set(SETTING_STREAM_START, "latest");

        let settings = StoreSettings::from_reader(&cfg).unwrap();
        assert_eq!(settings.database, "jobs");
        assert_eq!(settings.mongo.username.as_deref(), Some("worker"));
        assert_eq!(settings.mongo.password.as_deref(), Some("pw"));
        assert_eq!(settings.mongo.tls, Some(TlsSettings { skip_verify: true }));
        assert_eq!(settings.stream.start, StreamStart::Latest);
    }

    #[test]
    fn invalid_values_are_reported() {
        let cfg = MapConfig::new().set(SETTING_DB_SSL, "maybe");
        assert_eq!(
            StoreSettings::from_reader(&cfg),
            Err(ConfigError::Invalid {
                key: SETTING_DB_SSL.to_string(),
                value: "maybe".to_string()
            })
        );

        let cfg = MapConfig::new().set(SETTING_STREAM_START, "yesterday");
        assert!(StoreSettings::from_reader(&cfg).is_err());

        let cfg = MapConfig::new().set(SETTING_JOBS_COLLECTION_SIZE, "0");
        assert!(StoreSettings::from_reader(&cfg).is_err());
    }

    #[test]
    fn env_keys_are_prefixed_and_upper_cased() {
        let cfg = EnvConfig::new("WORKFLOWS");
        assert_eq!(cfg.var_name(SETTING_DB_SSL_SKIP_VERIFY), "WORKFLOWS_DB_SSL_SKIPVERIFY");
    }

    #[test]
    fn debug_redacts_password() {
        let settings = MongoSettings::new("mongodb://db").with_credentials("u", "hunter2");
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
