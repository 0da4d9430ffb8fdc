use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::crypto::{MasterKey, PasteCrypto, DEFAULT_PBKDF2_ITERATIONS, MIN_PBKDF2_ITERATIONS};
use super::ratelimit::{RateLimitPolicy, RateLimiter, TierLimits};
use super::service::DEFAULT_CONFLICT_RETRIES;
use super::sqlite::SqlitePasteStore;
use crate::{MemoryPasteStore, SharedPasteStore};

pub const MASTER_KEY_ENV: &str = "PSTI_ENCRYPTION_KEY";
pub const CONFIG_PATH_ENV: &str = "PSTI_CONFIG";

/// Startup failures. Any of these aborts the server before it binds.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("master key is not configured (set {MASTER_KEY_ENV})")]
    MissingMasterKey,
    #[error("master key is not valid hex")]
    MasterKeyEncoding,
    #[error("master key must be {expected} bytes, got {actual}")]
    MasterKeyLength { expected: usize, actual: usize },
    #[error("pbkdf2 iteration count {0} is below the minimum of {MIN_PBKDF2_ITERATIONS}")]
    Iterations(u32),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to open paste store: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite(PathBuf),
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("memory") {
            return Ok(StorageBackend::Memory);
        }
        match value.split_once(':') {
            Some((scheme, path)) if scheme.eq_ignore_ascii_case("sqlite") && !path.is_empty() => {
                Ok(StorageBackend::Sqlite(PathBuf::from(path)))
            }
            _ => Err(format!(
                "expected \"memory\" or \"sqlite:<path>\", got {value:?}"
            )),
        }
    }
}

impl TryFrom<String> for StorageBackend {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub anonymous_create: u32,
    pub anonymous_view: u32,
    pub authenticated_create: u32,
    pub authenticated_view: u32,
    pub window_secs: u64,
    pub max_clients: usize,
    pub sweep_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            anonymous_create: 5,
            anonymous_view: 100,
            authenticated_create: 50,
            authenticated_view: 500,
            window_secs: 60 * 60,
            max_clients: 100_000,
            sweep_secs: 60,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub master_key: Option<String>,
    pub pbkdf2_iterations: u32,
    pub address: String,
    pub port: u16,
    #[serde(deserialize_with = "deserialize_storage")]
    pub storage: StorageBackend,
    pub gc_interval_secs: u64,
    pub conflict_retries: u32,
    pub rate_limit: RateLimitSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            address: "0.0.0.0".to_string(),
            port: 8000,
            storage: StorageBackend::Memory,
            gc_interval_secs: 300,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .field("pbkdf2_iterations", &self.pbkdf2_iterations)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("storage", &self.storage)
            .field("gc_interval_secs", &self.gc_interval_secs)
            .field("conflict_retries", &self.conflict_retries)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

fn deserialize_storage<'de, D>(deserializer: D) -> Result<StorageBackend, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl ServerConfig {
    /// File first (explicit path, else `PSTI_CONFIG`), then `PSTI_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw, &path.display().to_string())
    }

    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(MASTER_KEY_ENV) {
            self.master_key = Some(key);
        }
        if let Some(value) = lookup("PSTI_PBKDF2_ITERATIONS") {
            self.pbkdf2_iterations = parse_value("PSTI_PBKDF2_ITERATIONS", &value)?;
        }
        if let Some(value) = lookup("PSTI_ADDRESS") {
            self.address = value;
        }
        if let Some(value) = lookup("PSTI_PORT") {
            self.port = parse_value("PSTI_PORT", &value)?;
        }
        if let Some(value) = lookup("PSTI_STORAGE") {
            self.storage = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PSTI_STORAGE",
                value,
            })?;
        }
        if let Some(value) = lookup("PSTI_GC_INTERVAL_SECS") {
            self.gc_interval_secs = parse_value("PSTI_GC_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = lookup("PSTI_CONFLICT_RETRIES") {
            self.conflict_retries = parse_value("PSTI_CONFLICT_RETRIES", &value)?;
        }
        if let Some(value) = lookup("PSTI_RATE_WINDOW_SECS") {
            self.rate_limit.window_secs = parse_value("PSTI_RATE_WINDOW_SECS", &value)?;
        }
        if let Some(value) = lookup("PSTI_RATE_MAX_CLIENTS") {
            self.rate_limit.max_clients = parse_value("PSTI_RATE_MAX_CLIENTS", &value)?;
        }
        if let Some(value) = lookup("PSTI_RATE_SWEEP_SECS") {
            self.rate_limit.sweep_secs = parse_value("PSTI_RATE_SWEEP_SECS", &value)?;
        }
        Ok(())
    }

    pub fn master_key(&self) -> Result<MasterKey, ConfigError> {
        let encoded = self
            .master_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingMasterKey)?;
        MasterKey::from_hex(encoded)
    }

    pub fn build_crypto(&self) -> Result<PasteCrypto, ConfigError> {
        if self.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(ConfigError::Iterations(self.pbkdf2_iterations));
        }
        Ok(PasteCrypto::new(self.master_key()?, self.pbkdf2_iterations))
    }

    pub fn open_store(&self) -> Result<SharedPasteStore, ConfigError> {
        match &self.storage {
            StorageBackend::Memory => Ok(Arc::new(MemoryPasteStore::new())),
            StorageBackend::Sqlite(path) => SqlitePasteStore::open(path)
                .map(|store| Arc::new(store) as SharedPasteStore)
                .map_err(|err| ConfigError::Store(err.to_string())),
        }
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        let settings = &self.rate_limit;
        RateLimiter::new(RateLimitPolicy {
            anonymous: TierLimits {
                create: settings.anonymous_create,
                view: settings.anonymous_view,
            },
            authenticated: TierLimits {
                create: settings.authenticated_create,
                view: settings.authenticated_view,
            },
            window: Duration::from_secs(settings.window_secs),
            max_clients: settings.max_clients,
        })
    }

    /// How often idle clients are dropped from the rate limiter.
    pub fn rate_limit_sweep(&self) -> Option<Duration> {
        let secs = self.rate_limit.sweep_secs;
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn gc_interval(&self) -> Option<Duration> {
        (self.gc_interval_secs > 0).then(|| Duration::from_secs(self.gc_interval_secs))
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
