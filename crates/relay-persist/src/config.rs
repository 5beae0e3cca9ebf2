//! Backend selection and environment configuration
//!
//! The adapter is chosen by configuration at startup, never by subclassing:
//! [`StorageConfig::from_env`] reads the environment and [`open`] constructs
//! the selected adapter. The caller owns the lifecycle — `initialize` once
//! before use, `shutdown` on the way out.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{StorageBackend, StorageError};
use crate::file::{FileStore, DEFAULT_FLUSH_INTERVAL};
use crate::sqlite::{SqliteConfig, SqliteStore};
use crate::supabase::SupabaseStore;

/// Configuration keys the application layer reserves. This crate stores
/// them as opaque key/value pairs and enforces nothing about their content.
pub const CONFIG_KEY_LLM_TYPE: &str = "llm_type";
pub const CONFIG_KEY_LLM_MODEL: &str = "llm_model";
pub const CONFIG_KEY_OPENAI_API_KEY: &str = "openai_api_key";

/// Which backend adapter to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    File,
    Sqlite,
    Supabase,
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "fs" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            "supabase" => Ok(Self::Supabase),
            other => Err(StorageError::Invalid(format!(
                "unknown backend {other:?} (expected file, sqlite, or supabase)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Data directory for the file backend.
    pub data_dir: PathBuf,
    /// Flush interval for the file backend.
    pub flush_interval: Duration,
    /// Connection URL for the sqlite backend.
    pub database_url: String,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            data_dir: PathBuf::from("data"),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            database_url: "sqlite:relay.db?mode=rwc".to_string(),
            supabase_url: None,
            supabase_key: None,
        }
    }
}

impl StorageConfig {
    /// Load configuration from environment variables:
    /// `RELAY_BACKEND`, `RELAY_DATA_DIR`, `RELAY_FLUSH_INTERVAL_SECS`,
    /// `DATABASE_URL`, `SUPABASE_URL`, `SUPABASE_KEY`.
    pub fn from_env() -> Result<Self, StorageError> {
        let defaults = Self::default();
        let backend = match env::var("RELAY_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => BackendKind::default(),
        };
        Ok(Self {
            backend,
            data_dir: env::var("RELAY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            flush_interval: env::var("RELAY_FLUSH_INTERVAL_SECS")
                .ok()
                .and_then(|value| value.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.flush_interval),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            supabase_url: env::var("SUPABASE_URL").ok(),
            supabase_key: env::var("SUPABASE_KEY").ok(),
        })
    }
}

/// Construct the configured adapter.
///
/// The returned store is not yet initialized; call
/// [`StorageBackend::initialize`] once before anything else.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match config.backend {
        BackendKind::File => Ok(Arc::new(FileStore::with_flush_interval(
            config.data_dir.clone(),
            config.flush_interval,
        ))),
        BackendKind::Sqlite => {
            let store = SqliteStore::connect_with_config(SqliteConfig {
                url: config.database_url.clone(),
                ..Default::default()
            })
            .await?;
            Ok(Arc::new(store))
        }
        BackendKind::Supabase => {
            let url = config.supabase_url.as_deref().ok_or_else(|| {
                StorageError::Invalid("SUPABASE_URL is required for the supabase backend".into())
            })?;
            let api_key = config.supabase_key.as_deref().ok_or_else(|| {
                StorageError::Invalid("SUPABASE_KEY is required for the supabase backend".into())
            })?;
            Ok(Arc::new(SupabaseStore::new(url, api_key)))
        }
    }
}
