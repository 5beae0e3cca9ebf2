//! SQLite storage adapter
//!
//! Every contract operation is one or two parameterized statements against a
//! pooled connection. Unique-constraint violations translate to
//! [`StorageError::Conflict`], zero-row updates/deletes to
//! [`StorageError::NotFound`], connection failures to
//! [`StorageError::Unavailable`].

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use relay_core::{
    Configuration, Credential, CredentialPatch, EndpointDefinition, EndpointPatch, HttpMethod,
    LogRecord, NewCredential, NewEndpoint, NewLogRecord, SchemaVersion,
};

use crate::backend::{require_non_empty, validate_endpoint, StorageBackend, StorageError};
use crate::migrate::{self, Entity, MigrationBackend, SchemaChange};

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g. "sqlite:relay.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Enable foreign key enforcement
    pub foreign_keys: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:relay.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            foreign_keys: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Config for an in-memory database (testing). A single connection, so
    /// every query sees the same database.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            foreign_keys: true,
            busy_timeout_secs: 5,
        }
    }
}

fn connect_error(e: sqlx::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

/// Translate a statement failure, mapping unique violations to `Conflict`.
fn query_error(e: sqlx::Error, conflict: &str) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if db.kind() == sqlx::error::ErrorKind::UniqueViolation {
            return StorageError::Conflict(conflict.to_string());
        }
    }
    StorageError::Unavailable(e.to_string())
}

fn row_error(e: sqlx::Error) -> StorageError {
    StorageError::Serialization(e.to_string())
}

fn parse_uuid(text: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(text).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn create_table_sql(entity: Entity) -> &'static str {
    match entity {
        Entity::Configurations => {
            "CREATE TABLE IF NOT EXISTS configurations (
                config_key TEXT PRIMARY KEY,
                config_value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"
        }
        Entity::Endpoints => {
            "CREATE TABLE IF NOT EXISTS endpoints (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL UNIQUE,
                method TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_template TEXT NOT NULL,
                strategy TEXT,
                created_at TEXT NOT NULL
            )"
        }
        Entity::Logs => {
            "CREATE TABLE IF NOT EXISTS logs (
                id TEXT PRIMARY KEY,
                prompt TEXT NOT NULL,
                response TEXT NOT NULL,
                model TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"
        }
        Entity::Credentials => {
            "CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                owner_label TEXT,
                capabilities TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"
        }
    }
}

fn drop_table_sql(entity: Entity) -> &'static str {
    match entity {
        Entity::Configurations => "DROP TABLE IF EXISTS configurations",
        Entity::Endpoints => "DROP TABLE IF EXISTS endpoints",
        Entity::Logs => "DROP TABLE IF EXISTS logs",
        Entity::Credentials => "DROP TABLE IF EXISTS credentials",
    }
}

fn endpoint_from_row(row: &SqliteRow) -> Result<EndpointDefinition, StorageError> {
    let id: String = row.try_get("id").map_err(row_error)?;
    let method: String = row.try_get("method").map_err(row_error)?;
    Ok(EndpointDefinition {
        id: parse_uuid(&id)?,
        path: row.try_get("path").map_err(row_error)?,
        method: method
            .parse::<HttpMethod>()
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        model: row.try_get("model").map_err(row_error)?,
        prompt_template: row.try_get("prompt_template").map_err(row_error)?,
        strategy: row.try_get("strategy").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<LogRecord, StorageError> {
    let id: String = row.try_get("id").map_err(row_error)?;
    Ok(LogRecord {
        id: parse_uuid(&id)?,
        prompt: row.try_get("prompt").map_err(row_error)?,
        response: row.try_get("response").map_err(row_error)?,
        model: row.try_get("model").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
    })
}

fn credential_from_row(row: &SqliteRow) -> Result<Credential, StorageError> {
    let id: String = row.try_get("id").map_err(row_error)?;
    let capabilities: String = row.try_get("capabilities").map_err(row_error)?;
    Ok(Credential {
        id: parse_uuid(&id)?,
        key: row.try_get("key").map_err(row_error)?,
        owner_label: row.try_get("owner_label").map_err(row_error)?,
        capabilities: serde_json::from_str(&capabilities)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(row_error)?,
    })
}

fn capabilities_json<T: Serialize>(capabilities: &T) -> Result<String, StorageError> {
    serde_json::to_string(capabilities).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// A column reported by `PRAGMA table_info`. Tooling only.
#[derive(Debug, Clone, Serialize)]
pub struct TableColumn {
    pub name: String,
    pub column_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub default_value: Option<String>,
}

/// A table and its columns. Tooling only.
#[derive(Debug, Clone, Serialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<TableColumn>,
}

/// SQLite storage adapter
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect with default options.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        Self::connect_with_config(SqliteConfig {
            url: url.to_string(),
            ..Default::default()
        })
        .await
    }

    /// Connect with full configuration.
    pub async fn connect_with_config(config: SqliteConfig) -> Result<Self, StorageError> {
        let mut options =
            SqliteConnectOptions::from_str(&config.url).map_err(connect_error)?;

        if config.foreign_keys {
            options = options.pragma("foreign_keys", "ON");
        }
        // busy_timeout is in milliseconds.
        options = options.pragma(
            "busy_timeout",
            (u64::from(config.busy_timeout_secs) * 1000).to_string(),
        );
        if config.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(connect_error)?;

        info!(url = %config.url, wal = config.wal_mode, "connected to SQLite");
        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Describe one table via `PRAGMA table_info`. A secondary capability
    /// for tooling; not part of the storage contract.
    pub async fn table_definition(&self, table: &str) -> Result<TableDefinition, StorageError> {
        // PRAGMA arguments cannot be bound.
        if !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StorageError::Invalid(format!(
                "table name {table:?} is not a plain identifier"
            )));
        }
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error(e, "table_info"))?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let not_null: i64 = row.try_get("notnull").map_err(row_error)?;
            let pk: i64 = row.try_get("pk").map_err(row_error)?;
            columns.push(TableColumn {
                name: row.try_get("name").map_err(row_error)?,
                column_type: row.try_get("type").map_err(row_error)?,
                nullable: not_null == 0,
                primary_key: pk > 0,
                default_value: row.try_get("dflt_value").map_err(row_error)?,
            });
        }
        Ok(TableDefinition {
            name: table.to_string(),
            columns,
        })
    }

    /// Describe every user table.
    pub async fn all_table_definitions(&self) -> Result<Vec<TableDefinition>, StorageError> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error(e, "sqlite_master"))?;

        let mut definitions = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("name").map_err(row_error)?;
            definitions.push(self.table_definition(&name).await?);
        }
        Ok(definitions)
    }

    async fn fetch_endpoint(&self, id: Uuid) -> Result<EndpointDefinition, StorageError> {
        let row = sqlx::query("SELECT * FROM endpoints WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error(e, "endpoint"))?
            .ok_or_else(|| StorageError::NotFound(format!("endpoint {id}")))?;
        endpoint_from_row(&row)
    }

    async fn fetch_credential(&self, id: Uuid) -> Result<Credential, StorageError> {
        let row = sqlx::query("SELECT * FROM credentials WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error(e, "credential"))?
            .ok_or_else(|| StorageError::NotFound(format!("credential {id}")))?;
        credential_from_row(&row)
    }
}

#[async_trait]
impl MigrationBackend for SqliteStore {
    async fn ensure_version_tracker(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_versions (
                version TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| query_error(e, "schema_versions"))?;
        Ok(())
    }

    async fn schema_version(&self) -> Result<SchemaVersion, StorageError> {
        let row = sqlx::query(
            "SELECT version FROM schema_versions ORDER BY applied_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error(e, "schema_versions"))?;

        match row {
            Some(row) => {
                let version: String = row.try_get("version").map_err(row_error)?;
                version
                    .parse()
                    .map_err(|e: relay_core::ParseVersionError| {
                        StorageError::Serialization(e.to_string())
                    })
            }
            None => Ok(SchemaVersion::ZERO),
        }
    }

    async fn set_schema_version(&self, version: SchemaVersion) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO schema_versions (version, applied_at) VALUES (?, ?)")
            .bind(version.to_string())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| query_error(e, "schema_versions"))?;
        Ok(())
    }

    async fn remove_schema_version(&self, version: SchemaVersion) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM schema_versions WHERE version = ?")
            .bind(version.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| query_error(e, "schema_versions"))?;
        Ok(())
    }

    async fn apply_change(&self, change: &SchemaChange) -> Result<(), StorageError> {
        let sql = match change {
            SchemaChange::CreateStore(entity) => create_table_sql(*entity),
            SchemaChange::DropStore(entity) => drop_table_sql(*entity),
        };
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| query_error(e, "schema change"))?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.ensure_version_tracker().await?;
        migrate::apply_pending(self, &migrate::default_migrations()).await?;
        info!("sqlite store initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }

    async fn get_configuration(&self, key: &str) -> Result<Option<String>, StorageError> {
        require_non_empty("configuration key", key)?;
        let row = sqlx::query("SELECT config_value FROM configurations WHERE config_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error(e, "configuration"))?;
        match row {
            Some(row) => Ok(Some(row.try_get("config_value").map_err(row_error)?)),
            None => Ok(None),
        }
    }

    async fn set_configuration(&self, key: &str, value: &str) -> Result<(), StorageError> {
        require_non_empty("configuration key", key)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO configurations (config_key, config_value, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(config_key) DO UPDATE SET
                 config_value = excluded.config_value,
                 updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error(e, "configuration"))?;
        Ok(())
    }

    async fn all_configurations(&self) -> Result<Vec<Configuration>, StorageError> {
        let rows = sqlx::query("SELECT * FROM configurations ORDER BY config_key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error(e, "configurations"))?;

        rows.iter()
            .map(|row| {
                Ok(Configuration {
                    key: row.try_get("config_key").map_err(row_error)?,
                    value: row.try_get("config_value").map_err(row_error)?,
                    created_at: row.try_get("created_at").map_err(row_error)?,
                    updated_at: row.try_get("updated_at").map_err(row_error)?,
                })
            })
            .collect()
    }

    async fn add_endpoint(&self, input: NewEndpoint) -> Result<(), StorageError> {
        validate_endpoint(&input)?;
        let endpoint = EndpointDefinition::new(input);
        sqlx::query(
            "INSERT INTO endpoints (id, path, method, model, prompt_template, strategy, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(endpoint.id.to_string())
        .bind(&endpoint.path)
        .bind(endpoint.method.as_str())
        .bind(&endpoint.model)
        .bind(&endpoint.prompt_template)
        .bind(&endpoint.strategy)
        .bind(endpoint.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            query_error(
                e,
                &format!("endpoint path {:?} is already registered", endpoint.path),
            )
        })?;
        Ok(())
    }

    async fn endpoints(&self) -> Result<Vec<EndpointDefinition>, StorageError> {
        let rows = sqlx::query("SELECT * FROM endpoints ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error(e, "endpoints"))?;
        rows.iter().map(endpoint_from_row).collect()
    }

    async fn endpoint_by_path(
        &self,
        path: &str,
    ) -> Result<Option<EndpointDefinition>, StorageError> {
        let row = sqlx::query("SELECT * FROM endpoints WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error(e, "endpoint"))?;
        row.as_ref().map(endpoint_from_row).transpose()
    }

    async fn update_endpoint(&self, id: Uuid, patch: EndpointPatch) -> Result<(), StorageError> {
        let mut endpoint = self.fetch_endpoint(id).await?;
        patch.apply(&mut endpoint);
        sqlx::query(
            "UPDATE endpoints SET path = ?, method = ?, model = ?, prompt_template = ?, strategy = ?
             WHERE id = ?",
        )
        .bind(&endpoint.path)
        .bind(endpoint.method.as_str())
        .bind(&endpoint.model)
        .bind(&endpoint.prompt_template)
        .bind(&endpoint.strategy)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            query_error(
                e,
                &format!("endpoint path {:?} is already registered", endpoint.path),
            )
        })?;
        Ok(())
    }

    async fn delete_endpoint(&self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM endpoints WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| query_error(e, "endpoint"))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("endpoint {id}")));
        }
        Ok(())
    }

    async fn add_log(&self, entry: NewLogRecord) -> Result<(), StorageError> {
        let log = LogRecord::new(entry);
        sqlx::query(
            "INSERT INTO logs (id, prompt, response, model, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(log.id.to_string())
        .bind(&log.prompt)
        .bind(&log.response)
        .bind(&log.model)
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error(e, "log"))?;
        Ok(())
    }

    async fn logs(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<LogRecord>, StorageError> {
        // A negative LIMIT means "no limit" in SQLite.
        let rows = sqlx::query(
            "SELECT * FROM logs ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
        )
        .bind(limit.map(i64::from).unwrap_or(-1))
        .bind(i64::from(offset.unwrap_or(0)))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error(e, "logs"))?;
        rows.iter().map(log_from_row).collect()
    }

    async fn logs_by_model(
        &self,
        model: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<LogRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM logs WHERE model = ? ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
        )
        .bind(model)
        .bind(limit.map(i64::from).unwrap_or(-1))
        .bind(i64::from(offset.unwrap_or(0)))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error(e, "logs"))?;
        rows.iter().map(log_from_row).collect()
    }

    async fn log_count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM logs")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_error(e, "logs"))?;
        let count: i64 = row.try_get("count").map_err(row_error)?;
        Ok(count as u64)
    }

    async fn log_count_by_model(&self, model: &str) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM logs WHERE model = ?")
            .bind(model)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_error(e, "logs"))?;
        let count: i64 = row.try_get("count").map_err(row_error)?;
        Ok(count as u64)
    }

    async fn add_credential(&self, input: NewCredential) -> Result<Credential, StorageError> {
        let credential = Credential::new(input);
        sqlx::query(
            "INSERT INTO credentials (id, key, owner_label, capabilities, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(credential.id.to_string())
        .bind(&credential.key)
        .bind(&credential.owner_label)
        .bind(capabilities_json(&credential.capabilities)?)
        .bind(credential.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error(e, "credential key is already in use"))?;
        Ok(credential)
    }

    async fn credential(&self, key: &str) -> Result<Option<Credential>, StorageError> {
        require_non_empty("credential key", key)?;
        let row = sqlx::query("SELECT * FROM credentials WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error(e, "credential"))?;
        row.as_ref().map(credential_from_row).transpose()
    }

    async fn update_credential(
        &self,
        id: Uuid,
        patch: CredentialPatch,
    ) -> Result<(), StorageError> {
        let mut credential = self.fetch_credential(id).await?;
        patch.apply(&mut credential);
        sqlx::query("UPDATE credentials SET owner_label = ?, capabilities = ? WHERE id = ?")
            .bind(&credential.owner_label)
            .bind(capabilities_json(&credential.capabilities)?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| query_error(e, "credential"))?;
        Ok(())
    }

    async fn delete_credential(&self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| query_error(e, "credential"))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("credential {id}")));
        }
        Ok(())
    }

    async fn credentials(&self) -> Result<Vec<Credential>, StorageError> {
        let rows = sqlx::query("SELECT * FROM credentials ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error(e, "credentials"))?;
        rows.iter().map(credential_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteStore {
        let store = SqliteStore::connect_with_config(SqliteConfig::memory())
            .await
            .unwrap();
        store.initialize().await.unwrap();
        store
    }

    fn endpoint_input(path: &str) -> NewEndpoint {
        NewEndpoint {
            path: path.to_string(),
            method: HttpMethod::Post,
            model: "gpt-4".to_string(),
            prompt_template: "Translate: {input}".to_string(),
            strategy: Some("chain".to_string()),
        }
    }

    #[tokio::test]
    async fn initialize_applies_all_migrations_once() {
        let store = memory_store().await;
        assert_eq!(
            store.schema_version().await.unwrap(),
            SchemaVersion::new(0, 4, 0)
        );

        // A second initialize is a no-op against the tracker.
        store.initialize().await.unwrap();
        let row = sqlx::query("SELECT COUNT(*) AS count FROM schema_versions")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let count: i64 = row.try_get("count").unwrap();
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn configuration_upsert_keeps_one_row_per_key() {
        let store = memory_store().await;
        store.set_configuration("llm_type", "v1").await.unwrap();
        store.set_configuration("llm_type", "v2").await.unwrap();

        assert_eq!(
            store.get_configuration("llm_type").await.unwrap(),
            Some("v2".to_string())
        );
        assert_eq!(store.all_configurations().await.unwrap().len(), 1);
        assert_eq!(store.get_configuration("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn endpoint_round_trip_and_path_conflict() {
        let store = memory_store().await;
        store.add_endpoint(endpoint_input("/translate")).await.unwrap();

        let found = store.endpoint_by_path("/translate").await.unwrap().unwrap();
        assert_eq!(found.method, HttpMethod::Post);
        assert_eq!(found.strategy.as_deref(), Some("chain"));

        let err = store
            .add_endpoint(endpoint_input("/translate"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        store
            .update_endpoint(
                found.id,
                EndpointPatch {
                    model: Some("gpt-4-turbo".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let updated = store.endpoint_by_path("/translate").await.unwrap().unwrap();
        assert_eq!(updated.model, "gpt-4-turbo");

        store.delete_endpoint(found.id).await.unwrap();
        let err = store.delete_endpoint(found.id).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn logs_paginate_newest_first() {
        let store = memory_store().await;
        for prompt in ["L1", "L2", "L3"] {
            store
                .add_log(NewLogRecord {
                    prompt: prompt.to_string(),
                    response: "ok".to_string(),
                    model: if prompt == "L2" { "small" } else { "gpt-4" }.to_string(),
                })
                .await
                .unwrap();
        }

        let page = store.logs(Some(2), Some(0)).await.unwrap();
        let prompts: Vec<&str> = page.iter().map(|l| l.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["L3", "L2"]);

        let by_model = store.logs_by_model("gpt-4", None, None).await.unwrap();
        let prompts: Vec<&str> = by_model.iter().map(|l| l.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["L3", "L1"]);

        assert_eq!(store.log_count().await.unwrap(), 3);
        assert_eq!(store.log_count_by_model("small").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn credential_round_trip_by_generated_key() {
        let store = memory_store().await;
        let issued = store.add_credential(NewCredential::default()).await.unwrap();
        assert!(issued.key.starts_with("rk_"));

        let found = store.credential(&issued.key).await.unwrap().unwrap();
        assert_eq!(found.id, issued.id);
        assert_eq!(store.credential("rk_unknown").await.unwrap(), None);

        let err = store
            .add_credential(NewCredential {
                key: Some(issued.key.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn table_definitions_describe_the_schema() {
        let store = memory_store().await;
        let definition = store.table_definition("endpoints").await.unwrap();
        let path = definition
            .columns
            .iter()
            .find(|c| c.name == "path")
            .unwrap();
        assert!(!path.nullable);

        let all = store.all_table_definitions().await.unwrap();
        let names: Vec<&str> = all.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"configurations"));
        assert!(names.contains(&"schema_versions"));

        let err = store.table_definition("bad; drop").await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
    }
}
