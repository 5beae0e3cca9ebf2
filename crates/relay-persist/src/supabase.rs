//! Supabase storage adapter
//!
//! Talks to the hosted PostgREST surface. Equality, ordering, and pagination
//! are expressed as query parameters; upserts use `on_conflict` with
//! `Prefer: resolution=merge-duplicates`; exact counts come from the
//! `Content-Range` header. Every response status is checked and translated
//! into the contract taxonomy — the hosted backend's native error shape
//! never leaks to callers.
//!
//! Schema changes run through two SQL RPCs that must be provisioned on the
//! project: `create_schema_versions_if_not_exists` and `apply_migration`.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use relay_core::{
    Configuration, Credential, CredentialPatch, EndpointDefinition, EndpointPatch, LogRecord,
    NewCredential, NewEndpoint, NewLogRecord, SchemaVersion,
};

use crate::backend::{require_non_empty, validate_endpoint, StorageBackend, StorageError};
use crate::migrate::{self, Entity, MigrationBackend, SchemaChange};

fn transport_error(e: reqwest::Error, context: &str) -> StorageError {
    StorageError::Unavailable(format!("{context}: {e}"))
}

fn decode_error(e: reqwest::Error, context: &str) -> StorageError {
    StorageError::Serialization(format!("{context}: {e}"))
}

/// Total from a `Content-Range` header such as `0-24/57` or `*/0`.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.parse().ok()
}

fn postgres_sql(change: &SchemaChange) -> &'static str {
    match change {
        SchemaChange::CreateStore(Entity::Configurations) => {
            "CREATE TABLE IF NOT EXISTS configurations (
                config_key TEXT PRIMARY KEY,
                config_value TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        }
        SchemaChange::CreateStore(Entity::Endpoints) => {
            "CREATE TABLE IF NOT EXISTS endpoints (
                id UUID PRIMARY KEY,
                path TEXT NOT NULL UNIQUE,
                method TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_template TEXT NOT NULL,
                strategy TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        }
        SchemaChange::CreateStore(Entity::Logs) => {
            "CREATE TABLE IF NOT EXISTS logs (
                id UUID PRIMARY KEY,
                prompt TEXT NOT NULL,
                response TEXT NOT NULL,
                model TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        }
        SchemaChange::CreateStore(Entity::Credentials) => {
            "CREATE TABLE IF NOT EXISTS credentials (
                id UUID PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                owner_label TEXT,
                capabilities JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        }
        SchemaChange::DropStore(Entity::Configurations) => "DROP TABLE IF EXISTS configurations",
        SchemaChange::DropStore(Entity::Endpoints) => "DROP TABLE IF EXISTS endpoints",
        SchemaChange::DropStore(Entity::Logs) => "DROP TABLE IF EXISTS logs",
        SchemaChange::DropStore(Entity::Credentials) => "DROP TABLE IF EXISTS credentials",
    }
}

/// Supabase storage adapter
#[derive(Debug)]
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SupabaseStore {
    pub fn new(url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{function}", self.base_url)
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    /// Check a response status, translating failures into the taxonomy.
    async fn check(&self, response: Response, context: &str) -> Result<Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::CONFLICT => StorageError::Conflict(format!("{context}: {body}")),
            StatusCode::NOT_FOUND => StorageError::NotFound(context.to_string()),
            _ => StorageError::Unavailable(format!("{context}: status {status}: {body}")),
        })
    }

    async fn call_rpc(
        &self,
        function: &str,
        body: serde_json::Value,
        context: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .request(Method::POST, self.rpc_url(function))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, context))?;
        self.check(response, context).await?;
        Ok(())
    }

    async fn fetch_rows<T: for<'de> Deserialize<'de>>(
        &self,
        table: &str,
        query: &[(&str, String)],
        context: &str,
    ) -> Result<Vec<T>, StorageError> {
        let response = self
            .request(Method::GET, self.table_url(table))
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error(e, context))?;
        self.check(response, context)
            .await?
            .json()
            .await
            .map_err(|e| decode_error(e, context))
    }

    /// Exact row count for a filter, via `Prefer: count=exact` on a HEAD
    /// request and the `Content-Range` response header.
    async fn count_rows(
        &self,
        table: &str,
        query: &[(&str, String)],
        context: &str,
    ) -> Result<u64, StorageError> {
        let response = self
            .request(Method::HEAD, self.table_url(table))
            .query(query)
            .header("Prefer", "count=exact")
            .send()
            .await
            .map_err(|e| transport_error(e, context))?;
        let response = self.check(response, context).await?;
        response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(content_range_total)
            .ok_or_else(|| {
                StorageError::Unavailable(format!("{context}: missing exact count"))
            })
    }

    /// PATCH rows matching `filter`; `NotFound` when nothing matched.
    async fn patch_rows<T: serde::Serialize>(
        &self,
        table: &str,
        filter: (&str, String),
        body: &T,
        context: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .request(Method::PATCH, self.table_url(table))
            .query(&[filter])
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(e, context))?;
        let rows: Vec<serde_json::Value> = self
            .check(response, context)
            .await?
            .json()
            .await
            .map_err(|e| decode_error(e, context))?;
        if rows.is_empty() {
            return Err(StorageError::NotFound(context.to_string()));
        }
        Ok(())
    }

    async fn delete_rows(
        &self,
        table: &str,
        filter: (&str, String),
        context: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .request(Method::DELETE, self.table_url(table))
            .query(&[filter])
            .header("Prefer", "return=representation")
            .send()
            .await
            .map_err(|e| transport_error(e, context))?;
        let rows: Vec<serde_json::Value> = self
            .check(response, context)
            .await?
            .json()
            .await
            .map_err(|e| decode_error(e, context))?;
        if rows.is_empty() {
            return Err(StorageError::NotFound(context.to_string()));
        }
        Ok(())
    }

    /// `NotFound` unless a row with this id exists. Used for empty patches,
    /// which PostgREST would otherwise reject.
    async fn require_row(&self, table: &str, id: Uuid, context: &str) -> Result<(), StorageError> {
        let rows: Vec<serde_json::Value> = self
            .fetch_rows(
                table,
                &[("select", "id".to_string()), ("id", format!("eq.{id}"))],
                context,
            )
            .await?;
        if rows.is_empty() {
            return Err(StorageError::NotFound(context.to_string()));
        }
        Ok(())
    }

    fn page_query(
        base: Vec<(&'static str, String)>,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Vec<(&'static str, String)> {
        let mut query = base;
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }
        query
    }
}

#[async_trait]
impl MigrationBackend for SupabaseStore {
    async fn ensure_version_tracker(&self) -> Result<(), StorageError> {
        self.call_rpc(
            "create_schema_versions_if_not_exists",
            json!({}),
            "schema version tracker",
        )
        .await
    }

    async fn schema_version(&self) -> Result<SchemaVersion, StorageError> {
        #[derive(Deserialize)]
        struct VersionRow {
            version: SchemaVersion,
        }

        let rows: Vec<VersionRow> = self
            .fetch_rows(
                "schema_versions",
                &[
                    ("select", "version".to_string()),
                    ("order", "applied_at.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
                "schema version",
            )
            .await?;
        Ok(rows
            .first()
            .map(|row| row.version)
            .unwrap_or(SchemaVersion::ZERO))
    }

    async fn set_schema_version(&self, version: SchemaVersion) -> Result<(), StorageError> {
        let response = self
            .request(Method::POST, self.table_url("schema_versions"))
            .json(&json!({ "version": version.to_string() }))
            .send()
            .await
            .map_err(|e| transport_error(e, "schema version"))?;
        self.check(response, "schema version").await?;
        Ok(())
    }

    async fn remove_schema_version(&self, version: SchemaVersion) -> Result<(), StorageError> {
        let response = self
            .request(Method::DELETE, self.table_url("schema_versions"))
            .query(&[("version", format!("eq.{version}"))])
            .send()
            .await
            .map_err(|e| transport_error(e, "schema version"))?;
        self.check(response, "schema version").await?;
        Ok(())
    }

    async fn apply_change(&self, change: &SchemaChange) -> Result<(), StorageError> {
        self.call_rpc(
            "apply_migration",
            json!({ "migration_sql": postgres_sql(change) }),
            "schema change",
        )
        .await
    }
}

#[async_trait]
impl StorageBackend for SupabaseStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.ensure_version_tracker().await?;
        migrate::apply_pending(self, &migrate::default_migrations()).await?;
        info!(url = %self.base_url, "supabase store initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StorageError> {
        // Plain HTTP; nothing to stop.
        Ok(())
    }

    async fn get_configuration(&self, key: &str) -> Result<Option<String>, StorageError> {
        require_non_empty("configuration key", key)?;

        #[derive(Deserialize)]
        struct ValueRow {
            config_value: String,
        }

        let rows: Vec<ValueRow> = self
            .fetch_rows(
                "configurations",
                &[
                    ("select", "config_value".to_string()),
                    ("config_key", format!("eq.{key}")),
                    ("limit", "1".to_string()),
                ],
                "configuration",
            )
            .await?;
        Ok(rows.into_iter().next().map(|row| row.config_value))
    }

    async fn set_configuration(&self, key: &str, value: &str) -> Result<(), StorageError> {
        require_non_empty("configuration key", key)?;
        let response = self
            .request(Method::POST, self.table_url("configurations"))
            .query(&[("on_conflict", "config_key")])
            .header("Prefer", "resolution=merge-duplicates")
            .json(&json!({ "config_key": key, "config_value": value }))
            .send()
            .await
            .map_err(|e| transport_error(e, "configuration"))?;
        self.check(response, "configuration").await?;
        Ok(())
    }

    async fn all_configurations(&self) -> Result<Vec<Configuration>, StorageError> {
        self.fetch_rows(
            "configurations",
            &[("select", "*".to_string())],
            "configurations",
        )
        .await
    }

    async fn add_endpoint(&self, input: NewEndpoint) -> Result<(), StorageError> {
        validate_endpoint(&input)?;
        let endpoint = EndpointDefinition::new(input);
        let response = self
            .request(Method::POST, self.table_url("endpoints"))
            .json(&endpoint)
            .send()
            .await
            .map_err(|e| transport_error(e, "endpoint"))?;
        self.check(
            response,
            &format!("endpoint path {:?} is already registered", endpoint.path),
        )
        .await?;
        Ok(())
    }

    async fn endpoints(&self) -> Result<Vec<EndpointDefinition>, StorageError> {
        self.fetch_rows("endpoints", &[("select", "*".to_string())], "endpoints")
            .await
    }

    async fn endpoint_by_path(
        &self,
        path: &str,
    ) -> Result<Option<EndpointDefinition>, StorageError> {
        let rows: Vec<EndpointDefinition> = self
            .fetch_rows(
                "endpoints",
                &[
                    ("select", "*".to_string()),
                    ("path", format!("eq.{path}")),
                    ("limit", "1".to_string()),
                ],
                "endpoint",
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn update_endpoint(&self, id: Uuid, patch: EndpointPatch) -> Result<(), StorageError> {
        if patch.is_empty() {
            return self.require_row("endpoints", id, "endpoint").await;
        }
        self.patch_rows("endpoints", ("id", format!("eq.{id}")), &patch, "endpoint")
            .await
    }

    async fn delete_endpoint(&self, id: Uuid) -> Result<(), StorageError> {
        self.delete_rows("endpoints", ("id", format!("eq.{id}")), "endpoint")
            .await
    }

    async fn add_log(&self, entry: NewLogRecord) -> Result<(), StorageError> {
        let log = LogRecord::new(entry);
        let response = self
            .request(Method::POST, self.table_url("logs"))
            .json(&log)
            .send()
            .await
            .map_err(|e| transport_error(e, "log"))?;
        self.check(response, "log").await?;
        Ok(())
    }

    async fn logs(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<LogRecord>, StorageError> {
        let query = Self::page_query(
            vec![
                ("select", "*".to_string()),
                ("order", "created_at.desc".to_string()),
            ],
            limit,
            offset,
        );
        self.fetch_rows("logs", &query, "logs").await
    }

    async fn logs_by_model(
        &self,
        model: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<LogRecord>, StorageError> {
        let query = Self::page_query(
            vec![
                ("select", "*".to_string()),
                ("model", format!("eq.{model}")),
                ("order", "created_at.desc".to_string()),
            ],
            limit,
            offset,
        );
        self.fetch_rows("logs", &query, "logs").await
    }

    async fn log_count(&self) -> Result<u64, StorageError> {
        self.count_rows("logs", &[("select", "*".to_string())], "log count")
            .await
    }

    async fn log_count_by_model(&self, model: &str) -> Result<u64, StorageError> {
        self.count_rows(
            "logs",
            &[
                ("select", "*".to_string()),
                ("model", format!("eq.{model}")),
            ],
            "log count",
        )
        .await
    }

    async fn add_credential(&self, input: NewCredential) -> Result<Credential, StorageError> {
        let credential = Credential::new(input);
        let response = self
            .request(Method::POST, self.table_url("credentials"))
            .header("Prefer", "return=representation")
            .json(&credential)
            .send()
            .await
            .map_err(|e| transport_error(e, "credential"))?;
        let mut rows: Vec<Credential> = self
            .check(response, "credential key is already in use")
            .await?
            .json()
            .await
            .map_err(|e| decode_error(e, "credential"))?;
        rows.pop()
            .ok_or_else(|| StorageError::Unavailable("credential insert returned no row".into()))
    }

    async fn credential(&self, key: &str) -> Result<Option<Credential>, StorageError> {
        require_non_empty("credential key", key)?;
        let rows: Vec<Credential> = self
            .fetch_rows(
                "credentials",
                &[
                    ("select", "*".to_string()),
                    ("key", format!("eq.{key}")),
                    ("limit", "1".to_string()),
                ],
                "credential",
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn update_credential(
        &self,
        id: Uuid,
        patch: CredentialPatch,
    ) -> Result<(), StorageError> {
        if patch.is_empty() {
            return self.require_row("credentials", id, "credential").await;
        }
        self.patch_rows(
            "credentials",
            ("id", format!("eq.{id}")),
            &patch,
            "credential",
        )
        .await
    }

    async fn delete_credential(&self, id: Uuid) -> Result<(), StorageError> {
        self.delete_rows("credentials", ("id", format!("eq.{id}")), "credential")
            .await
    }

    async fn credentials(&self) -> Result<Vec<Credential>, StorageError> {
        self.fetch_rows(
            "credentials",
            &[("select", "*".to_string())],
            "credentials",
        )
        .await
    }
}
