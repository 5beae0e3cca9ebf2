//! File-backed storage adapter
//!
//! The reference backend for development and testing: one in-memory
//! collection per entity, mirrored to one JSON-array file per entity under a
//! data directory. Writes mutate memory, mark the store dirty, and return
//! without waiting for durability; a background task flushes dirty state on
//! a fixed interval.
//!
//! Durability is therefore bounded: on an abrupt process stop, up to one
//! flush interval of writes is lost. Use the SQLite or Supabase adapter
//! where that window is unacceptable.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use relay_core::{
    AppliedVersion, Configuration, Credential, CredentialPatch, EndpointDefinition, EndpointPatch,
    LogRecord, NewCredential, NewEndpoint, NewLogRecord, SchemaVersion,
};

use crate::backend::{require_non_empty, validate_endpoint, StorageBackend, StorageError};
use crate::migrate::{self, Entity, MigrationBackend, SchemaChange};

/// Default interval between dirty-state flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

const TRACKER_FILE: &str = "schema_versions";

fn io_error(e: std::io::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

#[derive(Debug, Clone, Default)]
struct Tables {
    configurations: Vec<Configuration>,
    endpoints: Vec<EndpointDefinition>,
    logs: Vec<LogRecord>,
    credentials: Vec<Credential>,
    schema_versions: Vec<AppliedVersion>,
}

#[derive(Debug)]
struct FileInner {
    dir: PathBuf,
    tables: RwLock<Tables>,
    dirty: AtomicBool,
}

impl FileInner {
    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Create `name`.json with an empty collection if it is missing.
    async fn ensure_file(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path_for(name);
        if tokio::fs::try_exists(&path).await.map_err(io_error)? {
            return Ok(());
        }
        tokio::fs::write(&path, "[]").await.map_err(io_error)
    }

    async fn load_collection<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Vec<T>, StorageError> {
        let bytes = tokio::fs::read(self.path_for(name)).await.map_err(io_error)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Serialization(format!("{name}.json: {e}")))
    }

    async fn load(&self) -> Result<(), StorageError> {
        let tables = Tables {
            configurations: self.load_collection(Entity::Configurations.collection()).await?,
            endpoints: self.load_collection(Entity::Endpoints.collection()).await?,
            logs: self.load_collection(Entity::Logs.collection()).await?,
            credentials: self.load_collection(Entity::Credentials.collection()).await?,
            schema_versions: self.load_collection(TRACKER_FILE).await?,
        };
        *self.tables.write().await = tables;
        Ok(())
    }

    async fn write_collection<T: Serialize>(
        &self,
        name: &str,
        rows: &[T],
    ) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(rows)
            .map_err(|e| StorageError::Serialization(format!("{name}: {e}")))?;
        tokio::fs::write(self.path_for(name), json)
            .await
            .map_err(io_error)
    }

    /// Serialize every collection to its file.
    ///
    /// The snapshot is taken under a brief read lock; the file writes happen
    /// without it, so a flush never blocks foreground writes for longer than
    /// the copy.
    async fn flush(&self) -> Result<(), StorageError> {
        let snapshot = self.tables.read().await.clone();
        self.write_collection(Entity::Configurations.collection(), &snapshot.configurations)
            .await?;
        self.write_collection(Entity::Endpoints.collection(), &snapshot.endpoints)
            .await?;
        self.write_collection(Entity::Logs.collection(), &snapshot.logs)
            .await?;
        self.write_collection(Entity::Credentials.collection(), &snapshot.credentials)
            .await?;
        self.write_collection(TRACKER_FILE, &snapshot.schema_versions)
            .await
    }
}

async fn run_flush_loop(
    inner: Arc<FileInner>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if inner.dirty.swap(false, Ordering::SeqCst) {
                    if let Err(error) = inner.flush().await {
                        // Keep the state dirty so the next tick retries.
                        inner.mark_dirty();
                        warn!(%error, "periodic flush failed");
                    }
                }
            }
            _ = stop.changed() => break,
        }
    }
}

#[derive(Debug)]
struct FlushHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// File-backed adapter. See the module docs for the durability window.
///
/// Concurrent same-key writes are last-write-wins: the in-memory slot is
/// simply overwritten, there is no per-key lock.
#[derive(Debug)]
pub struct FileStore {
    inner: Arc<FileInner>,
    flush_interval: Duration,
    flush_task: Mutex<Option<FlushHandle>>,
}

impl FileStore {
    /// Store rooted at `dir` with the default flush interval.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_flush_interval(dir, DEFAULT_FLUSH_INTERVAL)
    }

    pub fn with_flush_interval(dir: impl Into<PathBuf>, flush_interval: Duration) -> Self {
        Self {
            inner: Arc::new(FileInner {
                dir: dir.into(),
                tables: RwLock::new(Tables::default()),
                dirty: AtomicBool::new(false),
            }),
            flush_interval,
            flush_task: Mutex::new(None),
        }
    }

    async fn start_flush_task(&self) {
        let mut guard = self.flush_task.lock().await;
        if guard.is_some() {
            // Already running; initialize was called again.
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_flush_loop(
            self.inner.clone(),
            self.flush_interval,
            stop_rx,
        ));
        *guard = Some(FlushHandle { stop, task });
        info!(
            interval_ms = self.flush_interval.as_millis() as u64,
            "file store flush task started"
        );
    }
}

#[async_trait]
impl MigrationBackend for FileStore {
    async fn ensure_version_tracker(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.inner.dir)
            .await
            .map_err(io_error)?;
        self.inner.ensure_file(TRACKER_FILE).await
    }

    async fn schema_version(&self) -> Result<SchemaVersion, StorageError> {
        Ok(self
            .inner
            .tables
            .read()
            .await
            .schema_versions
            .last()
            .map(|row| row.version)
            .unwrap_or(SchemaVersion::ZERO))
    }

    async fn set_schema_version(&self, version: SchemaVersion) -> Result<(), StorageError> {
        self.inner
            .tables
            .write()
            .await
            .schema_versions
            .push(AppliedVersion::now(version));
        self.inner.mark_dirty();
        Ok(())
    }

    async fn remove_schema_version(&self, version: SchemaVersion) -> Result<(), StorageError> {
        self.inner
            .tables
            .write()
            .await
            .schema_versions
            .retain(|row| row.version != version);
        self.inner.mark_dirty();
        Ok(())
    }

    async fn apply_change(&self, change: &SchemaChange) -> Result<(), StorageError> {
        match change {
            SchemaChange::CreateStore(entity) => self.inner.ensure_file(entity.collection()).await,
            SchemaChange::DropStore(entity) => {
                {
                    let mut tables = self.inner.tables.write().await;
                    match entity {
                        Entity::Configurations => tables.configurations.clear(),
                        Entity::Endpoints => tables.endpoints.clear(),
                        Entity::Logs => tables.logs.clear(),
                        Entity::Credentials => tables.credentials.clear(),
                    }
                }
                match tokio::fs::remove_file(self.inner.path_for(entity.collection())).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(io_error(e)),
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.ensure_version_tracker().await?;
        // Missing entity files are self-healing: recreated empty.
        for entity in Entity::ALL {
            self.inner.ensure_file(entity.collection()).await?;
        }
        // A repeated initialize must not clobber writes still waiting on the
        // periodic flush; persist them before reloading from disk.
        if self.inner.dirty.swap(false, Ordering::SeqCst) {
            self.inner.flush().await?;
        }
        self.inner.load().await?;

        migrate::apply_pending(self, &migrate::default_migrations()).await?;

        // Persist the tracker before the periodic task takes over, so a
        // crash right after boot cannot lose the applied versions.
        if self.inner.dirty.swap(false, Ordering::SeqCst) {
            self.inner.flush().await?;
        }
        self.start_flush_task().await;
        info!(dir = %self.inner.dir.display(), "file store initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StorageError> {
        if let Some(handle) = self.flush_task.lock().await.take() {
            let _ = handle.stop.send(true);
            if let Err(error) = handle.task.await {
                warn!(%error, "flush task did not stop cleanly");
            }
        }
        if self.inner.dirty.swap(false, Ordering::SeqCst) {
            self.inner.flush().await?;
        }
        info!("file store stopped");
        Ok(())
    }

    async fn get_configuration(&self, key: &str) -> Result<Option<String>, StorageError> {
        require_non_empty("configuration key", key)?;
        let tables = self.inner.tables.read().await;
        Ok(tables
            .configurations
            .iter()
            .find(|row| row.key == key)
            .map(|row| row.value.clone()))
    }

    async fn set_configuration(&self, key: &str, value: &str) -> Result<(), StorageError> {
        require_non_empty("configuration key", key)?;
        {
            let mut tables = self.inner.tables.write().await;
            if let Some(row) = tables.configurations.iter_mut().find(|row| row.key == key) {
                row.value = value.to_string();
                row.updated_at = chrono::Utc::now();
            } else {
                tables.configurations.push(Configuration::new(key, value));
            }
        }
        self.inner.mark_dirty();
        Ok(())
    }

    async fn all_configurations(&self) -> Result<Vec<Configuration>, StorageError> {
        Ok(self.inner.tables.read().await.configurations.clone())
    }

    async fn add_endpoint(&self, input: NewEndpoint) -> Result<(), StorageError> {
        validate_endpoint(&input)?;
        {
            let mut tables = self.inner.tables.write().await;
            if tables.endpoints.iter().any(|e| e.path == input.path) {
                return Err(StorageError::Conflict(format!(
                    "endpoint path {:?} is already registered",
                    input.path
                )));
            }
            tables.endpoints.push(EndpointDefinition::new(input));
        }
        self.inner.mark_dirty();
        Ok(())
    }

    async fn endpoints(&self) -> Result<Vec<EndpointDefinition>, StorageError> {
        Ok(self.inner.tables.read().await.endpoints.clone())
    }

    async fn endpoint_by_path(
        &self,
        path: &str,
    ) -> Result<Option<EndpointDefinition>, StorageError> {
        let tables = self.inner.tables.read().await;
        Ok(tables.endpoints.iter().find(|e| e.path == path).cloned())
    }

    async fn update_endpoint(&self, id: Uuid, patch: EndpointPatch) -> Result<(), StorageError> {
        {
            let mut tables = self.inner.tables.write().await;
            if let Some(new_path) = &patch.path {
                if tables
                    .endpoints
                    .iter()
                    .any(|e| e.id != id && e.path == *new_path)
                {
                    return Err(StorageError::Conflict(format!(
                        "endpoint path {new_path:?} is already registered"
                    )));
                }
            }
            let endpoint = tables
                .endpoints
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| StorageError::NotFound(format!("endpoint {id}")))?;
            patch.apply(endpoint);
        }
        self.inner.mark_dirty();
        Ok(())
    }

    async fn delete_endpoint(&self, id: Uuid) -> Result<(), StorageError> {
        {
            let mut tables = self.inner.tables.write().await;
            let before = tables.endpoints.len();
            tables.endpoints.retain(|e| e.id != id);
            if tables.endpoints.len() == before {
                return Err(StorageError::NotFound(format!("endpoint {id}")));
            }
        }
        self.inner.mark_dirty();
        Ok(())
    }

    async fn add_log(&self, entry: NewLogRecord) -> Result<(), StorageError> {
        self.inner
            .tables
            .write()
            .await
            .logs
            .push(LogRecord::new(entry));
        self.inner.mark_dirty();
        Ok(())
    }

    async fn logs(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<LogRecord>, StorageError> {
        let tables = self.inner.tables.read().await;
        // Entries are kept in insertion order, so newest-first is a reverse
        // walk; no timestamp tie-breaking needed.
        let newest_first = tables
            .logs
            .iter()
            .rev()
            .skip(offset.unwrap_or(0) as usize);
        Ok(match limit {
            Some(limit) => newest_first.take(limit as usize).cloned().collect(),
            None => newest_first.cloned().collect(),
        })
    }

    async fn logs_by_model(
        &self,
        model: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<LogRecord>, StorageError> {
        let tables = self.inner.tables.read().await;
        let newest_first = tables
            .logs
            .iter()
            .rev()
            .filter(|log| log.model == model)
            .skip(offset.unwrap_or(0) as usize);
        Ok(match limit {
            Some(limit) => newest_first.take(limit as usize).cloned().collect(),
            None => newest_first.cloned().collect(),
        })
    }

    async fn log_count(&self) -> Result<u64, StorageError> {
        Ok(self.inner.tables.read().await.logs.len() as u64)
    }

    async fn log_count_by_model(&self, model: &str) -> Result<u64, StorageError> {
        let tables = self.inner.tables.read().await;
        Ok(tables.logs.iter().filter(|log| log.model == model).count() as u64)
    }

    async fn add_credential(&self, input: NewCredential) -> Result<Credential, StorageError> {
        let credential = Credential::new(input);
        {
            let mut tables = self.inner.tables.write().await;
            if tables.credentials.iter().any(|c| c.key == credential.key) {
                return Err(StorageError::Conflict(
                    "credential key is already in use".to_string(),
                ));
            }
            tables.credentials.push(credential.clone());
        }
        self.inner.mark_dirty();
        Ok(credential)
    }

    async fn credential(&self, key: &str) -> Result<Option<Credential>, StorageError> {
        require_non_empty("credential key", key)?;
        let tables = self.inner.tables.read().await;
        Ok(tables.credentials.iter().find(|c| c.key == key).cloned())
    }

    async fn update_credential(
        &self,
        id: Uuid,
        patch: CredentialPatch,
    ) -> Result<(), StorageError> {
        {
            let mut tables = self.inner.tables.write().await;
            let credential = tables
                .credentials
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| StorageError::NotFound(format!("credential {id}")))?;
            patch.apply(credential);
        }
        self.inner.mark_dirty();
        Ok(())
    }

    async fn delete_credential(&self, id: Uuid) -> Result<(), StorageError> {
        {
            let mut tables = self.inner.tables.write().await;
            let before = tables.credentials.len();
            tables.credentials.retain(|c| c.id != id);
            if tables.credentials.len() == before {
                return Err(StorageError::NotFound(format!("credential {id}")));
            }
        }
        self.inner.mark_dirty();
        Ok(())
    }

    async fn credentials(&self) -> Result<Vec<Credential>, StorageError> {
        Ok(self.inner.tables.read().await.credentials.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::HttpMethod;

    fn endpoint_input(path: &str) -> NewEndpoint {
        NewEndpoint {
            path: path.to_string(),
            method: HttpMethod::Post,
            model: "gpt-4".to_string(),
            prompt_template: "Translate: {input}".to_string(),
            strategy: None,
        }
    }

    #[tokio::test]
    async fn initialize_creates_files_and_applies_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.initialize().await.unwrap();

        for name in ["configurations", "endpoints", "logs", "credentials", "schema_versions"] {
            assert!(dir.path().join(format!("{name}.json")).exists(), "{name}");
        }
        assert_eq!(
            store.schema_version().await.unwrap(),
            SchemaVersion::new(0, 4, 0)
        );
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn initialize_twice_does_no_redundant_migration_work() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.initialize().await.unwrap();
        store.initialize().await.unwrap();
        store.shutdown().await.unwrap();

        let bytes = std::fs::read(dir.path().join("schema_versions.json")).unwrap();
        let tracked: Vec<AppliedVersion> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(tracked.len(), 4);
    }

    #[tokio::test]
    async fn configuration_writes_are_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.initialize().await.unwrap();

        store.set_configuration("llm_type", "v1").await.unwrap();
        store.set_configuration("llm_type", "v2").await.unwrap();

        assert_eq!(
            store.get_configuration("llm_type").await.unwrap(),
            Some("v2".to_string())
        );
        assert_eq!(store.all_configurations().await.unwrap().len(), 1);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn empty_configuration_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.initialize().await.unwrap();

        let err = store.set_configuration("", "x").await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
        let err = store.get_configuration("  ").await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn logs_paginate_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.initialize().await.unwrap();

        for prompt in ["L1", "L2", "L3"] {
            store
                .add_log(NewLogRecord {
                    prompt: prompt.to_string(),
                    response: "ok".to_string(),
                    model: "gpt-4".to_string(),
                })
                .await
                .unwrap();
        }

        let page = store.logs(Some(2), Some(0)).await.unwrap();
        let prompts: Vec<&str> = page.iter().map(|l| l.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["L3", "L2"]);

        let rest = store.logs(Some(2), Some(2)).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].prompt, "L1");

        assert_eq!(store.log_count().await.unwrap(), 3);
        assert_eq!(store.log_count_by_model("gpt-4").await.unwrap(), 3);
        assert_eq!(store.log_count_by_model("other").await.unwrap(), 0);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_endpoint_path_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.initialize().await.unwrap();

        store.add_endpoint(endpoint_input("/translate")).await.unwrap();
        let err = store
            .add_endpoint(endpoint_input("/translate"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        let found = store.endpoint_by_path("/translate").await.unwrap().unwrap();
        assert_eq!(found.path, "/translate");
        assert_eq!(found.method, HttpMethod::Post);
        assert_eq!(found.model, "gpt-4");
        assert_eq!(found.prompt_template, "Translate: {input}");
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn updating_a_missing_endpoint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.initialize().await.unwrap();

        let err = store
            .update_endpoint(Uuid::new_v4(), EndpointPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        let err = store.delete_endpoint(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn issued_credential_round_trips_by_generated_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.initialize().await.unwrap();

        let issued = store.add_credential(NewCredential::default()).await.unwrap();
        assert!(issued.key.starts_with("rk_"));

        let found = store.credential(&issued.key).await.unwrap();
        assert_eq!(found, Some(issued.clone()));

        assert_eq!(store.credential("rk_not_a_real_token").await.unwrap(), None);

        let err = store
            .add_credential(NewCredential {
                key: Some(issued.key.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_and_a_reopened_store_sees_the_data() {
        let dir = tempfile::tempdir().unwrap();

        let store = FileStore::new(dir.path());
        store.initialize().await.unwrap();
        store.set_configuration("llm_model", "gpt-4").await.unwrap();
        store.add_endpoint(endpoint_input("/summarize")).await.unwrap();
        store.shutdown().await.unwrap();

        let reopened = FileStore::new(dir.path());
        reopened.initialize().await.unwrap();
        assert_eq!(
            reopened.get_configuration("llm_model").await.unwrap(),
            Some("gpt-4".to_string())
        );
        assert!(reopened
            .endpoint_by_path("/summarize")
            .await
            .unwrap()
            .is_some());
        reopened.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn periodic_flush_persists_without_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::with_flush_interval(dir.path(), Duration::from_millis(25));
        store.initialize().await.unwrap();

        store.set_configuration("llm_type", "openai").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let bytes = std::fs::read(dir.path().join("configurations.json")).unwrap();
        let rows: Vec<Configuration> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, "openai");
        store.shutdown().await.unwrap();
    }
}
