//! Storage contract and error taxonomy
//!
//! [`StorageBackend`] is the capability interface the Relay application
//! consumes. One adapter is selected at startup (see [`crate::config`]) and
//! [`StorageBackend::initialize`] runs exactly once before any other call;
//! after that every operation is safe to call concurrently.

use std::fmt::Debug;

use async_trait::async_trait;
use uuid::Uuid;

use relay_core::{
    Configuration, Credential, CredentialPatch, EndpointDefinition, EndpointPatch, LogRecord,
    NewCredential, NewEndpoint, NewLogRecord, SchemaVersion,
};

use crate::migrate::MigrationBackend;

/// Storage error taxonomy.
///
/// Adapters translate native failures into these variants before returning.
/// "Zero rows" is never folded into an error, and an error is never folded
/// into an empty result.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Malformed input: missing required field, empty key, bad version text.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Unique-constraint violation, e.g. a duplicate endpoint path or
    /// credential key. Duplicate configuration keys are upserts, not errors.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation targeted an id that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The underlying engine could not be reached or failed internally.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A migration's up/down action failed. Fatal during initialize; the
    /// engine does not retry or compensate.
    #[error("migration {version} failed: {reason}")]
    Migration {
        version: SchemaVersion,
        reason: String,
    },

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub(crate) fn require_non_empty(what: &str, value: &str) -> Result<(), StorageError> {
    if value.trim().is_empty() {
        return Err(StorageError::Invalid(format!("{what} must be non-empty")));
    }
    Ok(())
}

pub(crate) fn validate_endpoint(input: &NewEndpoint) -> Result<(), StorageError> {
    require_non_empty("endpoint path", &input.path)?;
    require_non_empty("endpoint model", &input.model)?;
    require_non_empty("endpoint prompt template", &input.prompt_template)
}

/// The storage contract: every backend adapter implements this surface with
/// identical semantics, so the application never depends on a specific
/// engine.
#[async_trait]
pub trait StorageBackend: MigrationBackend + Debug {
    /// Adapter name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Ensure the version tracker exists, apply all pending migrations, and
    /// perform adapter-specific setup. Must complete before any other call.
    ///
    /// Idempotent: a repeated call re-reads the tracker and performs no
    /// redundant migration work. Pending work is computed from the tracker,
    /// never from process memory.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Stop background work and flush any buffered state. A no-op for
    /// adapters without background tasks.
    async fn shutdown(&self) -> Result<(), StorageError>;

    // --- configuration ---

    /// Value for `key`, or `None` when the key was never set.
    async fn get_configuration(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Upsert `value` under `key`. Writing an existing key updates it in
    /// place; there is never more than one row per key.
    async fn set_configuration(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Every configuration row.
    async fn all_configurations(&self) -> Result<Vec<Configuration>, StorageError>;

    // --- endpoint registry ---

    /// Register an endpoint. A duplicate path is rejected with
    /// [`StorageError::Conflict`].
    async fn add_endpoint(&self, input: NewEndpoint) -> Result<(), StorageError>;

    async fn endpoints(&self) -> Result<Vec<EndpointDefinition>, StorageError>;

    async fn endpoint_by_path(
        &self,
        path: &str,
    ) -> Result<Option<EndpointDefinition>, StorageError>;

    async fn update_endpoint(&self, id: Uuid, patch: EndpointPatch) -> Result<(), StorageError>;

    async fn delete_endpoint(&self, id: Uuid) -> Result<(), StorageError>;

    // --- request log ---

    /// Append one log entry. Entries are immutable once written.
    async fn add_log(&self, entry: NewLogRecord) -> Result<(), StorageError>;

    /// Log entries ordered newest first.
    async fn logs(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<LogRecord>, StorageError>;

    /// Log entries for one model, ordered newest first.
    async fn logs_by_model(
        &self,
        model: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<LogRecord>, StorageError>;

    async fn log_count(&self) -> Result<u64, StorageError>;

    async fn log_count_by_model(&self, model: &str) -> Result<u64, StorageError>;

    // --- credentials ---

    /// Issue a credential. Returns the full created record including the
    /// generated key; a duplicate key is rejected with
    /// [`StorageError::Conflict`].
    async fn add_credential(&self, input: NewCredential) -> Result<Credential, StorageError>;

    /// Look up a credential by its token. `None` means "no such token" —
    /// the authorization middleware treats that as a rejection.
    async fn credential(&self, key: &str) -> Result<Option<Credential>, StorageError>;

    async fn update_credential(
        &self,
        id: Uuid,
        patch: CredentialPatch,
    ) -> Result<(), StorageError>;

    async fn delete_credential(&self, id: Uuid) -> Result<(), StorageError>;

    async fn credentials(&self) -> Result<Vec<Credential>, StorageError>;
}
