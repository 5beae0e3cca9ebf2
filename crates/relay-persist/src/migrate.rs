//! Versioned schema migrations
//!
//! A migration is data: a version, a description, and a pair of declarative
//! [`SchemaChange`] actions that each backend interprets natively — DDL for
//! the relational adapters, file management for the file-backed one.
//!
//! The apply-pending path is not safe to run concurrently from multiple
//! processes against one shared backend: two instances booting at once can
//! both observe a migration as pending and double-apply it. Deployments
//! running replicas against a shared engine must serialize startup
//! externally (single-writer lock or equivalent).

use async_trait::async_trait;
use tracing::info;

use relay_core::SchemaVersion;

use crate::backend::StorageError;

/// The persisted entity collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Configurations,
    Endpoints,
    Logs,
    Credentials,
}

impl Entity {
    pub const ALL: [Entity; 4] = [
        Entity::Configurations,
        Entity::Endpoints,
        Entity::Logs,
        Entity::Credentials,
    ];

    /// Collection name: the table name for relational backends, the file
    /// stem for the file-backed one.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Configurations => "configurations",
            Self::Endpoints => "endpoints",
            Self::Logs => "logs",
            Self::Credentials => "credentials",
        }
    }
}

/// A declarative schema transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChange {
    /// Create the collection holding an entity. A no-op if it exists.
    CreateStore(Entity),
    /// Drop an entity's collection and everything in it.
    DropStore(Entity),
}

/// A versioned, reversible schema change. Immutable; identified uniquely by
/// its version.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: SchemaVersion,
    pub description: &'static str,
    pub up: SchemaChange,
    pub down: SchemaChange,
}

/// The static migration set every backend boots with.
pub fn default_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: SchemaVersion::new(0, 1, 0),
            description: "create configuration store",
            up: SchemaChange::CreateStore(Entity::Configurations),
            down: SchemaChange::DropStore(Entity::Configurations),
        },
        Migration {
            version: SchemaVersion::new(0, 2, 0),
            description: "create endpoint registry",
            up: SchemaChange::CreateStore(Entity::Endpoints),
            down: SchemaChange::DropStore(Entity::Endpoints),
        },
        Migration {
            version: SchemaVersion::new(0, 3, 0),
            description: "create request log",
            up: SchemaChange::CreateStore(Entity::Logs),
            down: SchemaChange::DropStore(Entity::Logs),
        },
        Migration {
            version: SchemaVersion::new(0, 4, 0),
            description: "create credential store",
            up: SchemaChange::CreateStore(Entity::Credentials),
            down: SchemaChange::DropStore(Entity::Credentials),
        },
    ]
}

/// The capabilities the migration engine needs from a backend.
#[async_trait]
pub trait MigrationBackend: Send + Sync {
    /// Ensure the version tracker exists (empty when newly created).
    async fn ensure_version_tracker(&self) -> Result<(), StorageError>;

    /// Latest tracked version, `0.0.0` when the tracker is empty.
    async fn schema_version(&self) -> Result<SchemaVersion, StorageError>;

    /// Append a tracker row. The tracker is append-only: prior rows are
    /// never edited.
    async fn set_schema_version(&self, version: SchemaVersion) -> Result<(), StorageError>;

    /// Remove the tracker row recording `version`. Rollback only.
    async fn remove_schema_version(&self, version: SchemaVersion) -> Result<(), StorageError>;

    /// Execute one schema transform natively.
    async fn apply_change(&self, change: &SchemaChange) -> Result<(), StorageError>;
}

/// Apply a single migration's up action and record its version.
pub async fn apply_one<B>(backend: &B, migration: &Migration) -> Result<(), StorageError>
where
    B: MigrationBackend + ?Sized,
{
    backend
        .apply_change(&migration.up)
        .await
        .map_err(|e| StorageError::Migration {
            version: migration.version,
            reason: e.to_string(),
        })?;
    backend.set_schema_version(migration.version).await?;
    info!(version = %migration.version, description = migration.description, "applied migration");
    Ok(())
}

/// Apply every migration whose version is strictly greater than the tracked
/// one, in ascending version order.
///
/// Stops at the first failure without retrying or compensating; migrations
/// applied before the failure stay applied. A later call recomputes the
/// current version from the tracker and resumes with what is still pending,
/// so an already-applied version is never reapplied.
pub async fn apply_pending<B>(
    backend: &B,
    migrations: &[Migration],
) -> Result<Vec<SchemaVersion>, StorageError>
where
    B: MigrationBackend + ?Sized,
{
    let current = backend.schema_version().await?;
    let mut pending: Vec<&Migration> =
        migrations.iter().filter(|m| m.version > current).collect();
    pending.sort_by_key(|m| m.version);

    let mut applied = Vec::new();
    for migration in pending {
        apply_one(backend, migration).await?;
        applied.push(migration.version);
    }
    Ok(applied)
}

/// Roll back the most recently applied migration, if any, and return the new
/// current version.
///
/// The new version is recomputed as the greatest version in `migrations`
/// strictly below the rolled-back one, falling back to `0.0.0`. That
/// recomputation assumes migrations were applied strictly in ascending
/// order with no gaps; if they were applied out of order the recorded
/// version can drift from the backend's actual structural state.
pub async fn rollback_last<B>(
    backend: &B,
    migrations: &[Migration],
) -> Result<Option<SchemaVersion>, StorageError>
where
    B: MigrationBackend + ?Sized,
{
    let current = backend.schema_version().await?;
    let last = migrations
        .iter()
        .filter(|m| m.version <= current)
        .max_by_key(|m| m.version);
    let Some(last) = last else {
        return Ok(None);
    };

    backend
        .apply_change(&last.down)
        .await
        .map_err(|e| StorageError::Migration {
            version: last.version,
            reason: e.to_string(),
        })?;
    backend.remove_schema_version(last.version).await?;

    let previous = migrations
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < last.version)
        .max()
        .unwrap_or(SchemaVersion::ZERO);
    backend.set_schema_version(previous).await?;

    info!(from = %last.version, to = %previous, "rolled back migration");
    Ok(Some(previous))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records applied changes and tracker rows; optionally fails one change.
    #[derive(Debug, Default)]
    struct RecordingBackend {
        versions: Mutex<Vec<SchemaVersion>>,
        changes: Mutex<Vec<SchemaChange>>,
        fail_on: Mutex<Option<SchemaChange>>,
    }

    impl RecordingBackend {
        fn fail_on(&self, change: SchemaChange) {
            *self.fail_on.lock().unwrap() = Some(change);
        }

        fn clear_failure(&self) {
            *self.fail_on.lock().unwrap() = None;
        }

        fn applied(&self) -> Vec<SchemaChange> {
            self.changes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MigrationBackend for RecordingBackend {
        async fn ensure_version_tracker(&self) -> Result<(), StorageError> {
            Ok(())
        }

        async fn schema_version(&self) -> Result<SchemaVersion, StorageError> {
            Ok(self
                .versions
                .lock()
                .unwrap()
                .last()
                .copied()
                .unwrap_or(SchemaVersion::ZERO))
        }

        async fn set_schema_version(&self, version: SchemaVersion) -> Result<(), StorageError> {
            self.versions.lock().unwrap().push(version);
            Ok(())
        }

        async fn remove_schema_version(
            &self,
            version: SchemaVersion,
        ) -> Result<(), StorageError> {
            self.versions.lock().unwrap().retain(|v| *v != version);
            Ok(())
        }

        async fn apply_change(&self, change: &SchemaChange) -> Result<(), StorageError> {
            if *self.fail_on.lock().unwrap() == Some(*change) {
                return Err(StorageError::Unavailable("induced failure".to_string()));
            }
            self.changes.lock().unwrap().push(*change);
            Ok(())
        }
    }

    #[tokio::test]
    async fn applies_in_ascending_order_even_when_defined_shuffled() {
        let backend = RecordingBackend::default();
        let mut migrations = default_migrations();
        migrations.reverse();

        let applied = apply_pending(&backend, &migrations).await.unwrap();

        let expected: Vec<SchemaVersion> =
            default_migrations().iter().map(|m| m.version).collect();
        assert_eq!(applied, expected);
        assert_eq!(
            backend.applied(),
            vec![
                SchemaChange::CreateStore(Entity::Configurations),
                SchemaChange::CreateStore(Entity::Endpoints),
                SchemaChange::CreateStore(Entity::Logs),
                SchemaChange::CreateStore(Entity::Credentials),
            ]
        );
        assert_eq!(
            backend.schema_version().await.unwrap(),
            SchemaVersion::new(0, 4, 0)
        );
    }

    #[tokio::test]
    async fn second_apply_pending_is_a_noop() {
        let backend = RecordingBackend::default();
        let migrations = default_migrations();

        let first = apply_pending(&backend, &migrations).await.unwrap();
        assert_eq!(first.len(), 4);

        let second = apply_pending(&backend, &migrations).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(backend.applied().len(), 4);
    }

    #[tokio::test]
    async fn failure_stops_the_run_and_a_retry_resumes_from_the_tracker() {
        let backend = RecordingBackend::default();
        let migrations = default_migrations();
        backend.fail_on(SchemaChange::CreateStore(Entity::Logs));

        let err = apply_pending(&backend, &migrations).await.unwrap_err();
        match err {
            StorageError::Migration { version, .. } => {
                assert_eq!(version, SchemaVersion::new(0, 3, 0));
            }
            other => panic!("expected migration error, got {other:?}"),
        }
        // The first two stayed applied.
        assert_eq!(
            backend.schema_version().await.unwrap(),
            SchemaVersion::new(0, 2, 0)
        );

        backend.clear_failure();
        let resumed = apply_pending(&backend, &migrations).await.unwrap();
        assert_eq!(
            resumed,
            vec![SchemaVersion::new(0, 3, 0), SchemaVersion::new(0, 4, 0)]
        );
        // Nothing was reapplied.
        assert_eq!(backend.applied().len(), 4);
    }

    #[tokio::test]
    async fn rollback_then_apply_restores_the_prior_version() {
        let backend = RecordingBackend::default();
        let migrations = default_migrations();
        apply_pending(&backend, &migrations).await.unwrap();

        let new_current = rollback_last(&backend, &migrations).await.unwrap();
        assert_eq!(new_current, Some(SchemaVersion::new(0, 3, 0)));

        let reapplied = apply_pending(&backend, &migrations).await.unwrap();
        assert_eq!(reapplied, vec![SchemaVersion::new(0, 4, 0)]);
        assert_eq!(
            backend.schema_version().await.unwrap(),
            SchemaVersion::new(0, 4, 0)
        );
    }

    #[tokio::test]
    async fn two_step_scenario_tracks_0_2_0_then_0_1_0() {
        let backend = RecordingBackend::default();
        let migrations: Vec<Migration> = default_migrations().into_iter().take(2).collect();

        apply_pending(&backend, &migrations).await.unwrap();
        assert_eq!(
            backend.schema_version().await.unwrap(),
            SchemaVersion::new(0, 2, 0)
        );

        let rolled = rollback_last(&backend, &migrations).await.unwrap();
        assert_eq!(rolled, Some(SchemaVersion::new(0, 1, 0)));
        assert_eq!(
            backend.schema_version().await.unwrap(),
            SchemaVersion::new(0, 1, 0)
        );
    }

    #[tokio::test]
    async fn rollback_on_an_empty_tracker_does_nothing() {
        let backend = RecordingBackend::default();
        let rolled = rollback_last(&backend, &default_migrations()).await.unwrap();
        assert_eq!(rolled, None);
        assert!(backend.applied().is_empty());
    }
}
