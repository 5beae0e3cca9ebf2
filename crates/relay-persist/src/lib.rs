//! # Relay Persistence
//!
//! Storage backends and schema migrations for the Relay proxy.
//!
//! Supports:
//! - File-backed JSON (development/testing; bounded durability window)
//! - SQLite (single-node)
//! - Supabase (hosted)
//!
//! All three implement the same [`StorageBackend`] contract; the application
//! picks one via [`config::open`] at startup and never depends on a specific
//! engine.

pub mod backend;
pub mod config;
pub mod file;
pub mod migrate;
pub mod sqlite;
pub mod supabase;
pub mod transfer;

pub use backend::{StorageBackend, StorageError};
pub use config::{open, BackendKind, StorageConfig};
pub use file::FileStore;
pub use migrate::{
    apply_one, apply_pending, default_migrations, rollback_last, Entity, Migration,
    MigrationBackend, SchemaChange,
};
pub use sqlite::{SqliteConfig, SqliteStore};
pub use supabase::SupabaseStore;
pub use transfer::transfer_all;
