//! # Relay Core
//!
//! Domain types for the Relay proxy's persistence layer:
//! - [`SchemaVersion`] — three-part schema version with a strict total order
//! - [`Configuration`] — key/value settings, upserted on key
//! - [`EndpointDefinition`] — dynamically registered proxy endpoints
//! - [`LogRecord`] — append-only request/response log entries
//! - [`Credential`] — opaque access tokens with capability settings

pub mod record;
pub mod version;

pub use record::{
    generate_key, Configuration, Credential, CredentialPatch, EndpointDefinition, EndpointPatch,
    HttpMethod, LogRecord, NewCredential, NewEndpoint, NewLogRecord, ParseMethodError,
};
pub use version::{AppliedVersion, ParseVersionError, SchemaVersion};
