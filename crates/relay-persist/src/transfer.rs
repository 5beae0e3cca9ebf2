//! Backend-to-backend data transfer
//!
//! Copies every persisted collection from one initialized backend to
//! another, e.g. when promoting a development file store to SQLite or to
//! the hosted backend. Errors propagate immediately; a partial transfer is
//! reported as the error it is, never as success.

use tracing::info;

use relay_core::{NewCredential, NewEndpoint, NewLogRecord};

use crate::backend::{StorageBackend, StorageError};

/// Copy all configurations, endpoints, logs, and credentials from `source`
/// to `target`. Both stores must already be initialized.
///
/// Record ids and timestamps are reassigned by `target`; credential keys are
/// carried over verbatim so issued tokens keep working.
pub async fn transfer_all(
    source: &dyn StorageBackend,
    target: &dyn StorageBackend,
) -> Result<(), StorageError> {
    let configurations = source.all_configurations().await?;
    for row in &configurations {
        target.set_configuration(&row.key, &row.value).await?;
    }

    let endpoints = source.endpoints().await?;
    for endpoint in &endpoints {
        target
            .add_endpoint(NewEndpoint {
                path: endpoint.path.clone(),
                method: endpoint.method,
                model: endpoint.model.clone(),
                prompt_template: endpoint.prompt_template.clone(),
                strategy: endpoint.strategy.clone(),
            })
            .await?;
    }

    // `logs` returns newest first; replay oldest first so the target's
    // ordering matches the source's.
    let logs = source.logs(None, None).await?;
    for log in logs.iter().rev() {
        target
            .add_log(NewLogRecord {
                prompt: log.prompt.clone(),
                response: log.response.clone(),
                model: log.model.clone(),
            })
            .await?;
    }

    let credentials = source.credentials().await?;
    for credential in &credentials {
        target
            .add_credential(NewCredential {
                key: Some(credential.key.clone()),
                owner_label: credential.owner_label.clone(),
                capabilities: credential.capabilities.clone(),
            })
            .await?;
    }

    info!(
        configurations = configurations.len(),
        endpoints = endpoints.len(),
        logs = logs.len(),
        credentials = credentials.len(),
        source = source.name(),
        target = target.name(),
        "transferred data between backends"
    );
    Ok(())
}
