use std::error::Error;

use relay_core::{HttpMethod, NewCredential, NewEndpoint, NewLogRecord, SchemaVersion};
use relay_persist::{
    apply_pending, default_migrations, rollback_last, FileStore, MigrationBackend, SqliteConfig,
    SqliteStore, StorageBackend, StorageError,
};

fn endpoint_input(path: &str) -> NewEndpoint {
    NewEndpoint {
        path: path.to_string(),
        method: HttpMethod::Post,
        model: "gpt-4".to_string(),
        prompt_template: "Translate the following text: {input}".to_string(),
        strategy: None,
    }
}

/// Exercise the whole contract surface against one initialized backend.
async fn exercise_contract(store: &dyn StorageBackend) -> Result<(), Box<dyn Error>> {
    // 1. Migrations are applied and tracked.
    assert_eq!(store.schema_version().await?, SchemaVersion::new(0, 4, 0));

    // 2. Configuration upsert: the second write wins, one row per key.
    store.set_configuration("llm_type", "v1").await?;
    store.set_configuration("llm_type", "v2").await?;
    assert_eq!(
        store.get_configuration("llm_type").await?,
        Some("v2".to_string())
    );
    assert_eq!(store.all_configurations().await?.len(), 1);
    assert_eq!(store.get_configuration("llm_model").await?, None);

    // 3. Endpoint registration and lookup by path.
    store.add_endpoint(endpoint_input("/translate")).await?;
    let endpoint = store
        .endpoint_by_path("/translate")
        .await?
        .expect("registered endpoint");
    assert_eq!(endpoint.path, "/translate");
    assert_eq!(endpoint.method, HttpMethod::Post);
    assert_eq!(endpoint.model, "gpt-4");
    assert_eq!(
        endpoint.prompt_template,
        "Translate the following text: {input}"
    );

    // 4. A duplicate path is a conflict, not a shadow.
    let err = store
        .add_endpoint(endpoint_input("/translate"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));

    // 5. Log pagination: newest first.
    for prompt in ["L1", "L2", "L3"] {
        store
            .add_log(NewLogRecord {
                prompt: prompt.to_string(),
                response: "ok".to_string(),
                model: "gpt-4".to_string(),
            })
            .await?;
    }
    let page = store.logs(Some(2), Some(0)).await?;
    let prompts: Vec<&str> = page.iter().map(|l| l.prompt.as_str()).collect();
    assert_eq!(prompts, vec!["L3", "L2"]);
    assert_eq!(store.log_count().await?, 3);
    assert_eq!(store.log_count_by_model("gpt-4").await?, 3);
    assert_eq!(store.log_count_by_model("other").await?, 0);

    // 6. Credential issue and lookup by the generated token.
    let issued = store.add_credential(NewCredential::default()).await?;
    let found = store.credential(&issued.key).await?.expect("issued token");
    assert_eq!(found.id, issued.id);
    assert_eq!(store.credential("rk_no_such_token").await?, None);

    Ok(())
}

#[tokio::test]
async fn file_store_runs_the_full_contract() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let store = FileStore::new(dir.path());
    store.initialize().await?;

    exercise_contract(&store).await?;

    store.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn sqlite_store_runs_the_full_contract() -> Result<(), Box<dyn Error>> {
    let store = SqliteStore::connect_with_config(SqliteConfig::memory()).await?;
    store.initialize().await?;

    exercise_contract(&store).await?;

    store.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn rollback_then_apply_restores_sqlite_schema() -> Result<(), Box<dyn Error>> {
    // 1. Boot at the latest version.
    let store = SqliteStore::connect_with_config(SqliteConfig::memory()).await?;
    store.initialize().await?;
    assert_eq!(store.schema_version().await?, SchemaVersion::new(0, 4, 0));

    // 2. Roll back the credential store; the table is really gone.
    let migrations = default_migrations();
    let rolled = rollback_last(&store, &migrations).await?;
    assert_eq!(rolled, Some(SchemaVersion::new(0, 3, 0)));
    let err = store
        .add_credential(NewCredential::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Unavailable(_)));

    // 3. Apply-pending restores exactly the rolled-back migration.
    let reapplied = apply_pending(&store, &migrations).await?;
    assert_eq!(reapplied, vec![SchemaVersion::new(0, 4, 0)]);
    assert_eq!(store.schema_version().await?, SchemaVersion::new(0, 4, 0));
    store.add_credential(NewCredential::default()).await?;

    store.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn transfer_moves_every_collection_between_backends() -> Result<(), Box<dyn Error>> {
    // 1. Populate a file store.
    let dir = tempfile::tempdir()?;
    let source = FileStore::new(dir.path());
    source.initialize().await?;
    source.set_configuration("llm_model", "gpt-4").await?;
    source.add_endpoint(endpoint_input("/summarize")).await?;
    for prompt in ["first", "second"] {
        source
            .add_log(NewLogRecord {
                prompt: prompt.to_string(),
                response: "ok".to_string(),
                model: "gpt-4".to_string(),
            })
            .await?;
    }
    let issued = source.add_credential(NewCredential::default()).await?;

    // 2. Transfer into a fresh SQLite store.
    let target = SqliteStore::connect_with_config(SqliteConfig::memory()).await?;
    target.initialize().await?;
    relay_persist::transfer_all(&source, &target).await?;

    // 3. Everything arrived, and the issued token still resolves.
    assert_eq!(
        target.get_configuration("llm_model").await?,
        Some("gpt-4".to_string())
    );
    assert!(target.endpoint_by_path("/summarize").await?.is_some());
    assert_eq!(target.log_count().await?, 2);
    let logs = target.logs(None, None).await?;
    assert_eq!(logs[0].prompt, "second");
    assert!(target.credential(&issued.key).await?.is_some());

    source.shutdown().await?;
    target.shutdown().await?;
    Ok(())
}
