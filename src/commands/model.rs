//! `streamrec model ...`

use super::{ModelArgs, ModelCommand};
use crate::config::Config;
use crate::models::{JsonModelStore, ModelRecord, ModelStore, StoreError};
use crate::utils::error::AppResult;
use crate::utils::slug::slugify;
use tracing::info_span;

pub async fn handle(config: Config, cmd: ModelCommand) -> AppResult<()> {
    let store = JsonModelStore::new(config.layout().models_file(), info_span!("store"));

    match cmd {
        ModelCommand::Add(args) => {
            let record = add(&store, args, config.default_retention_days).await?;
            println!("Saved model {}", record.identity);
        }
        ModelCommand::Set(args) => {
            let record = set(&store, args).await?;
            println!("Updated model {}", record.identity);
        }
        ModelCommand::Remove { identity } => {
            let identity = slugify(&identity);
            if store.remove(&identity).await? {
                println!("Removed model {} (archives kept)", identity);
            } else {
                return Err(StoreError::NotFound(identity).into());
            }
        }
        ModelCommand::List { json } => {
            let models = store.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&models)?);
            } else {
                print_table(&models);
            }
        }
    }
    Ok(())
}

/// Insert a new model or overwrite the settings of an existing one
pub async fn add(
    store: &dyn ModelStore,
    args: ModelArgs,
    default_retention_days: u32,
) -> AppResult<ModelRecord> {
    let identity = slugify(&args.identity);
    let mut record = store
        .get(&identity)
        .await?
        .unwrap_or_else(|| {
            ModelRecord::new(identity.clone()).with_retention_days(default_retention_days)
        });
    if record.display_name.is_none() && identity != args.identity {
        record.display_name = Some(args.identity.clone());
    }
    apply(&mut record, args);
    store.upsert(record.clone()).await?;
    Ok(record)
}

/// Change settings of a model that must already exist
pub async fn set(store: &dyn ModelStore, args: ModelArgs) -> AppResult<ModelRecord> {
    let identity = slugify(&args.identity);
    let mut record = store
        .get(&identity)
        .await?
        .ok_or_else(|| StoreError::NotFound(identity.clone()))?;
    apply(&mut record, args);
    store.upsert(record.clone()).await?;
    Ok(record)
}

fn apply(record: &mut ModelRecord, args: ModelArgs) {
    if let Some(name) = args.display_name {
        record.display_name = Some(name);
    }
    if let Some(days) = args.retention_days {
        record.retention_days = days;
    }
    if let Some(enabled) = args.auto_record {
        record.auto_record_enabled = enabled;
    }
    if let Some(quality) = args.quality {
        record.quality_preference = quality;
    }
}

fn print_table(models: &[ModelRecord]) {
    if models.is_empty() {
        println!("No models configured");
        return;
    }
    println!(
        "{:<24} {:<6} {:>9} {:<7} {:>8}",
        "IDENTITY", "AUTO", "RETENTION", "ONLINE", "VIEWERS"
    );
    for m in models {
        println!(
            "{:<24} {:<6} {:>8}d {:<7} {:>8}",
            m.identity,
            if m.auto_record_enabled { "yes" } else { "no" },
            m.retention_days,
            if m.status.is_online { "yes" } else { "no" },
            m.status.viewer_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::AppError;
    use tempfile::tempdir;

    fn args(identity: &str) -> ModelArgs {
        ModelArgs {
            identity: identity.to_string(),
            display_name: None,
            retention_days: None,
            auto_record: None,
            quality: None,
        }
    }

    #[tokio::test]
    async fn test_add_slugifies_and_applies_default_retention() {
        let dir = tempdir().unwrap();
        let store = JsonModelStore::new(dir.path().join("models.json"), tracing::Span::none());

        let record = add(&store, args("Alice Smith"), 14).await.unwrap();
        assert_eq!(record.identity, "alice-smith");
        assert_eq!(record.display_name.as_deref(), Some("Alice Smith"));
        assert_eq!(record.retention_days, 14);
        assert!(record.auto_record_enabled);
    }

    #[tokio::test]
    async fn test_set_requires_existing_model() {
        let dir = tempdir().unwrap();
        let store = JsonModelStore::new(dir.path().join("models.json"), tracing::Span::none());

        let err = set(&store, args("ghost")).await.unwrap_err();
        assert!(matches!(err, AppError::Store(StoreError::NotFound(_))));

        add(&store, args("bob"), 30).await.unwrap();
        let updated = set(
            &store,
            ModelArgs {
                auto_record: Some(false),
                retention_days: Some(3),
                ..args("bob")
            },
        )
        .await
        .unwrap();
        assert!(!updated.auto_record_enabled);
        assert_eq!(store.get("bob").await.unwrap().unwrap().retention_days, 3);
    }
}
