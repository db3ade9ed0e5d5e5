//! Tether demo - two devices syncing a todo list through an in-memory remote.
//!
//! Configuration is read from `TETHER_*` environment variables (a `.env`
//! file is honoured). Set `RUST_LOG` to adjust logging.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether_engine::{
    ChangeEvent, ConflictCase, DocumentKey, HandlerError, MemoryLocalStore, MemoryMetadataStore,
    Namespace, Resolution, UpdateDescription,
};
use tether_sync::{MemoryRemoteCollection, SyncConfig, SyncError, Synchronizer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn open_device(
    name: &str,
    config: &SyncConfig,
    remote: &MemoryRemoteCollection,
) -> Result<Synchronizer, SyncError> {
    let config = config.clone().with_instance_id(name);
    let device = Synchronizer::open(
        config,
        Arc::new(MemoryLocalStore::new()),
        Arc::new(MemoryMetadataStore::new()),
        Arc::new(remote.clone()),
    )?;

    let todos = Namespace::new("demo", "todos");
    let label = name.to_string();
    device.set_change_listener(todos.clone(), move |event: &ChangeEvent| -> Result<(), HandlerError> {
        tracing::info!(
            device = %label,
            operation = ?event.operation_type,
            id = %event.document_key,
            uncommitted = event.has_uncommitted_writes,
            "Change event"
        );
        Ok(())
    });

    // Keep both titles when two devices edit the same todo
    device.set_conflict_handler(todos, |case: &ConflictCase| -> Result<Resolution, HandlerError> {
        let local = case.local.full_document.clone();
        let remote = case.remote.full_document.clone();
        match (local, remote) {
            (Some(mut local), Some(remote)) => {
                let merged = format!(
                    "{} / {}",
                    remote["title"].as_str().unwrap_or_default(),
                    local["title"].as_str().unwrap_or_default()
                );
                local["title"] = json!(merged);
                Ok(Resolution::Document(local))
            }
            (Some(local), None) => Ok(Resolution::Document(local)),
            (None, _) => Ok(Resolution::Delete),
        }
    });

    let label = name.to_string();
    device.set_error_listener(move |key: &DocumentKey, error: &SyncError| {
        tracing::warn!(device = %label, key = %key, error = %error, "Sync error");
    });

    Ok(device)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_sync=debug,tether_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?
        .with_sync_interval(Duration::from_millis(200))
        .with_stream_retry(tether_sync::RetryConfig::fixed(Duration::from_millis(200)));

    let remote = MemoryRemoteCollection::new();
    let phone = open_device("phone", &config, &remote)?;
    let laptop = open_device("laptop", &config, &remote)?;
    let todos = Namespace::new("demo", "todos");

    tracing::info!("Phone creates a todo while offline");
    phone.set_online(false)?;
    let id = phone
        .insert_one(&todos, json!({"title": "buy milk", "done": false}))
        .await?;
    let report = phone.do_sync_pass().await;
    tracing::info!(skipped = report.skipped, "Offline pass");

    tracing::info!("Phone reconnects");
    phone.set_online(true)?;
    phone.start()?;
    laptop.sync_ids(&todos, [id.clone()])?;
    laptop.start()?;
    tokio::time::sleep(Duration::from_millis(600)).await;
    tracing::info!(laptop = ?laptop.find_one(&todos, &id)?, "Laptop copy");

    tracing::info!("Both devices edit the todo offline");
    phone.set_online(false)?;
    laptop.set_online(false)?;
    phone
        .update_one(&todos, &id, &UpdateDescription::new().set("title", json!("buy oat milk")))
        .await?;
    laptop
        .update_one(&todos, &id, &UpdateDescription::new().set("done", json!(true)))
        .await?;

    laptop.set_online(true)?;
    tokio::time::sleep(Duration::from_millis(600)).await;
    phone.set_online(true)?;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    tracing::info!(
        phone = ?phone.find_one(&todos, &id)?,
        laptop = ?laptop.find_one(&todos, &id)?,
        remote = ?remote.document(&todos, &id),
        "Converged state"
    );
    tracing::info!(phone = ?phone.stats(), laptop = ?laptop.stats(), "Stats");

    phone.stop().await;
    laptop.stop().await;
    Ok(())
}
