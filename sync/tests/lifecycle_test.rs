//! Lifecycle tests: background scheduling, change stream consumers and the
//! online/authenticated gates.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether_engine::{MemoryLocalStore, MemoryMetadataStore, Namespace};
use tether_sync::{MemoryRemoteCollection, RetryConfig, SyncConfig, Synchronizer};

fn todos() -> Namespace {
    Namespace::new("app", "todos")
}

fn open(remote: &MemoryRemoteCollection, interval: Duration) -> Synchronizer {
    let config = SyncConfig::new()
        .with_instance_id("device")
        .with_sync_interval(interval)
        .with_operation_timeout(Duration::from_secs(2))
        .with_stream_retry(RetryConfig::fixed(Duration::from_millis(10)));
    Synchronizer::open(
        config,
        Arc::new(MemoryLocalStore::new()),
        Arc::new(MemoryMetadataStore::new()),
        Arc::new(remote.clone()),
    )
    .unwrap()
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..300 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let remote = MemoryRemoteCollection::new();
    let sync = open(&remote, Duration::from_secs(3600));

    assert!(!sync.is_running());
    sync.start().unwrap();
    sync.start().unwrap();
    assert!(sync.is_running());

    sync.stop().await;
    sync.stop().await;
    assert!(!sync.is_running());

    sync.start().unwrap();
    assert!(sync.is_running());
    sync.stop().await;
}

#[tokio::test]
async fn scheduler_runs_passes_in_background() {
    let remote = MemoryRemoteCollection::new();
    let sync = open(&remote, Duration::from_millis(20));
    sync.start().unwrap();

    sync.insert_one(&todos(), json!({"_id": "bg"})).await.unwrap();
    wait_for(|| remote.document(&todos(), "bg").is_some()).await;
    wait_for(|| sync.pending_write(&todos(), "bg").is_none()).await;
    assert!(sync.stats().passes >= 1);

    sync.stop().await;
}

#[tokio::test]
async fn stop_halts_scheduler() {
    let remote = MemoryRemoteCollection::new();
    let sync = open(&remote, Duration::from_millis(10));
    sync.start().unwrap();
    wait_for(|| sync.stats().passes >= 2).await;

    sync.stop().await;
    let passes = sync.stats().passes;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sync.stats().passes, passes);
}

#[tokio::test]
async fn going_offline_closes_streams() {
    let remote = MemoryRemoteCollection::new();
    let sync = open(&remote, Duration::from_millis(20));
    sync.insert_one(&todos(), json!({"_id": "s", "v": 1}))
        .await
        .unwrap();
    sync.start().unwrap();
    wait_for(|| remote.calls().watch >= 1).await;
    wait_for(|| sync.pending_write(&todos(), "s").is_none()).await;

    sync.set_online(false).unwrap();
    assert!(!sync.is_online());
    let watches = remote.calls().watch;
    let writes = remote.calls().writes();
    remote
        .foreign_replace(&todos(), "s", json!({"_id": "s", "v": 2}))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(remote.calls().watch, watches);
    assert_eq!(remote.calls().writes(), writes);
    assert_eq!(
        sync.find_one(&todos(), "s").unwrap(),
        Some(json!({"_id": "s", "v": 1}))
    );
    assert!(sync.do_sync_pass().await.skipped);

    sync.set_online(true).unwrap();
    wait_for(|| remote.calls().watch > watches).await;
    wait_for(|| sync.find_one(&todos(), "s").unwrap() == Some(json!({"_id": "s", "v": 2}))).await;
    sync.stop().await;
}

#[tokio::test]
async fn unauthenticated_passes_are_skipped() {
    let remote = MemoryRemoteCollection::new();
    let sync = open(&remote, Duration::from_secs(3600));
    sync.set_authenticated(false).unwrap();

    sync.insert_one(&todos(), json!({"_id": "u"})).await.unwrap();
    let report = sync.do_sync_pass().await;
    assert!(report.skipped);
    assert_eq!(remote.calls().total(), 0);
    assert_eq!(sync.stats().skipped_passes, 1);

    sync.set_authenticated(true).unwrap();
    let report = sync.do_sync_pass().await;
    assert_eq!(report.pushed, 1);
}

#[tokio::test]
async fn broken_stream_is_reopened() {
    let remote = MemoryRemoteCollection::new();
    let sync = open(&remote, Duration::from_millis(20));
    sync.insert_one(&todos(), json!({"_id": "b", "v": 1}))
        .await
        .unwrap();
    sync.start().unwrap();
    wait_for(|| remote.calls().watch >= 1).await;
    wait_for(|| sync.pending_write(&todos(), "b").is_none()).await;

    remote.break_streams();
    remote
        .foreign_replace(&todos(), "b", json!({"_id": "b", "v": 2}))
        .unwrap();

    wait_for(|| sync.find_one(&todos(), "b").unwrap() == Some(json!({"_id": "b", "v": 2}))).await;
    assert!(remote.calls().watch >= 2);
    sync.stop().await;
}

#[tokio::test]
async fn synced_ids_open_a_stream_per_namespace() {
    let remote = MemoryRemoteCollection::new();
    let notes = Namespace::new("app", "notes");
    remote
        .foreign_insert(&notes, json!({"_id": "n1", "text": "hello"}))
        .unwrap();
    let sync = open(&remote, Duration::from_millis(20));
    sync.start().unwrap();
    assert_eq!(remote.calls().watch, 0);

    sync.sync_ids(&notes, ["n1"]).unwrap();
    wait_for(|| remote.calls().watch >= 1).await;
    wait_for(|| sync.find_one(&notes, "n1").unwrap().is_some()).await;

    remote
        .foreign_replace(&notes, "n1", json!({"_id": "n1", "text": "bye"}))
        .unwrap();
    wait_for(|| {
        sync.find_one(&notes, "n1").unwrap() == Some(json!({"_id": "n1", "text": "bye"}))
    })
    .await;
    sync.stop().await;
}
