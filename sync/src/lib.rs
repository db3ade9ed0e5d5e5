//! # Tether Sync
//!
//! Async runtime of the Tether synchronizer.
//!
//! A [`Synchronizer`] keeps a local document replica and a remote collection
//! in step. Host writes go to the local replica immediately and are queued as
//! pending writes; sync passes push them to the remote under a version
//! precondition and apply the remote's changes, delivered over a resumable
//! change stream, back to the replica. Genuine conflicts go to a per-namespace
//! conflict handler.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tether_engine::{MemoryLocalStore, MemoryMetadataStore, Namespace};
//! use tether_sync::{MemoryRemoteCollection, SyncConfig, Synchronizer};
//!
//! # async fn run() -> tether_sync::Result<()> {
//! let sync = Synchronizer::open(
//!     SyncConfig::new().with_instance_id("device-1"),
//!     Arc::new(MemoryLocalStore::new()),
//!     Arc::new(MemoryMetadataStore::new()),
//!     Arc::new(MemoryRemoteCollection::new()),
//! )?;
//!
//! let todos = Namespace::new("app", "todos");
//! sync.insert_one(&todos, json!({"_id": "1", "title": "milk"})).await?;
//! sync.start()?;
//! let report = sync.do_sync_pass().await;
//! assert_eq!(report.pushed, 1);
//! sync.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`write_log`]: durable pending writes with undo-protected local mutations
//! - [`pass`]: the local-to-remote / remote-to-local sync pass
//! - [`stream`]: change stream consumers feeding the sync pass
//! - [`dispatch`]: change, error and conflict callbacks
//! - [`remote`]: the remote collection seam and an in-memory implementation
//! - [`persist`]: JSON file metadata store

pub mod config;
pub mod dispatch;
pub mod error;
mod lifecycle;
pub mod pass;
pub mod persist;
pub mod remote;
pub mod stream;
pub mod synchronizer;
pub mod write_log;

pub use config::{ConfigError, RetryConfig, SyncConfig};
pub use dispatch::{ChangeListener, ErrorListener, EventDispatcher};
pub use error::{Result, SyncError};
pub use pass::{SyncPassReport, SyncStats};
pub use persist::JsonFileMetadataStore;
pub use remote::{
    CallCounts, ChangeStream, DeleteResult, InsertResult, MemoryRemoteCollection,
    RemoteCollection, RemoteDocument, RemoteError, StreamItem, UpdateResult, WatchRequest,
};
pub use stream::{ChangeStreamConsumer, InboundEvent};
pub use synchronizer::Synchronizer;
pub use write_log::{PendingWriteLog, PendingWrites};
