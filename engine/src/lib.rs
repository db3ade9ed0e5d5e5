//! # Tether Engine
//!
//! The deterministic core of an offline-first document synchronizer.
//!
//! This crate holds the data model and decision logic shared by every
//! runtime: how local writes fold into a single pending write, how an
//! observed remote version relates to the local baseline, and what a
//! conflict resolution means for local state. It performs no IO and has no
//! async runtime; the `tether-sync` crate drives it.
//!
//! ## Design Principles
//!
//! - **No IO**: storage and network are reached through traits
//! - **Deterministic**: the same inputs always produce the same decisions
//! - **Testable**: pure logic plus in-memory stores
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! JSON documents live in a [`Namespace`] and are identified by their `_id`
//! field. A [`DocumentKey`] combines both.
//!
//! ### Versions
//!
//! Every write accepted by the remote is stamped with a [`VersionToken`]
//! (writer instance + generation). The last confirmed token is the
//! document's baseline.
//!
//! ### Pending writes
//!
//! Local changes not yet confirmed remotely are kept as at most one
//! [`PendingWrite`] per document; see [`coalesce`].
//!
//! ### Classification
//!
//! [`classify`] compares an observed remote version to the baseline and
//! yields a [`VersionState`]. Only [`VersionState::New`] is a conflict and
//! goes to the user's [`ConflictHandler`].
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{classify, coalesce, LocalWrite, VersionContext, VersionState, VersionToken};
//! use chrono::Utc;
//! use serde_json::json;
//!
//! // Two local writes collapse into one pending insert
//! let pending = coalesce(None, LocalWrite::insert(json!({"_id": "1", "n": 1})), None, 1, Utc::now());
//! let pending = coalesce(pending, LocalWrite::replace(json!({"_id": "1", "n": 2})), None, 2, Utc::now());
//! assert_eq!(pending.unwrap().document, Some(json!({"_id": "1", "n": 2})));
//!
//! // Our own write echoed back by the remote is not a conflict
//! let context = VersionContext { baseline: None, previous: None, instance_id: "device-1" };
//! let echoed = VersionToken::initial("device-1");
//! assert_eq!(classify(&context, Some(&echoed)), VersionState::Next);
//! ```
//!
//! ## Persistence
//!
//! [`MetadataStore`] implementations persist [`DocumentMeta`], [`UndoRecord`]s
//! and resume tokens. [`SyncSnapshot`] is the serializable form of all of it.

pub mod conflict;
pub mod document;
pub mod error;
pub mod event;
pub mod meta;
pub mod pending;
pub mod snapshot;
pub mod store;
pub mod version;

// Re-export main types at crate root
pub use conflict::{
    classify, ConflictCase, ConflictHandler, HandlerError, LocalWins, RemoteWins, Resolution,
    ResolutionPlan, VersionContext, VersionState,
};
pub use document::{document_id, with_id, DocumentKey, Namespace, UpdateDescription, ID_FIELD};
pub use error::Error;
pub use event::{ChangeEvent, OperationType};
pub use meta::{DocumentMeta, UndoOperation, UndoRecord};
pub use pending::{coalesce, LocalWrite, PendingWrite, WriteKind};
pub use snapshot::{SyncSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{Collection, LocalStore, MemoryLocalStore, MemoryMetadataStore, MetadataStore};
pub use version::VersionToken;

/// Type aliases for clarity
pub type DocumentId = String;
pub type InstanceId = String;
pub type ResumeToken = String;
pub type Generation = u64;
pub type Sequence = u64;
