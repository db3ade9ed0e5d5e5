//! Remote collection abstraction.
//!
//! The synchronizer talks to the authoritative store through
//! [`RemoteCollection`]. Writes are guarded by a version precondition so a
//! write based on a stale baseline never silently overwrites someone else's
//! change. [`MemoryRemoteCollection`] is an in-process implementation with a
//! resumable change log and failure injection.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_engine::{
    document_id, ChangeEvent, DocumentId, Namespace, ResumeToken, UpdateDescription, VersionToken,
};
use tokio::sync::Notify;

/// Errors reported by a remote collection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("document already exists remotely: {0}")]
    DuplicateKey(DocumentId),

    #[error("remote error: {0}")]
    Other(String),
}

/// A document as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    pub id: DocumentId,
    pub document: Value,
    #[serde(default)]
    pub version: Option<VersionToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertResult {
    pub inserted_id: DocumentId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Parameters for opening a change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    pub namespace: Namespace,
    /// Only events for these documents are delivered
    pub ids: Vec<DocumentId>,
    /// Continue after this point; `None` starts at the oldest retained event
    pub resume_token: Option<ResumeToken>,
}

/// One delivered change plus the token that resumes after it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub event: ChangeEvent,
    pub resume_token: ResumeToken,
}

pub type ChangeStream = BoxStream<'static, Result<StreamItem, RemoteError>>;

/// The authoritative document store.
///
/// `expected` preconditions match a document whose stored version equals the
/// given token; `None` matches a document that has no version.
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    async fn find(
        &self,
        namespace: &Namespace,
        ids: &[DocumentId],
    ) -> Result<Vec<RemoteDocument>, RemoteError>;

    /// Insert a new document. Fails with [`RemoteError::DuplicateKey`] if the id exists.
    async fn insert_one(
        &self,
        namespace: &Namespace,
        document: &Value,
        version: &VersionToken,
    ) -> Result<InsertResult, RemoteError>;

    async fn replace_one(
        &self,
        namespace: &Namespace,
        id: &str,
        expected: Option<&VersionToken>,
        document: &Value,
        version: &VersionToken,
    ) -> Result<UpdateResult, RemoteError>;

    async fn delete_one(
        &self,
        namespace: &Namespace,
        id: &str,
        expected: Option<&VersionToken>,
    ) -> Result<DeleteResult, RemoteError>;

    async fn watch(&self, request: WatchRequest) -> Result<ChangeStream, RemoteError>;
}

/// Snapshot of how often each remote method was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub find: usize,
    pub insert: usize,
    pub replace: usize,
    pub delete: usize,
    pub watch: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.find + self.insert + self.replace + self.delete + self.watch
    }

    pub fn writes(&self) -> usize {
        self.insert + self.replace + self.delete
    }
}

#[derive(Debug, Default)]
struct Counters {
    find: AtomicUsize,
    insert: AtomicUsize,
    replace: AtomicUsize,
    delete: AtomicUsize,
    watch: AtomicUsize,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    document: Value,
    version: Option<VersionToken>,
}

#[derive(Debug, Default)]
struct RemoteState {
    documents: HashMap<Namespace, HashMap<DocumentId, StoredDocument>>,
    log: Vec<ChangeEvent>,
}

impl RemoteState {
    fn get(&self, namespace: &Namespace, id: &str) -> Option<&StoredDocument> {
        self.documents.get(namespace)?.get(id)
    }

    fn record(&mut self, event: ChangeEvent) {
        self.log.push(event);
    }
}

#[derive(Debug)]
struct RemoteShared {
    state: Mutex<RemoteState>,
    changed: Notify,
    connected: AtomicBool,
    fail_writes: AtomicBool,
    drop_acks: AtomicBool,
    epoch: AtomicU64,
    counters: Counters,
    writer_id: String,
}

impl RemoteShared {
    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_connected(&self) -> Result<(), RemoteError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("remote unreachable".into()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), RemoteError> {
        self.check_connected()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("write rejected by transport".into()));
        }
        Ok(())
    }

    /// Report a successful write, or a lost acknowledgement if configured.
    fn acknowledge<T>(&self, result: T) -> Result<T, RemoteError> {
        self.changed.notify_waiters();
        if self.drop_acks.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("acknowledgement lost".into()));
        }
        Ok(result)
    }

    fn interrupt_streams(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

/// In-process [`RemoteCollection`].
///
/// Every accepted write is appended to a change log; resume tokens are log
/// positions. Writes made through the `foreign_*` helpers simulate another
/// client and are stamped with the collection's own writer id.
#[derive(Debug, Clone)]
pub struct MemoryRemoteCollection {
    shared: Arc<RemoteShared>,
}

impl Default for MemoryRemoteCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteCollection {
    pub fn new() -> Self {
        Self::with_writer_id("remote")
    }

    /// Use `writer_id` as the instance id of foreign writes.
    pub fn with_writer_id(writer_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(RemoteShared {
                state: Mutex::new(RemoteState::default()),
                changed: Notify::new(),
                connected: AtomicBool::new(true),
                fail_writes: AtomicBool::new(false),
                drop_acks: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                counters: Counters::default(),
                writer_id: writer_id.into(),
            }),
        }
    }

    /// Simulate losing or regaining connectivity. Going offline breaks open streams.
    pub fn set_connected(&self, connected: bool) {
        self.shared.connected.store(connected, Ordering::SeqCst);
        if !connected {
            self.shared.interrupt_streams();
        }
    }

    /// Make writes fail with a network error while reads and streams keep working.
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Apply writes but report a network error instead of the result.
    pub fn set_drop_acks(&self, drop: bool) {
        self.shared.drop_acks.store(drop, Ordering::SeqCst);
    }

    /// End every open change stream with an error.
    pub fn break_streams(&self) {
        self.shared.interrupt_streams();
    }

    pub fn calls(&self) -> CallCounts {
        let c = &self.shared.counters;
        CallCounts {
            find: c.find.load(Ordering::SeqCst),
            insert: c.insert.load(Ordering::SeqCst),
            replace: c.replace.load(Ordering::SeqCst),
            delete: c.delete.load(Ordering::SeqCst),
            watch: c.watch.load(Ordering::SeqCst),
        }
    }

    pub fn document(&self, namespace: &Namespace, id: &str) -> Option<Value> {
        self.shared
            .state()
            .get(namespace, id)
            .map(|d| d.document.clone())
    }

    pub fn version(&self, namespace: &Namespace, id: &str) -> Option<VersionToken> {
        self.shared
            .state()
            .get(namespace, id)
            .and_then(|d| d.version.clone())
    }

    pub fn count(&self, namespace: &Namespace) -> usize {
        self.shared
            .state()
            .documents
            .get(namespace)
            .map_or(0, HashMap::len)
    }

    /// Number of events in the change log.
    pub fn event_count(&self) -> usize {
        self.shared.state().log.len()
    }

    /// Insert a document as another client would.
    pub fn foreign_insert(
        &self,
        namespace: &Namespace,
        document: Value,
    ) -> Result<VersionToken, RemoteError> {
        let id = document_id(&document)
            .ok_or_else(|| RemoteError::Other("document has no _id".into()))?;
        let version = VersionToken::initial(self.shared.writer_id.clone());
        {
            let mut state = self.shared.state();
            if state.get(namespace, &id).is_some() {
                return Err(RemoteError::DuplicateKey(id));
            }
            store(&mut state, namespace, &id, document.clone(), Some(version.clone()));
            state.record(
                ChangeEvent::insert(namespace.clone(), id, document)
                    .with_version(Some(version.clone())),
            );
        }
        self.shared.changed.notify_waiters();
        Ok(version)
    }

    /// Replace a document as another client would, ignoring preconditions.
    pub fn foreign_replace(
        &self,
        namespace: &Namespace,
        id: &str,
        document: Value,
    ) -> Result<VersionToken, RemoteError> {
        let version = {
            let mut state = self.shared.state();
            let current = state.get(namespace, id).and_then(|d| d.version.clone());
            let version = VersionToken::next_for(current.as_ref(), self.shared.writer_id.clone());
            store(&mut state, namespace, id, document.clone(), Some(version.clone()));
            state.record(
                ChangeEvent::replace(namespace.clone(), id, document)
                    .with_version(Some(version.clone())),
            );
            version
        };
        self.shared.changed.notify_waiters();
        Ok(version)
    }

    /// Apply a field-level update as another client would.
    pub fn foreign_update(
        &self,
        namespace: &Namespace,
        id: &str,
        update: &UpdateDescription,
    ) -> Result<VersionToken, RemoteError> {
        let version = {
            let mut state = self.shared.state();
            let current = state
                .get(namespace, id)
                .cloned()
                .ok_or_else(|| RemoteError::Other(format!("no remote document {id}")))?;
            let document = update
                .apply_to(&current.document)
                .map_err(|e| RemoteError::Other(e.to_string()))?;
            let version =
                VersionToken::next_for(current.version.as_ref(), self.shared.writer_id.clone());
            store(&mut state, namespace, id, document.clone(), Some(version.clone()));
            state.record(
                ChangeEvent::update(namespace.clone(), id, document, update.clone())
                    .with_version(Some(version.clone())),
            );
            version
        };
        self.shared.changed.notify_waiters();
        Ok(version)
    }

    /// Delete a document as another client would.
    pub fn foreign_delete(&self, namespace: &Namespace, id: &str) -> bool {
        let removed = {
            let mut state = self.shared.state();
            let removed = remove(&mut state, namespace, id);
            if removed {
                state.record(ChangeEvent::delete(namespace.clone(), id));
            }
            removed
        };
        self.shared.changed.notify_waiters();
        removed
    }

    /// Append an arbitrary event to the change log without touching documents.
    pub fn push_event(&self, event: ChangeEvent) {
        self.shared.state().record(event);
        self.shared.changed.notify_waiters();
    }
}

fn store(
    state: &mut RemoteState,
    namespace: &Namespace,
    id: &str,
    document: Value,
    version: Option<VersionToken>,
) {
    state
        .documents
        .entry(namespace.clone())
        .or_default()
        .insert(id.to_string(), StoredDocument { document, version });
}

fn remove(state: &mut RemoteState, namespace: &Namespace, id: &str) -> bool {
    state
        .documents
        .get_mut(namespace)
        .is_some_and(|docs| docs.remove(id).is_some())
}

fn precondition_holds(stored: Option<&StoredDocument>, expected: Option<&VersionToken>) -> bool {
    stored.is_some_and(|doc| doc.version.as_ref() == expected)
}

#[async_trait]
impl RemoteCollection for MemoryRemoteCollection {
    async fn find(
        &self,
        namespace: &Namespace,
        ids: &[DocumentId],
    ) -> Result<Vec<RemoteDocument>, RemoteError> {
        self.shared.counters.find.fetch_add(1, Ordering::SeqCst);
        self.shared.check_connected()?;

        let state = self.shared.state();
        Ok(ids
            .iter()
            .filter_map(|id| {
                state.get(namespace, id).map(|doc| RemoteDocument {
                    id: id.clone(),
                    document: doc.document.clone(),
                    version: doc.version.clone(),
                })
            })
            .collect())
    }

    async fn insert_one(
        &self,
        namespace: &Namespace,
        document: &Value,
        version: &VersionToken,
    ) -> Result<InsertResult, RemoteError> {
        self.shared.counters.insert.fetch_add(1, Ordering::SeqCst);
        self.shared.check_writable()?;

        let id = document_id(document)
            .ok_or_else(|| RemoteError::Other("document has no _id".into()))?;
        {
            let mut state = self.shared.state();
            if state.get(namespace, &id).is_some() {
                return Err(RemoteError::DuplicateKey(id));
            }
            store(&mut state, namespace, &id, document.clone(), Some(version.clone()));
            state.record(
                ChangeEvent::insert(namespace.clone(), id.clone(), document.clone())
                    .with_version(Some(version.clone())),
            );
        }
        self.shared.acknowledge(InsertResult { inserted_id: id })
    }

    async fn replace_one(
        &self,
        namespace: &Namespace,
        id: &str,
        expected: Option<&VersionToken>,
        document: &Value,
        version: &VersionToken,
    ) -> Result<UpdateResult, RemoteError> {
        self.shared.counters.replace.fetch_add(1, Ordering::SeqCst);
        self.shared.check_writable()?;

        {
            let mut state = self.shared.state();
            if !precondition_holds(state.get(namespace, id), expected) {
                return Ok(UpdateResult {
                    matched_count: 0,
                    modified_count: 0,
                });
            }
            store(&mut state, namespace, id, document.clone(), Some(version.clone()));
            state.record(
                ChangeEvent::replace(namespace.clone(), id, document.clone())
                    .with_version(Some(version.clone())),
            );
        }
        self.shared.acknowledge(UpdateResult {
            matched_count: 1,
            modified_count: 1,
        })
    }

    async fn delete_one(
        &self,
        namespace: &Namespace,
        id: &str,
        expected: Option<&VersionToken>,
    ) -> Result<DeleteResult, RemoteError> {
        self.shared.counters.delete.fetch_add(1, Ordering::SeqCst);
        self.shared.check_writable()?;

        {
            let mut state = self.shared.state();
            if !precondition_holds(state.get(namespace, id), expected) {
                return Ok(DeleteResult { deleted_count: 0 });
            }
            remove(&mut state, namespace, id);
            state.record(ChangeEvent::delete(namespace.clone(), id));
        }
        self.shared.acknowledge(DeleteResult { deleted_count: 1 })
    }

    async fn watch(&self, request: WatchRequest) -> Result<ChangeStream, RemoteError> {
        self.shared.counters.watch.fetch_add(1, Ordering::SeqCst);
        self.shared.check_connected()?;

        let position = match &request.resume_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| RemoteError::Other(format!("invalid resume token {token:?}")))?,
            None => 0,
        };

        let cursor = Cursor {
            shared: self.shared.clone(),
            namespace: request.namespace,
            ids: request.ids.into_iter().collect(),
            position,
            epoch: self.shared.epoch.load(Ordering::SeqCst),
            done: false,
        };

        let stream = futures::stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            loop {
                let shared = cursor.shared.clone();
                let notified = shared.changed.notified();

                if shared.epoch.load(Ordering::SeqCst) != cursor.epoch
                    || shared.check_connected().is_err()
                {
                    cursor.done = true;
                    let err = RemoteError::Network("change stream interrupted".into());
                    return Some((Err(err), cursor));
                }
                if let Some(item) = cursor.next_item() {
                    return Some((Ok(item), cursor));
                }
                notified.await;
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Read position of one open change stream.
struct Cursor {
    shared: Arc<RemoteShared>,
    namespace: Namespace,
    ids: HashSet<DocumentId>,
    position: usize,
    epoch: u64,
    done: bool,
}

impl Cursor {
    fn next_item(&mut self) -> Option<StreamItem> {
        let state = self.shared.state();
        while self.position < state.log.len() {
            let event = &state.log[self.position];
            self.position += 1;
            if event.namespace == self.namespace && self.ids.contains(&event.document_key) {
                return Some(StreamItem {
                    event: event.clone(),
                    resume_token: self.position.to_string(),
                });
            }
        }
        None
    }
}
