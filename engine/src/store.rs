//! Storage seams.
//!
//! The synchronizer reads and writes documents through [`LocalStore`] and
//! keeps its bookkeeping in a [`MetadataStore`]. Both are synchronous, since
//! local storage is expected to be fast and embedded. In-memory
//! implementations are provided for tests and ephemeral use.

use crate::{
    error::Result, DocumentId, DocumentKey, DocumentMeta, Error, InstanceId, Namespace,
    ResumeToken, SyncSnapshot, UndoRecord,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// Host-owned document storage.
pub trait LocalStore: Send + Sync {
    fn find(&self, namespace: &Namespace, id: &str) -> Result<Option<Value>>;

    fn find_all(&self, namespace: &Namespace) -> Result<Vec<Value>>;

    /// Insert a new document. Fails with [`Error::DuplicateKey`] if the id is taken.
    fn insert(&self, namespace: &Namespace, id: &str, document: Value) -> Result<()>;

    /// Insert or fully replace a document.
    fn upsert(&self, namespace: &Namespace, id: &str, document: Value) -> Result<()>;

    /// Delete a document, returning whether it existed.
    fn delete(&self, namespace: &Namespace, id: &str) -> Result<bool>;
}

/// Durable storage for synchronizer bookkeeping.
///
/// Every method must be durable when it returns.
pub trait MetadataStore: Send + Sync {
    fn instance_id(&self) -> Result<Option<InstanceId>>;
    fn set_instance_id(&self, instance_id: &str) -> Result<()>;

    fn load_metas(&self) -> Result<Vec<DocumentMeta>>;
    fn put_meta(&self, meta: &DocumentMeta) -> Result<()>;
    fn remove_meta(&self, key: &DocumentKey) -> Result<()>;

    fn undo_records(&self) -> Result<Vec<UndoRecord>>;
    fn put_undo(&self, record: &UndoRecord) -> Result<()>;
    fn remove_undo(&self, key: &DocumentKey) -> Result<()>;

    fn resume_token(&self, namespace: &Namespace) -> Result<Option<ResumeToken>>;
    fn set_resume_token(&self, namespace: &Namespace, token: &str) -> Result<()>;
}

fn local_poisoned<T>(_: PoisonError<T>) -> Error {
    Error::LocalStore("lock poisoned".into())
}

fn metadata_poisoned<T>(_: PoisonError<T>) -> Error {
    Error::MetadataStore("lock poisoned".into())
}

/// Documents of one namespace.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    documents: BTreeMap<DocumentId, Value>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.documents.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// [`LocalStore`] backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    collections: RwLock<HashMap<Namespace, Collection>>,
    fail_writes: AtomicBool,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of documents in a namespace.
    pub fn count(&self, namespace: &Namespace) -> usize {
        self.collections
            .read()
            .map(|c| c.get(namespace).map_or(0, Collection::len))
            .unwrap_or(0)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::LocalStore("writes disabled".into()));
        }
        Ok(())
    }
}

impl LocalStore for MemoryLocalStore {
    fn find(&self, namespace: &Namespace, id: &str) -> Result<Option<Value>> {
        let collections = self.collections.read().map_err(local_poisoned)?;
        Ok(collections
            .get(namespace)
            .and_then(|c| c.get(id))
            .cloned())
    }

    fn find_all(&self, namespace: &Namespace) -> Result<Vec<Value>> {
        let collections = self.collections.read().map_err(local_poisoned)?;
        Ok(collections
            .get(namespace)
            .map(|c| c.documents.values().cloned().collect())
            .unwrap_or_default())
    }

    fn insert(&self, namespace: &Namespace, id: &str, document: Value) -> Result<()> {
        self.check_writable()?;
        let mut collections = self.collections.write().map_err(local_poisoned)?;
        let collection = collections.entry(namespace.clone()).or_default();
        if collection.contains(id) {
            return Err(Error::DuplicateKey(id.to_string()));
        }
        collection.documents.insert(id.to_string(), document);
        Ok(())
    }

    fn upsert(&self, namespace: &Namespace, id: &str, document: Value) -> Result<()> {
        self.check_writable()?;
        let mut collections = self.collections.write().map_err(local_poisoned)?;
        collections
            .entry(namespace.clone())
            .or_default()
            .documents
            .insert(id.to_string(), document);
        Ok(())
    }

    fn delete(&self, namespace: &Namespace, id: &str) -> Result<bool> {
        self.check_writable()?;
        let mut collections = self.collections.write().map_err(local_poisoned)?;
        Ok(collections
            .get_mut(namespace)
            .is_some_and(|c| c.documents.remove(id).is_some()))
    }
}

/// [`MetadataStore`] backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    state: RwLock<SyncSnapshot>,
    fail_meta_writes: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot.
    pub fn from_snapshot(snapshot: SyncSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            fail_meta_writes: AtomicBool::new(false),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Result<SyncSnapshot> {
        Ok(self.state.read().map_err(metadata_poisoned)?.clone())
    }

    /// Make `put_meta` and `remove_meta` fail until reset.
    pub fn set_fail_meta_writes(&self, fail: bool) {
        self.fail_meta_writes.store(fail, Ordering::SeqCst);
    }

    fn check_meta_writable(&self) -> Result<()> {
        if self.fail_meta_writes.load(Ordering::SeqCst) {
            return Err(Error::MetadataStore("metadata writes disabled".into()));
        }
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut SyncSnapshot)) -> Result<()> {
        let mut state = self.state.write().map_err(metadata_poisoned)?;
        f(&mut state);
        Ok(())
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn instance_id(&self) -> Result<Option<InstanceId>> {
        Ok(self.state.read().map_err(metadata_poisoned)?.instance_id.clone())
    }

    fn set_instance_id(&self, instance_id: &str) -> Result<()> {
        self.update(|s| s.instance_id = Some(instance_id.to_string()))
    }

    fn load_metas(&self) -> Result<Vec<DocumentMeta>> {
        let state = self.state.read().map_err(metadata_poisoned)?;
        Ok(state.metas().cloned().collect())
    }

    fn put_meta(&self, meta: &DocumentMeta) -> Result<()> {
        self.check_meta_writable()?;
        self.update(|s| s.put_meta(meta.clone()))
    }

    fn remove_meta(&self, key: &DocumentKey) -> Result<()> {
        self.check_meta_writable()?;
        self.update(|s| s.remove_meta(key))
    }

    fn undo_records(&self) -> Result<Vec<UndoRecord>> {
        let state = self.state.read().map_err(metadata_poisoned)?;
        Ok(state.undo_records().cloned().collect())
    }

    fn put_undo(&self, record: &UndoRecord) -> Result<()> {
        self.update(|s| s.put_undo(record.clone()))
    }

    fn remove_undo(&self, key: &DocumentKey) -> Result<()> {
        self.update(|s| s.remove_undo(key))
    }

    fn resume_token(&self, namespace: &Namespace) -> Result<Option<ResumeToken>> {
        let state = self.state.read().map_err(metadata_poisoned)?;
        Ok(state.resume_token(namespace).cloned())
    }

    fn set_resume_token(&self, namespace: &Namespace, token: &str) -> Result<()> {
        self.update(|s| s.set_resume_token(namespace, token.to_string()))
    }
}
