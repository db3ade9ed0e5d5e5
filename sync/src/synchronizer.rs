//! The synchronizer facade.
//!
//! [`Synchronizer`] is what a host application holds: CRUD against the local
//! replica, management of the synced id set, listener registration and
//! lifecycle control. All state lives in [`Shared`], which the scheduler and
//! the sync pass reach through an `Arc`.

use crate::config::SyncConfig;
use crate::dispatch::{ChangeListener, ErrorListener, EventDispatcher};
use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::pass::{SyncPassReport, SyncStats};
use crate::remote::RemoteCollection;
use crate::stream::{ForwardedTokens, InboundBuffer, InboundEvent};
use crate::write_log::PendingWriteLog;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tether_engine::{
    document_id, with_id, ConflictHandler, DocumentId, DocumentKey, DocumentMeta, InstanceId,
    LocalStore, LocalWrite, MetadataStore, Namespace, PendingWrite, UpdateDescription,
};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// State shared by the facade, the scheduler and the stream consumers.
pub(crate) struct Shared {
    pub(crate) config: SyncConfig,
    pub(crate) instance_id: InstanceId,
    pub(crate) log: PendingWriteLog,
    pub(crate) remote: Arc<dyn RemoteCollection>,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) inbound: tokio::sync::Mutex<InboundBuffer>,
    pub(crate) inbound_tx: mpsc::Sender<InboundEvent>,
    pub(crate) watchers: DashMap<Namespace, watch::Sender<Vec<DocumentId>>>,
    pub(crate) forwarded: ForwardedTokens,
    pub(crate) pass_lock: tokio::sync::Mutex<()>,
    pub(crate) stats: Mutex<SyncStats>,
}

/// Offline-first synchronizer between a local replica and a remote collection.
pub struct Synchronizer {
    shared: Arc<Shared>,
}

impl Synchronizer {
    /// Open a synchronizer over the given stores.
    ///
    /// Interrupted local writes from a previous run are rolled back before
    /// this returns. The instance id is taken from the metadata store, then
    /// from the config, and generated otherwise; it is persisted so writes
    /// made before a restart are still recognized as this instance's own.
    pub fn open(
        config: SyncConfig,
        local: Arc<dyn LocalStore>,
        metadata: Arc<dyn MetadataStore>,
        remote: Arc<dyn RemoteCollection>,
    ) -> Result<Self> {
        config.validate()?;

        let instance_id = match metadata.instance_id()? {
            Some(stored) => {
                if let Some(configured) = config.instance_id.as_deref() {
                    if configured != stored {
                        tracing::warn!(
                            configured = %configured,
                            stored = %stored,
                            "Ignoring configured instance id, using persisted one"
                        );
                    }
                }
                stored
            }
            None => {
                let id = config
                    .instance_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                metadata.set_instance_id(&id)?;
                id
            }
        };

        let log = PendingWriteLog::open(local, metadata)?;
        let (inbound_tx, inbound) = mpsc::channel(config.stream_buffer_size);

        tracing::info!(
            instance_id = %instance_id,
            pending = log.pending_count(),
            "Synchronizer opened"
        );

        let shared = Shared {
            config,
            instance_id,
            log,
            remote,
            dispatcher: EventDispatcher::new(),
            lifecycle: Lifecycle::new(),
            inbound: tokio::sync::Mutex::new(InboundBuffer::new(inbound)),
            inbound_tx,
            watchers: DashMap::new(),
            forwarded: ForwardedTokens::default(),
            pass_lock: tokio::sync::Mutex::new(()),
            stats: Mutex::new(SyncStats::default()),
        };
        shared.refresh_watches();

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn set_conflict_handler(
        &self,
        namespace: Namespace,
        handler: impl ConflictHandler + 'static,
    ) {
        self.shared
            .dispatcher
            .set_conflict_handler(namespace, Arc::new(handler));
    }

    pub fn set_change_listener(&self, namespace: Namespace, listener: impl ChangeListener + 'static) {
        self.shared
            .dispatcher
            .set_change_listener(namespace, Arc::new(listener));
    }

    pub fn remove_change_listener(&self, namespace: &Namespace) {
        self.shared.dispatcher.remove_change_listener(namespace);
    }

    pub fn set_error_listener(&self, listener: impl ErrorListener + 'static) {
        self.shared.dispatcher.set_error_listener(Arc::new(listener));
    }

    // ========================================================================
    // Synced id set
    // ========================================================================

    /// Start syncing documents by id. Their remote state is fetched on the next pass.
    pub fn sync_ids<I, S>(&self, namespace: &Namespace, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<DocumentId>,
    {
        let mut added = 0usize;
        for id in ids {
            let key = DocumentKey::new(namespace.clone(), id);
            if self.shared.log.track(&key)? {
                added += 1;
            }
        }
        if added > 0 {
            tracing::info!(namespace = %namespace, added, "Documents added to sync set");
        }
        self.shared.refresh_watch(namespace);
        self.shared.ensure_consumers()
    }

    /// Stop syncing documents and drop their local copies and pending writes.
    pub async fn desync_ids<I, S>(&self, namespace: &Namespace, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<DocumentId>,
    {
        for id in ids {
            let key = DocumentKey::new(namespace.clone(), id);
            let _guard = self.shared.log.lock(&key).await;
            if self.shared.log.is_synced(&key) {
                self.shared.log.desync(&key)?;
                tracing::info!(key = %key, "Document removed from sync set");
            }
        }
        self.shared.refresh_watch(namespace);
        Ok(())
    }

    pub fn synced_ids(&self, namespace: &Namespace) -> Vec<DocumentId> {
        self.shared.log.synced_ids(namespace)
    }

    /// Documents excluded from sync after a failed conflict resolution.
    pub fn paused_ids(&self, namespace: &Namespace) -> Vec<DocumentId> {
        self.shared.log.paused_ids(namespace)
    }

    /// Put a paused document back into sync. Its remote state is refetched
    /// on the next pass. Returns false if the document was not paused.
    pub async fn resume_sync_for_document(&self, namespace: &Namespace, id: &str) -> Result<bool> {
        let key = DocumentKey::new(namespace.clone(), id);
        let _guard = self.shared.log.lock(&key).await;
        if !self.shared.log.meta(&key).is_some_and(|meta| meta.paused) {
            return Ok(false);
        }
        self.shared.log.update_meta(&key, |meta| {
            meta.paused = false;
            meta.stale = true;
            meta.last_error = None;
        })?;
        tracing::info!(key = %key, "Resumed sync for document");
        Ok(true)
    }

    // ========================================================================
    // CRUD
    // ========================================================================

    /// Insert a document and start syncing it. A missing `_id` is generated.
    pub async fn insert_one(&self, namespace: &Namespace, document: Value) -> Result<DocumentId> {
        let id = document_id(&document).unwrap_or_else(|| Uuid::new_v4().to_string());
        let document = with_id(document, &id)?;
        let key = DocumentKey::new(namespace.clone(), id.clone());

        {
            let _guard = self.shared.log.lock(&key).await;
            self.shared.log.enqueue(&key, LocalWrite::insert(document))?;
        }
        tracing::debug!(key = %key, "Inserted document locally");

        self.shared.refresh_watch(namespace);
        self.shared.ensure_consumers()?;
        Ok(id)
    }

    /// Apply field changes to a synced document. Returns false if it does not exist.
    pub async fn update_one(
        &self,
        namespace: &Namespace,
        id: &str,
        update: &UpdateDescription,
    ) -> Result<bool> {
        let key = DocumentKey::new(namespace.clone(), id);
        let _guard = self.shared.log.lock(&key).await;
        let Some(current) = self.synced_document(&key)? else {
            return Ok(false);
        };
        let document = update.apply_to(&current)?;
        self.shared
            .log
            .enqueue(&key, LocalWrite::update(document, update.clone()))?;
        tracing::debug!(key = %key, "Updated document locally");
        Ok(true)
    }

    /// Replace a synced document's body. Returns false if it does not exist.
    pub async fn replace_one(&self, namespace: &Namespace, id: &str, document: Value) -> Result<bool> {
        let key = DocumentKey::new(namespace.clone(), id);
        let document = with_id(document, id)?;
        let _guard = self.shared.log.lock(&key).await;
        if self.synced_document(&key)?.is_none() {
            return Ok(false);
        }
        self.shared.log.enqueue(&key, LocalWrite::replace(document))?;
        tracing::debug!(key = %key, "Replaced document locally");
        Ok(true)
    }

    /// Delete a synced document. Returns false if it does not exist.
    pub async fn delete_one(&self, namespace: &Namespace, id: &str) -> Result<bool> {
        let key = DocumentKey::new(namespace.clone(), id);
        let deleted = {
            let _guard = self.shared.log.lock(&key).await;
            if self.synced_document(&key)?.is_none() {
                return Ok(false);
            }
            self.shared.log.enqueue(&key, LocalWrite::delete())?;
            true
        };
        tracing::debug!(key = %key, "Deleted document locally");
        self.shared.refresh_watch(namespace);
        Ok(deleted)
    }

    fn synced_document(&self, key: &DocumentKey) -> Result<Option<Value>> {
        if !self.shared.log.is_synced(key) {
            return Ok(None);
        }
        self.shared.log.find(key)
    }

    pub fn find_one(&self, namespace: &Namespace, id: &str) -> Result<Option<Value>> {
        self.shared.log.find(&DocumentKey::new(namespace.clone(), id))
    }

    pub fn find_all(&self, namespace: &Namespace) -> Result<Vec<Value>> {
        self.shared.log.find_all(namespace)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the periodic scheduler and the change stream consumers. Idempotent.
    pub fn start(&self) -> Result<()> {
        self.shared.start()
    }

    /// Stop background work and wait for an in-flight pass. Idempotent.
    pub async fn stop(&self) {
        self.shared.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.shared.lifecycle.is_running()
    }

    pub fn set_online(&self, online: bool) -> Result<()> {
        self.shared.set_online(online)
    }

    pub fn set_authenticated(&self, authenticated: bool) -> Result<()> {
        self.shared.set_authenticated(authenticated)
    }

    pub fn is_online(&self) -> bool {
        self.shared.lifecycle.is_online()
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.lifecycle.is_authenticated()
    }

    /// Run one sync pass now.
    pub async fn do_sync_pass(&self) -> SyncPassReport {
        self.shared.run_pass().await
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn pending_write(&self, namespace: &Namespace, id: &str) -> Option<PendingWrite> {
        self.document_meta(namespace, id).and_then(|meta| meta.pending)
    }

    /// Pending writes in push order, excluding paused documents.
    pub fn pending_writes(&self) -> Vec<(DocumentKey, PendingWrite)> {
        self.shared.log.peek_all().collect()
    }

    pub fn document_meta(&self, namespace: &Namespace, id: &str) -> Option<DocumentMeta> {
        self.shared.log.meta(&DocumentKey::new(namespace.clone(), id))
    }

    /// Undo records left behind by interrupted writes. Zero when idle.
    pub fn undo_count(&self) -> Result<usize> {
        self.shared.log.undo_count()
    }

    /// Remote changes received from the change streams but not yet applied.
    /// Items already collected by a running pass are not counted.
    pub fn buffered_changes(&self) -> usize {
        let tx = &self.shared.inbound_tx;
        let queued = tx.max_capacity() - tx.capacity();
        let backlog = self
            .shared
            .inbound
            .try_lock()
            .map_or(0, |inbound| inbound.backlog_len());
        queued + backlog
    }

    pub fn stats(&self) -> SyncStats {
        self.shared
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
