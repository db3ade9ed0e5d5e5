//! Durable pending-write log.
//!
//! Owns the per-document metadata cache and every mutation of local state
//! made on behalf of synchronization. Each mutation that touches the local
//! store is bracketed by an [`UndoRecord`]:
//!
//! 1. persist the undo record (pre-image + prior metadata)
//! 2. mutate the local store
//! 3. persist the new metadata
//! 4. remove the undo record
//!
//! A failure in steps 2-4 rolls back immediately; a crash leaves the undo
//! record behind and [`PendingWriteLog::open`] rolls back on the next start.
//! Callers serialize access per document with [`PendingWriteLog::lock`].

use crate::error::Result;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_engine::{
    coalesce, DocumentId, DocumentKey, DocumentMeta, LocalStore, LocalWrite, MetadataStore,
    Namespace, PendingWrite, ResolutionPlan, Sequence, UndoOperation, UndoRecord, VersionToken,
    WriteKind,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Change to apply to the local store.
#[derive(Debug, Clone, PartialEq)]
enum LocalChange {
    Insert(Value),
    Upsert(Value),
    Delete,
}

pub struct PendingWriteLog {
    local: Arc<dyn LocalStore>,
    metadata: Arc<dyn MetadataStore>,
    metas: DashMap<DocumentKey, DocumentMeta>,
    locks: DashMap<DocumentKey, Arc<Mutex<()>>>,
    /// Documents dropped by [`PendingWriteLog::desync`] and not tracked since
    released: DashSet<DocumentKey>,
    seq: AtomicU64,
}

impl PendingWriteLog {
    /// Roll back interrupted writes, then load all metadata.
    pub fn open(local: Arc<dyn LocalStore>, metadata: Arc<dyn MetadataStore>) -> Result<Self> {
        let log = Self {
            local,
            metadata,
            metas: DashMap::new(),
            locks: DashMap::new(),
            released: DashSet::new(),
            seq: AtomicU64::new(0),
        };

        let recovered = log.recover()?;
        if recovered > 0 {
            tracing::warn!(recovered, "Rolled back interrupted local writes");
        }

        let mut max_seq = 0;
        for meta in log.metadata.load_metas()? {
            if let Some(pending) = &meta.pending {
                max_seq = max_seq.max(pending.seq);
            }
            log.metas.insert(meta.key(), meta);
        }
        log.seq.store(max_seq, Ordering::SeqCst);

        tracing::debug!(documents = log.metas.len(), "Pending write log opened");
        Ok(log)
    }

    fn recover(&self) -> Result<usize> {
        let records = self.metadata.undo_records()?;
        for record in &records {
            let key = record.key();
            match &record.pre_image {
                Some(document) => self.local.upsert(&key.namespace, &key.id, document.clone())?,
                None => {
                    self.local.delete(&key.namespace, &key.id)?;
                }
            }
            match &record.prior_meta {
                Some(meta) => self.metadata.put_meta(meta)?,
                None => self.metadata.remove_meta(&key)?,
            }
            self.metadata.remove_undo(&key)?;
            tracing::info!(key = %key, operation = ?record.operation, "Rolled back interrupted write");
        }
        Ok(records.len())
    }

    /// Exclusive access to one document's state.
    pub async fn lock(&self, key: &DocumentKey) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(key.clone()).or_default().clone();
        lock.lock_owned().await
    }

    pub fn meta(&self, key: &DocumentKey) -> Option<DocumentMeta> {
        self.metas.get(key).map(|m| m.clone())
    }

    pub fn is_synced(&self, key: &DocumentKey) -> bool {
        self.metas.contains_key(key)
    }

    /// Ids of synced documents in a namespace, sorted.
    pub fn synced_ids(&self, namespace: &Namespace) -> Vec<DocumentId> {
        self.ids_where(namespace, |_| true)
    }

    pub fn paused_ids(&self, namespace: &Namespace) -> Vec<DocumentId> {
        self.ids_where(namespace, |meta| meta.paused)
    }

    fn ids_where(&self, namespace: &Namespace, f: impl Fn(&DocumentMeta) -> bool) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self
            .metas
            .iter()
            .filter(|entry| entry.key().namespace == *namespace && f(entry.value()))
            .map(|entry| entry.key().id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        let set: BTreeSet<Namespace> = self.metas.iter().map(|e| e.key().namespace.clone()).collect();
        set.into_iter().collect()
    }

    /// Synced documents whose remote state must be fetched.
    pub fn stale_keys(&self) -> Vec<DocumentKey> {
        let mut keys: Vec<DocumentKey> = self
            .metas
            .iter()
            .filter(|e| e.value().stale && !e.value().paused)
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn pending_count(&self) -> usize {
        self.metas.iter().filter(|e| e.value().pending.is_some()).count()
    }

    pub fn undo_count(&self) -> Result<usize> {
        Ok(self.metadata.undo_records()?.len())
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn find(&self, key: &DocumentKey) -> Result<Option<Value>> {
        Ok(self.local.find(&key.namespace, &key.id)?)
    }

    pub fn find_all(&self, namespace: &Namespace) -> Result<Vec<Value>> {
        Ok(self.local.find_all(namespace)?)
    }

    fn next_seq(&self) -> Sequence {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Pending writes in sequence order, skipping paused documents.
    ///
    /// The order is fixed when called; each item reflects the document's
    /// state at the moment it is yielded.
    pub fn peek_all(&self) -> PendingWrites<'_> {
        let mut order: Vec<(Sequence, DocumentKey)> = self
            .metas
            .iter()
            .filter(|e| e.value().has_pending())
            .filter_map(|e| e.value().pending.as_ref().map(|p| (p.seq, e.key().clone())))
            .collect();
        order.sort();
        PendingWrites {
            log: self,
            order: order.into_iter().map(|(_, key)| key).collect(),
            position: 0,
        }
    }

    /// Record a local write: apply it locally and fold it into the pending write.
    pub fn enqueue(&self, key: &DocumentKey, write: LocalWrite) -> Result<()> {
        let operation = match write.kind {
            WriteKind::Insert => UndoOperation::Insert,
            WriteKind::Update => UndoOperation::Update,
            WriteKind::Delete => UndoOperation::Delete,
        };
        let change = match (&write.document, write.kind) {
            (Some(document), WriteKind::Insert) => LocalChange::Insert(document.clone()),
            (Some(document), _) => LocalChange::Upsert(document.clone()),
            (None, _) => LocalChange::Delete,
        };

        let mut next = self.meta(key).unwrap_or_else(|| DocumentMeta::new(key));
        let baseline = next.version.clone();
        next.pending = coalesce(next.pending.take(), write, baseline, self.next_seq(), Utc::now());
        next.last_error = None;

        // An unsynced insert followed by its delete leaves nothing to track
        let next = match (&next.pending, &next.version) {
            (None, None) => None,
            _ => Some(next),
        };
        self.mutate(key, operation, change, next)
    }

    /// Apply a remote change to a document without pending writes.
    pub fn apply_remote(
        &self,
        key: &DocumentKey,
        document: Option<Value>,
        version: Option<VersionToken>,
    ) -> Result<()> {
        let mut next = self.meta(key).unwrap_or_else(|| DocumentMeta::new(key));
        next.advance_version(version);
        next.pending = None;
        next.stale = false;
        next.last_error = None;

        let change = document.map_or(LocalChange::Delete, LocalChange::Upsert);
        self.mutate(key, UndoOperation::RemoteApply, change, Some(next))
    }

    /// Apply a conflict resolution on top of the remote version it was made against.
    pub fn resolve(
        &self,
        key: &DocumentKey,
        plan: ResolutionPlan,
        remote_version: Option<VersionToken>,
    ) -> Result<()> {
        let mut next = self.meta(key).unwrap_or_else(|| DocumentMeta::new(key));
        next.advance_version(remote_version.clone());
        next.paused = false;
        next.stale = false;
        next.last_error = None;

        let change = match plan {
            ResolutionPlan::AcceptRemote(document) => {
                next.pending = None;
                document.map_or(LocalChange::Delete, LocalChange::Upsert)
            }
            ResolutionPlan::Schedule(write) => {
                let change = write
                    .document
                    .clone()
                    .map_or(LocalChange::Delete, LocalChange::Upsert);
                next.pending = Some(PendingWrite::new(
                    write,
                    remote_version,
                    self.next_seq(),
                    Utc::now(),
                ));
                change
            }
        };
        self.mutate(key, UndoOperation::Resolution, change, Some(next))
    }

    /// Stop syncing a document and drop its local copy.
    ///
    /// A push already in flight for the document is left on the remote.
    pub fn desync(&self, key: &DocumentKey) -> Result<()> {
        self.mutate(key, UndoOperation::Desync, LocalChange::Delete, None)?;
        self.released.insert(key.clone());
        Ok(())
    }

    /// Start syncing a document. Its remote state is fetched on the next pass.
    pub fn track(&self, key: &DocumentKey) -> Result<bool> {
        if self.is_synced(key) {
            return Ok(false);
        }
        let mut meta = DocumentMeta::new(key);
        meta.stale = true;
        self.metadata.put_meta(&meta)?;
        self.metas.insert(key.clone(), meta);
        self.released.remove(key);
        Ok(true)
    }

    /// Change metadata only. Returns false if the document is not synced.
    pub fn update_meta(&self, key: &DocumentKey, f: impl FnOnce(&mut DocumentMeta)) -> Result<bool> {
        let Some(mut meta) = self.meta(key) else {
            return Ok(false);
        };
        f(&mut meta);
        self.metadata.put_meta(&meta)?;
        self.metas.insert(key.clone(), meta);
        Ok(true)
    }

    /// Record that the remote accepted the pending write with sequence `seq`.
    ///
    /// If newer local writes were coalesced while the write was in flight,
    /// they stay pending on top of the confirmed version. Returns false when
    /// the document is no longer synced.
    pub fn confirm(
        &self,
        key: &DocumentKey,
        seq: Sequence,
        kind: WriteKind,
        version: Option<VersionToken>,
    ) -> Result<bool> {
        let Some(mut meta) = self.meta(key) else {
            if self.released.remove(key).is_some() {
                tracing::debug!(key = %key, "Write confirmed after desync, keeping remote copy");
                return Ok(false);
            }
            // The write was cancelled locally while in flight; undo it remotely
            if kind != WriteKind::Delete {
                let mut meta = DocumentMeta::new(key);
                meta.advance_version(version.clone());
                meta.pending = Some(PendingWrite::new(
                    LocalWrite::delete(),
                    version,
                    self.next_seq(),
                    Utc::now(),
                ));
                self.metadata.put_meta(&meta)?;
                self.metas.insert(key.clone(), meta);
            }
            return Ok(false);
        };

        let confirmed = if kind == WriteKind::Delete { None } else { version };
        meta.advance_version(confirmed);
        meta.last_error = None;

        let same_write = meta.pending.as_ref().is_some_and(|p| p.seq == seq);
        if same_write {
            meta.pending = None;
            if kind == WriteKind::Delete {
                self.metadata.remove_meta(key)?;
                self.metas.remove(key);
                return Ok(true);
            }
        } else if let Some(pending) = meta.pending.as_mut() {
            // The remote now holds our write, so the newer one must match it
            match (kind, pending.kind) {
                (WriteKind::Delete, WriteKind::Update) => pending.kind = WriteKind::Insert,
                (WriteKind::Insert | WriteKind::Update, WriteKind::Insert) => {
                    pending.kind = WriteKind::Update
                }
                _ => {}
            }
        }

        self.metadata.put_meta(&meta)?;
        self.metas.insert(key.clone(), meta);
        Ok(true)
    }

    fn mutate(
        &self,
        key: &DocumentKey,
        operation: UndoOperation,
        change: LocalChange,
        next: Option<DocumentMeta>,
    ) -> Result<()> {
        let record = UndoRecord {
            namespace: key.namespace.clone(),
            document_id: key.id.clone(),
            operation,
            pre_image: self.local.find(&key.namespace, &key.id)?,
            prior_meta: self.meta(key),
            recorded_at: Utc::now(),
        };
        self.metadata.put_undo(&record)?;

        let applied = self
            .apply_change(key, change)
            .and_then(|()| self.persist_meta(key, next.as_ref()));
        if let Err(err) = applied {
            self.rollback(&record);
            return Err(err);
        }

        match next {
            Some(meta) => {
                self.metas.insert(key.clone(), meta);
                self.released.remove(key);
            }
            None => {
                self.metas.remove(key);
            }
        }

        if let Err(err) = self.metadata.remove_undo(key) {
            self.rollback(&record);
            return Err(err.into());
        }
        Ok(())
    }

    fn apply_change(&self, key: &DocumentKey, change: LocalChange) -> Result<()> {
        match change {
            LocalChange::Insert(document) => self.local.insert(&key.namespace, &key.id, document)?,
            LocalChange::Upsert(document) => self.local.upsert(&key.namespace, &key.id, document)?,
            LocalChange::Delete => {
                self.local.delete(&key.namespace, &key.id)?;
            }
        }
        Ok(())
    }

    fn persist_meta(&self, key: &DocumentKey, meta: Option<&DocumentMeta>) -> Result<()> {
        match meta {
            Some(meta) => self.metadata.put_meta(meta)?,
            None => self.metadata.remove_meta(key)?,
        }
        Ok(())
    }

    /// Restore the state captured in `record`. Failures leave the record in
    /// place for startup recovery.
    fn rollback(&self, record: &UndoRecord) {
        let key = record.key();
        let change = record
            .pre_image
            .clone()
            .map_or(LocalChange::Delete, LocalChange::Upsert);

        let restored = self
            .apply_change(&key, change)
            .and_then(|()| self.persist_meta(&key, record.prior_meta.as_ref()))
            .and_then(|()| Ok(self.metadata.remove_undo(&key)?));

        match &record.prior_meta {
            Some(meta) => {
                self.metas.insert(key.clone(), meta.clone());
            }
            None => {
                self.metas.remove(&key);
            }
        }

        match restored {
            Ok(()) => tracing::warn!(key = %key, operation = ?record.operation, "Local write rolled back"),
            Err(err) => tracing::error!(
                key = %key,
                error = %err,
                "Rollback incomplete, deferring to startup recovery"
            ),
        }
    }
}

/// Iterator returned by [`PendingWriteLog::peek_all`].
pub struct PendingWrites<'a> {
    log: &'a PendingWriteLog,
    order: Vec<DocumentKey>,
    position: usize,
}

impl PendingWrites<'_> {
    /// Go back to the first write.
    pub fn restart(&mut self) {
        self.position = 0;
    }
}

impl Iterator for PendingWrites<'_> {
    type Item = (DocumentKey, PendingWrite);

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.order.len() {
            let key = &self.order[self.position];
            self.position += 1;
            if let Some(meta) = self.log.metas.get(key) {
                if let (Some(pending), false) = (&meta.pending, meta.paused) {
                    return Some((key.clone(), pending.clone()));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use serde_json::json;
    use tether_engine::{MemoryLocalStore, MemoryMetadataStore, UpdateDescription};

    struct Fixture {
        local: Arc<MemoryLocalStore>,
        metadata: Arc<MemoryMetadataStore>,
        log: PendingWriteLog,
    }

    fn fixture() -> Fixture {
        let local = Arc::new(MemoryLocalStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let log = PendingWriteLog::open(local.clone(), metadata.clone()).unwrap();
        Fixture {
            local,
            metadata,
            log,
        }
    }

    fn key(id: &str) -> DocumentKey {
        DocumentKey::new(Namespace::new("app", "todos"), id)
    }

    #[test]
    fn enqueue_applies_locally_and_records_pending() {
        let f = fixture();
        f.log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1"})))
            .unwrap();

        assert_eq!(f.log.find(&key("1")).unwrap(), Some(json!({"_id": "1"})));
        let meta = f.log.meta(&key("1")).unwrap();
        assert_eq!(meta.pending.unwrap().kind, WriteKind::Insert);
        assert_eq!(f.log.undo_count().unwrap(), 0);
        assert_eq!(f.metadata.load_metas().unwrap().len(), 1);
    }

    #[test]
    fn insert_then_delete_untracks_document() {
        let f = fixture();
        f.log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1"})))
            .unwrap();
        f.log.enqueue(&key("1"), LocalWrite::delete()).unwrap();

        assert!(!f.log.is_synced(&key("1")));
        assert!(f.log.find(&key("1")).unwrap().is_none());
        assert!(f.metadata.load_metas().unwrap().is_empty());
    }

    #[test]
    fn peek_all_orders_by_sequence_and_skips_paused() {
        let f = fixture();
        for id in ["c", "a", "b"] {
            f.log
                .enqueue(&key(id), LocalWrite::insert(json!({"_id": id})))
                .unwrap();
        }
        f.log.update_meta(&key("a"), |m| m.paused = true).unwrap();

        let mut writes = f.log.peek_all();
        let ids: Vec<String> = writes.by_ref().map(|(k, _)| k.id).collect();
        assert_eq!(ids, vec!["c".to_string(), "b".to_string()]);

        writes.restart();
        assert_eq!(writes.count(), 2);
    }

    #[test]
    fn peek_all_reflects_later_clears() {
        let f = fixture();
        f.log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1"})))
            .unwrap();
        let mut writes = f.log.peek_all();
        let (_, pending) = f.log.peek_all().next().unwrap();
        f.log
            .confirm(&key("1"), pending.seq, WriteKind::Insert, Some(VersionToken::initial("me")))
            .unwrap();
        assert!(writes.next().is_none());
    }

    #[test]
    fn local_store_failure_rolls_back() {
        let f = fixture();
        f.local.set_fail_writes(true);
        let err = f
            .log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1"})))
            .unwrap_err();

        assert!(matches!(err, SyncError::LocalStore(_)));
        assert!(!f.log.is_synced(&key("1")));
        assert_eq!(f.log.undo_count().unwrap(), 0);
    }

    #[test]
    fn metadata_failure_restores_pre_image() {
        let f = fixture();
        f.log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1", "v": 1})))
            .unwrap();

        f.metadata.set_fail_meta_writes(true);
        let result = f.log.enqueue(
            &key("1"),
            LocalWrite::update(
                json!({"_id": "1", "v": 2}),
                UpdateDescription::new().set("v", json!(2)),
            ),
        );
        f.metadata.set_fail_meta_writes(false);

        assert!(result.is_err());
        assert_eq!(f.log.find(&key("1")).unwrap(), Some(json!({"_id": "1", "v": 1})));
        assert_eq!(
            f.log.meta(&key("1")).unwrap().pending.unwrap().kind,
            WriteKind::Insert
        );

        // Prior metadata could not be rewritten, so recovery finishes the job
        assert_eq!(f.log.undo_count().unwrap(), 1);
        let reopened = PendingWriteLog::open(f.local.clone(), f.metadata.clone()).unwrap();
        assert_eq!(reopened.undo_count().unwrap(), 0);
        assert_eq!(
            reopened.find(&key("1")).unwrap(),
            Some(json!({"_id": "1", "v": 1}))
        );
    }

    #[test]
    fn open_rolls_back_leftover_undo_records() {
        let f = fixture();
        f.log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1", "v": 1})))
            .unwrap();
        let prior = f.log.meta(&key("1"));

        // Simulate a crash between mutating and committing
        f.metadata
            .put_undo(&UndoRecord {
                namespace: key("1").namespace,
                document_id: "1".into(),
                operation: UndoOperation::Update,
                pre_image: Some(json!({"_id": "1", "v": 1})),
                prior_meta: prior.clone(),
                recorded_at: Utc::now(),
            })
            .unwrap();
        f.local
            .upsert(&key("1").namespace, "1", json!({"_id": "1", "v": 99}))
            .unwrap();

        let reopened = PendingWriteLog::open(f.local.clone(), f.metadata.clone()).unwrap();
        assert_eq!(reopened.undo_count().unwrap(), 0);
        assert_eq!(
            reopened.find(&key("1")).unwrap(),
            Some(json!({"_id": "1", "v": 1}))
        );
        assert_eq!(reopened.meta(&key("1")), prior);
    }

    #[test]
    fn reopen_continues_sequence() {
        let f = fixture();
        f.log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1"})))
            .unwrap();
        f.log
            .enqueue(&key("2"), LocalWrite::insert(json!({"_id": "2"})))
            .unwrap();

        let reopened = PendingWriteLog::open(f.local.clone(), f.metadata.clone()).unwrap();
        reopened
            .enqueue(&key("3"), LocalWrite::insert(json!({"_id": "3"})))
            .unwrap();
        let seq = reopened.meta(&key("3")).unwrap().pending.unwrap().seq;
        assert_eq!(seq, 3);
    }

    #[test]
    fn confirm_with_newer_write_keeps_it_pending() {
        let f = fixture();
        f.log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1", "v": 1})))
            .unwrap();
        let first = f.log.meta(&key("1")).unwrap().pending.unwrap();
        f.log
            .enqueue(&key("1"), LocalWrite::replace(json!({"_id": "1", "v": 2})))
            .unwrap();

        let version = VersionToken::initial("me");
        f.log
            .confirm(&key("1"), first.seq, WriteKind::Insert, Some(version.clone()))
            .unwrap();

        let meta = f.log.meta(&key("1")).unwrap();
        assert_eq!(meta.version, Some(version));
        let pending = meta.pending.unwrap();
        assert_eq!(pending.kind, WriteKind::Update);
        assert_eq!(pending.document, Some(json!({"_id": "1", "v": 2})));
    }

    #[test]
    fn confirm_after_local_cancel_schedules_remote_delete() {
        let f = fixture();
        f.log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1"})))
            .unwrap();
        let first = f.log.meta(&key("1")).unwrap().pending.unwrap();
        f.log.enqueue(&key("1"), LocalWrite::delete()).unwrap();

        let version = VersionToken::initial("me");
        f.log
            .confirm(&key("1"), first.seq, WriteKind::Insert, Some(version.clone()))
            .unwrap();

        let meta = f.log.meta(&key("1")).unwrap();
        assert_eq!(meta.version, Some(version));
        assert_eq!(meta.pending.unwrap().kind, WriteKind::Delete);
    }

    #[test]
    fn confirm_after_desync_keeps_remote_copy() {
        let f = fixture();
        f.log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1"})))
            .unwrap();
        let first = f.log.meta(&key("1")).unwrap().pending.unwrap();
        f.log.desync(&key("1")).unwrap();

        let synced = f
            .log
            .confirm(&key("1"), first.seq, WriteKind::Insert, Some(VersionToken::initial("me")))
            .unwrap();
        assert!(!synced);
        assert!(!f.log.is_synced(&key("1")));
        assert!(f.metadata.load_metas().unwrap().is_empty());
    }

    #[test]
    fn retracked_document_cancels_in_flight_insert_again() {
        let f = fixture();
        f.log.track(&key("1")).unwrap();
        f.log.desync(&key("1")).unwrap();

        f.log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1"})))
            .unwrap();
        let first = f.log.meta(&key("1")).unwrap().pending.unwrap();
        f.log.enqueue(&key("1"), LocalWrite::delete()).unwrap();
        assert!(!f.log.is_synced(&key("1")));

        f.log
            .confirm(&key("1"), first.seq, WriteKind::Insert, Some(VersionToken::initial("me")))
            .unwrap();
        let pending = f.log.meta(&key("1")).unwrap().pending.unwrap();
        assert_eq!(pending.kind, WriteKind::Delete);
    }

    #[test]
    fn confirmed_delete_untracks_document() {
        let f = fixture();
        f.log.track(&key("1")).unwrap();
        f.log
            .apply_remote(&key("1"), Some(json!({"_id": "1"})), Some(VersionToken::initial("r")))
            .unwrap();
        f.log.enqueue(&key("1"), LocalWrite::delete()).unwrap();
        let pending = f.log.meta(&key("1")).unwrap().pending.unwrap();

        f.log
            .confirm(&key("1"), pending.seq, WriteKind::Delete, None)
            .unwrap();
        assert!(!f.log.is_synced(&key("1")));
    }

    #[test]
    fn track_marks_stale_once() {
        let f = fixture();
        assert!(f.log.track(&key("1")).unwrap());
        assert!(!f.log.track(&key("1")).unwrap());
        assert_eq!(f.log.stale_keys(), vec![key("1")]);
        assert_eq!(f.log.synced_ids(&key("1").namespace), vec!["1".to_string()]);
    }

    #[test]
    fn resolve_schedules_write_on_remote_version() {
        let f = fixture();
        f.log
            .enqueue(&key("1"), LocalWrite::insert(json!({"_id": "1"})))
            .unwrap();
        let remote = Some(VersionToken::new("other", 4));
        f.log
            .resolve(
                &key("1"),
                ResolutionPlan::Schedule(LocalWrite::replace(json!({"_id": "1", "merged": true}))),
                remote.clone(),
            )
            .unwrap();

        let meta = f.log.meta(&key("1")).unwrap();
        assert_eq!(meta.version, remote);
        let pending = meta.pending.unwrap();
        assert_eq!(pending.baseline, remote);
        assert_eq!(pending.kind, WriteKind::Update);
        assert_eq!(
            f.log.find(&key("1")).unwrap(),
            Some(json!({"_id": "1", "merged": true}))
        );
    }

    #[tokio::test]
    async fn lock_serializes_per_document() {
        let f = fixture();
        let guard = f.log.lock(&key("1")).await;
        // A different document is not blocked
        let _other = f.log.lock(&key("2")).await;
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            f.log.lock(&key("1")),
        )
        .await;
        assert!(blocked.is_err());
        drop(guard);
        let _again = f.log.lock(&key("1")).await;
    }
}
