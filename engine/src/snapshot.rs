//! Snapshot of synchronizer metadata.
//!
//! A [`SyncSnapshot`] holds everything a metadata store persists: the
//! instance id, per-document metadata, undo records and resume tokens. Uses
//! BTreeMap so serialization order is deterministic.

use crate::{
    error::Result, DocumentId, DocumentKey, DocumentMeta, Error, InstanceId, Namespace,
    ResumeToken, UndoRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub format_version: u32,
    /// Persisted id of the synchronizer instance owning this state
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    /// Metadata keyed by namespace (`db.coll`), then document id
    #[serde(default)]
    pub documents: BTreeMap<String, BTreeMap<DocumentId, DocumentMeta>>,
    /// Outstanding undo records, same keying as `documents`
    #[serde(default)]
    pub undo: BTreeMap<String, BTreeMap<DocumentId, UndoRecord>>,
    /// Last applied resume token per namespace
    #[serde(default)]
    pub resume_tokens: BTreeMap<String, ResumeToken>,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncSnapshot {
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            instance_id: None,
            documents: BTreeMap::new(),
            undo: BTreeMap::new(),
            resume_tokens: BTreeMap::new(),
        }
    }

    pub fn metas(&self) -> impl Iterator<Item = &DocumentMeta> {
        self.documents.values().flat_map(|docs| docs.values())
    }

    pub fn get_meta(&self, key: &DocumentKey) -> Option<&DocumentMeta> {
        self.documents.get(&key.namespace.to_string())?.get(&key.id)
    }

    pub fn put_meta(&mut self, meta: DocumentMeta) {
        self.documents
            .entry(meta.namespace.to_string())
            .or_default()
            .insert(meta.document_id.clone(), meta);
    }

    pub fn remove_meta(&mut self, key: &DocumentKey) {
        let ns = key.namespace.to_string();
        if let Some(docs) = self.documents.get_mut(&ns) {
            docs.remove(&key.id);
            if docs.is_empty() {
                self.documents.remove(&ns);
            }
        }
    }

    pub fn undo_records(&self) -> impl Iterator<Item = &UndoRecord> {
        self.undo.values().flat_map(|records| records.values())
    }

    pub fn put_undo(&mut self, record: UndoRecord) {
        self.undo
            .entry(record.namespace.to_string())
            .or_default()
            .insert(record.document_id.clone(), record);
    }

    pub fn remove_undo(&mut self, key: &DocumentKey) {
        let ns = key.namespace.to_string();
        if let Some(records) = self.undo.get_mut(&ns) {
            records.remove(&key.id);
            if records.is_empty() {
                self.undo.remove(&ns);
            }
        }
    }

    pub fn resume_token(&self, namespace: &Namespace) -> Option<&ResumeToken> {
        self.resume_tokens.get(&namespace.to_string())
    }

    pub fn set_resume_token(&mut self, namespace: &Namespace, token: ResumeToken) {
        self.resume_tokens.insert(namespace.to_string(), token);
    }

    /// Count synced documents across all namespaces.
    pub fn document_count(&self) -> usize {
        self.documents.values().map(|docs| docs.len()).sum()
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
