//! Per-document synchronization metadata and undo records.

use crate::{
    conflict::VersionContext, DocumentId, DocumentKey, Namespace, PendingWrite, VersionToken,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Synchronization state of one document.
///
/// A document with metadata is "synced": its id is watched on the remote and
/// its local changes are pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    pub namespace: Namespace,
    pub document_id: DocumentId,
    /// Last remote version confirmed for the document (the baseline)
    #[serde(default)]
    pub version: Option<VersionToken>,
    /// Baseline before the most recent advance
    #[serde(default)]
    pub previous_version: Option<VersionToken>,
    #[serde(default)]
    pub pending: Option<PendingWrite>,
    /// Excluded from sync until explicitly resumed
    #[serde(default)]
    pub paused: bool,
    /// Remote state must be fetched before stream events are trusted
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl DocumentMeta {
    pub fn new(key: &DocumentKey) -> Self {
        Self {
            namespace: key.namespace.clone(),
            document_id: key.id.clone(),
            version: None,
            previous_version: None,
            pending: None,
            paused: false,
            stale: false,
            last_error: None,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.namespace.clone(), self.document_id.clone())
    }

    /// Move the baseline to `version`, remembering the old one.
    ///
    /// Losing the baseline (the remote copy is gone) also forgets the
    /// previous version: a later re-insert starts a new document lifetime
    /// whose tokens may repeat the old ones.
    pub fn advance_version(&mut self, version: Option<VersionToken>) {
        if self.version == version {
            return;
        }
        if version.is_none() {
            self.version = None;
            self.previous_version = None;
        } else {
            self.previous_version = std::mem::replace(&mut self.version, version);
        }
    }

    /// Whether a pending write is waiting to be pushed.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some() && !self.paused
    }

    pub fn version_context<'a>(&'a self, instance_id: &'a str) -> VersionContext<'a> {
        VersionContext {
            baseline: self.version.as_ref(),
            previous: self.previous_version.as_ref(),
            instance_id,
        }
    }
}

/// Local mutation an [`UndoRecord`] protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UndoOperation {
    Insert,
    Update,
    Delete,
    RemoteApply,
    Resolution,
    Desync,
}

/// Pre-image of a document captured before a local mutation.
///
/// Persisted before the mutation and removed once the mutation and its
/// metadata are both durable. Any record found at startup means the process
/// died in between, and the document is rolled back to this state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRecord {
    pub namespace: Namespace,
    pub document_id: DocumentId,
    pub operation: UndoOperation,
    /// Local document before the mutation; `None` if it did not exist
    #[serde(default)]
    pub pre_image: Option<Value>,
    /// Metadata before the mutation; `None` if the document was not synced
    #[serde(default)]
    pub prior_meta: Option<DocumentMeta>,
    pub recorded_at: DateTime<Utc>,
}

impl UndoRecord {
    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.namespace.clone(), self.document_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::new(Namespace::new("db", "coll"), "doc-1")
    }

    #[test]
    fn new_meta_is_clean() {
        let meta = DocumentMeta::new(&key());
        assert_eq!(meta.key(), key());
        assert!(meta.version.is_none());
        assert!(!meta.has_pending());
        assert!(!meta.paused);
        assert!(!meta.stale);
    }

    #[test]
    fn advance_version_tracks_previous() {
        let mut meta = DocumentMeta::new(&key());
        meta.advance_version(Some(VersionToken::new("a", 0)));
        assert_eq!(meta.previous_version, None);

        meta.advance_version(Some(VersionToken::new("a", 1)));
        assert_eq!(meta.version, Some(VersionToken::new("a", 1)));
        assert_eq!(meta.previous_version, Some(VersionToken::new("a", 0)));

        // Re-advancing to the same version keeps history intact
        meta.advance_version(Some(VersionToken::new("a", 1)));
        assert_eq!(meta.previous_version, Some(VersionToken::new("a", 0)));
    }

    #[test]
    fn losing_the_baseline_forgets_history() {
        let mut meta = DocumentMeta::new(&key());
        meta.advance_version(Some(VersionToken::new("a", 0)));
        meta.advance_version(Some(VersionToken::new("a", 1)));

        meta.advance_version(None);
        assert_eq!(meta.version, None);
        assert_eq!(meta.previous_version, None);
    }

    #[test]
    fn paused_meta_has_no_pushable_write() {
        use crate::{LocalWrite, PendingWrite};
        let mut meta = DocumentMeta::new(&key());
        meta.pending = Some(PendingWrite::new(LocalWrite::delete(), None, 1, Utc::now()));
        assert!(meta.has_pending());
        meta.paused = true;
        assert!(!meta.has_pending());
    }

    #[test]
    fn serialization_format() {
        let meta = DocumentMeta::new(&key());
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("documentId"));
        assert!(json.contains("previousVersion"));
        assert!(json.contains("lastError"));
    }
}
