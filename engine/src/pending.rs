//! Pending writes and coalescing.
//!
//! Each synchronized document carries at most one [`PendingWrite`]: the net
//! effect of every local mutation not yet confirmed by the remote. New local
//! writes are folded into it with [`coalesce`].

use crate::{ChangeEvent, DocumentKey, Sequence, UpdateDescription, VersionToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Net kind of a pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

/// A single local mutation, before it is folded into the pending write.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalWrite {
    pub kind: WriteKind,
    /// Document state after the mutation; `None` for deletes
    pub document: Option<Value>,
    /// Field-level description; `None` for full replacements
    pub update_description: Option<UpdateDescription>,
}

impl LocalWrite {
    pub fn insert(document: Value) -> Self {
        Self {
            kind: WriteKind::Insert,
            document: Some(document),
            update_description: None,
        }
    }

    pub fn update(document: Value, description: UpdateDescription) -> Self {
        Self {
            kind: WriteKind::Update,
            document: Some(document),
            update_description: Some(description),
        }
    }

    pub fn replace(document: Value) -> Self {
        Self {
            kind: WriteKind::Update,
            document: Some(document),
            update_description: None,
        }
    }

    pub fn delete() -> Self {
        Self {
            kind: WriteKind::Delete,
            document: None,
            update_description: None,
        }
    }
}

/// A local change not yet confirmed by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
    pub kind: WriteKind,
    #[serde(default)]
    pub document: Option<Value>,
    #[serde(default)]
    pub update_description: Option<UpdateDescription>,
    /// Remote version the first coalesced write was based on
    pub baseline: Option<VersionToken>,
    /// Ordering key; bumped on every coalesce
    pub seq: Sequence,
    pub created_at: DateTime<Utc>,
}

impl PendingWrite {
    pub fn new(
        write: LocalWrite,
        baseline: Option<VersionToken>,
        seq: Sequence,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: write.kind,
            document: write.document,
            update_description: write.update_description,
            baseline,
            seq,
            created_at,
        }
    }

    /// Describe this write as an uncommitted local change.
    pub fn to_change_event(&self, key: &DocumentKey) -> ChangeEvent {
        self.event_for(key).with_uncommitted_writes(true)
    }

    /// Describe this write as confirmed by the remote at `version`.
    pub fn to_confirmed_event(
        &self,
        key: &DocumentKey,
        version: Option<VersionToken>,
    ) -> ChangeEvent {
        self.event_for(key).with_version(version)
    }

    fn event_for(&self, key: &DocumentKey) -> ChangeEvent {
        let namespace = key.namespace.clone();
        let id = key.id.clone();
        let document = self.document.clone().unwrap_or(Value::Null);
        match (self.kind, &self.update_description) {
            (WriteKind::Insert, _) => ChangeEvent::insert(namespace, id, document),
            (WriteKind::Update, Some(description)) => {
                ChangeEvent::update(namespace, id, document, description.clone())
            }
            (WriteKind::Update, None) => ChangeEvent::replace(namespace, id, document),
            (WriteKind::Delete, _) => ChangeEvent::delete(namespace, id),
        }
    }
}

/// Fold `write` into the existing pending write for a document.
///
/// Returns `None` when the writes cancel out (an unsynced insert followed by
/// a delete). The result keeps the existing baseline and creation time and
/// takes the new sequence number. `baseline` is only used when there is no
/// existing pending write.
pub fn coalesce(
    existing: Option<PendingWrite>,
    write: LocalWrite,
    baseline: Option<VersionToken>,
    seq: Sequence,
    now: DateTime<Utc>,
) -> Option<PendingWrite> {
    let Some(existing) = existing else {
        return Some(PendingWrite::new(write, baseline, seq, now));
    };

    let (kind, update_description) = match (existing.kind, write.kind) {
        (WriteKind::Insert, WriteKind::Delete) => return None,
        (WriteKind::Insert, WriteKind::Insert | WriteKind::Update) => (WriteKind::Insert, None),
        (WriteKind::Update, WriteKind::Update) => {
            let merged = match (existing.update_description, write.update_description) {
                (Some(mut earlier), Some(later)) => {
                    earlier.merge(&later);
                    Some(earlier)
                }
                _ => None,
            };
            (WriteKind::Update, merged)
        }
        (WriteKind::Update | WriteKind::Delete, WriteKind::Insert)
        | (WriteKind::Delete, WriteKind::Update) => (WriteKind::Update, None),
        (WriteKind::Update | WriteKind::Delete, WriteKind::Delete) => (WriteKind::Delete, None),
    };

    Some(PendingWrite {
        kind,
        document: write.document,
        update_description,
        baseline: existing.baseline,
        seq,
        created_at: existing.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Namespace, OperationType};
    use serde_json::json;

    fn base() -> Option<VersionToken> {
        Some(VersionToken::new("remote", 3))
    }

    fn pending(write: LocalWrite, seq: Sequence) -> PendingWrite {
        PendingWrite::new(write, base(), seq, Utc::now())
    }

    #[test]
    fn first_write_becomes_pending() {
        let result = coalesce(None, LocalWrite::insert(json!({"a": 1})), None, 1, Utc::now());
        let result = result.unwrap();
        assert_eq!(result.kind, WriteKind::Insert);
        assert_eq!(result.baseline, None);
        assert_eq!(result.seq, 1);
    }

    #[test]
    fn insert_then_update_stays_insert() {
        let existing = pending(LocalWrite::insert(json!({"a": 1})), 1);
        let update = LocalWrite::update(json!({"a": 2}), UpdateDescription::new().set("a", json!(2)));
        let result = coalesce(Some(existing), update, None, 2, Utc::now()).unwrap();

        assert_eq!(result.kind, WriteKind::Insert);
        assert_eq!(result.document, Some(json!({"a": 2})));
        assert!(result.update_description.is_none());
        assert_eq!(result.seq, 2);
    }

    #[test]
    fn insert_then_delete_cancels() {
        let existing = pending(LocalWrite::insert(json!({"a": 1})), 1);
        assert!(coalesce(Some(existing), LocalWrite::delete(), None, 2, Utc::now()).is_none());
    }

    #[test]
    fn update_then_update_merges_descriptions() {
        let existing = pending(
            LocalWrite::update(json!({"a": 1}), UpdateDescription::new().set("a", json!(1))),
            1,
        );
        let later = LocalWrite::update(
            json!({"a": 1, "b": 2}),
            UpdateDescription::new().set("b", json!(2)),
        );
        let result = coalesce(Some(existing), later, None, 2, Utc::now()).unwrap();

        assert_eq!(result.kind, WriteKind::Update);
        let description = result.update_description.unwrap();
        assert_eq!(description.updated_fields.len(), 2);
        assert_eq!(result.baseline, base());
    }

    #[test]
    fn update_then_replace_drops_description() {
        let existing = pending(
            LocalWrite::update(json!({"a": 1}), UpdateDescription::new().set("a", json!(1))),
            1,
        );
        let result =
            coalesce(Some(existing), LocalWrite::replace(json!({"z": 0})), None, 2, Utc::now())
                .unwrap();
        assert_eq!(result.kind, WriteKind::Update);
        assert!(result.update_description.is_none());
    }

    #[test]
    fn anything_then_delete_is_delete() {
        let existing = pending(LocalWrite::replace(json!({"a": 1})), 1);
        let result = coalesce(Some(existing), LocalWrite::delete(), None, 2, Utc::now()).unwrap();
        assert_eq!(result.kind, WriteKind::Delete);
        assert!(result.document.is_none());
    }

    #[test]
    fn delete_then_insert_is_update() {
        let existing = pending(LocalWrite::delete(), 1);
        let result =
            coalesce(Some(existing), LocalWrite::insert(json!({"a": 9})), None, 2, Utc::now())
                .unwrap();
        assert_eq!(result.kind, WriteKind::Update);
        assert_eq!(result.document, Some(json!({"a": 9})));
        assert_eq!(result.baseline, base());
    }

    #[test]
    fn coalesce_keeps_original_baseline() {
        let existing = pending(LocalWrite::replace(json!({"a": 1})), 1);
        let other = Some(VersionToken::new("x", 99));
        let result =
            coalesce(Some(existing), LocalWrite::replace(json!({"a": 2})), other, 2, Utc::now())
                .unwrap();
        assert_eq!(result.baseline, base());
    }

    #[test]
    fn change_events_reflect_kind() {
        let key = DocumentKey::new(Namespace::new("db", "c"), "1");

        let update = pending(
            LocalWrite::update(json!({"a": 1}), UpdateDescription::new().set("a", json!(1))),
            1,
        );
        let event = update.to_change_event(&key);
        assert_eq!(event.operation_type, OperationType::Update);
        assert!(event.has_uncommitted_writes);

        let replace = pending(LocalWrite::replace(json!({"a": 1})), 1);
        assert_eq!(
            replace.to_change_event(&key).operation_type,
            OperationType::Replace
        );

        let delete = pending(LocalWrite::delete(), 1);
        let confirmed = delete.to_confirmed_event(&key, None);
        assert_eq!(confirmed.operation_type, OperationType::Delete);
        assert!(!confirmed.has_uncommitted_writes);
    }
}
