//! Change events.
//!
//! A [`ChangeEvent`] describes one mutation of one document. Remote change
//! streams deliver them, the synchronizer emits them to listeners, and the
//! conflict handler receives a pair of them (local and remote).

use crate::{
    error::Result, DocumentId, DocumentKey, Error, Namespace, UpdateDescription, VersionToken,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of mutation a [`ChangeEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    /// Anything the stream delivered that this engine does not understand
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub operation_type: OperationType,
    #[serde(rename = "ns")]
    pub namespace: Namespace,
    pub document_key: DocumentId,
    /// Document state after the change; absent for deletes
    #[serde(default)]
    pub full_document: Option<Value>,
    #[serde(default)]
    pub update_description: Option<UpdateDescription>,
    /// Remote version the change produced
    #[serde(default)]
    pub version: Option<VersionToken>,
    /// True when the change exists locally but has not reached the remote
    #[serde(default)]
    pub has_uncommitted_writes: bool,
}

impl ChangeEvent {
    fn new(
        operation_type: OperationType,
        namespace: Namespace,
        document_key: impl Into<DocumentId>,
    ) -> Self {
        Self {
            operation_type,
            namespace,
            document_key: document_key.into(),
            full_document: None,
            update_description: None,
            version: None,
            has_uncommitted_writes: false,
        }
    }

    pub fn insert(namespace: Namespace, id: impl Into<DocumentId>, document: Value) -> Self {
        let mut event = Self::new(OperationType::Insert, namespace, id);
        event.full_document = Some(document);
        event
    }

    pub fn update(
        namespace: Namespace,
        id: impl Into<DocumentId>,
        document: Value,
        description: UpdateDescription,
    ) -> Self {
        let mut event = Self::new(OperationType::Update, namespace, id);
        event.full_document = Some(document);
        event.update_description = Some(description);
        event
    }

    pub fn replace(namespace: Namespace, id: impl Into<DocumentId>, document: Value) -> Self {
        let mut event = Self::new(OperationType::Replace, namespace, id);
        event.full_document = Some(document);
        event
    }

    pub fn delete(namespace: Namespace, id: impl Into<DocumentId>) -> Self {
        Self::new(OperationType::Delete, namespace, id)
    }

    pub fn unknown(namespace: Namespace, id: impl Into<DocumentId>) -> Self {
        Self::new(OperationType::Unknown, namespace, id)
    }

    pub fn with_version(mut self, version: Option<VersionToken>) -> Self {
        self.version = version;
        self
    }

    pub fn with_uncommitted_writes(mut self, uncommitted: bool) -> Self {
        self.has_uncommitted_writes = uncommitted;
        self
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.namespace.clone(), self.document_key.clone())
    }

    pub fn is_delete(&self) -> bool {
        self.operation_type == OperationType::Delete
    }

    /// Check that the event can be applied to a local store.
    ///
    /// Unknown operations and non-delete events without a full document are
    /// rejected.
    pub fn validate(&self) -> Result<()> {
        match self.operation_type {
            OperationType::Unknown => Err(Error::MalformedEvent(format!(
                "unknown operation type for {}",
                self.key()
            ))),
            OperationType::Delete => Ok(()),
            OperationType::Insert | OperationType::Update | OperationType::Replace => {
                match &self.full_document {
                    Some(Value::Object(_)) => Ok(()),
                    Some(_) => Err(Error::MalformedEvent(format!(
                        "fullDocument for {} is not an object",
                        self.key()
                    ))),
                    None => Err(Error::MalformedEvent(format!(
                        "missing fullDocument for {}",
                        self.key()
                    ))),
                }
            }
        }
    }
}
