//! Error types for the Tether engine.

use crate::DocumentId;
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Document errors
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("duplicate document id: {0}")]
    DuplicateKey(DocumentId),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("field '{0}' is immutable")]
    ImmutableField(String),

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    // Remote input errors
    #[error("malformed change event: {0}")]
    MalformedEvent(String),

    // Storage errors
    #[error("local store failure: {0}")]
    LocalStore(String),

    #[error("metadata store failure: {0}")]
    MetadataStore(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
