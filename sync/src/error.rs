//! Unified error handling for the synchronizer.

use crate::config::ConfigError;
use crate::remote::RemoteError;
use tether_engine::DocumentKey;

/// Synchronizer error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// The remote could not be reached or the call timed out. Retried on the
    /// next pass.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The remote's version precondition rejected a write. Resolved by
    /// classification, never surfaced to callers.
    #[error("version conflict on {0}")]
    VersionConflict(DocumentKey),

    #[error("conflict handler failed for {key}: {message}")]
    ConflictHandler { key: DocumentKey, message: String },

    #[error("unknown remote event: {0}")]
    UnknownRemoteEvent(String),

    #[error("local store error: {0}")]
    LocalStore(#[from] tether_engine::Error),

    #[error("listener failed: {0}")]
    Listener(String),

    #[error("remote rejected operation: {0}")]
    Remote(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Whether the failed operation is retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_) | SyncError::VersionConflict(_)
        )
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(message) => SyncError::TransientNetwork(message),
            other => SyncError::Remote(other.to_string()),
        }
    }
}

/// Result type alias for synchronizer operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tether_engine::Namespace;

    #[test]
    fn retryable_errors() {
        let key = DocumentKey::new(Namespace::new("db", "c"), "1");
        assert!(SyncError::TransientNetwork("reset".into()).is_retryable());
        assert!(SyncError::VersionConflict(key.clone()).is_retryable());
        assert!(!SyncError::ConflictHandler {
            key,
            message: "boom".into()
        }
        .is_retryable());
        assert!(!SyncError::Listener("panicked".into()).is_retryable());
    }

    #[test]
    fn remote_errors_map_by_kind() {
        let err: SyncError = RemoteError::Network("down".into()).into();
        assert!(matches!(err, SyncError::TransientNetwork(_)));

        let err: SyncError = RemoteError::DuplicateKey("1".into()).into();
        assert!(matches!(err, SyncError::Remote(_)));
    }

    #[test]
    fn error_display() {
        let key = DocumentKey::new(Namespace::new("db", "c"), "1");
        let err = SyncError::ConflictHandler {
            key,
            message: "no merge".into(),
        };
        assert_eq!(
            err.to_string(),
            "conflict handler failed for db.c/1: no merge"
        );

        let err: SyncError = tether_engine::Error::DuplicateKey("9".into()).into();
        assert_eq!(err.to_string(), "local store error: duplicate document id: 9");
    }
}
