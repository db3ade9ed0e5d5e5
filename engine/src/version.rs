//! Document version tokens.
//!
//! Every write accepted by the remote carries a [`VersionToken`] naming the
//! synchronizer instance that produced it and a per-document generation.
//! Writers always derive the next token from the baseline they observed, so
//! an instance can recognise its own writes when they come back.
//!
//! Generations are only ordered within one lifetime of a document. A delete
//! ends the lifetime; a later insert of the same id starts again at zero, so
//! tokens from different lifetimes can be equal and must never be compared.

use crate::{Generation, InstanceId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque-to-the-host version of a remote document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionToken {
    /// Synchronizer instance that wrote this version
    pub instance_id: InstanceId,
    /// Counter that grows with every write since the document was inserted.
    /// Restarts at zero when the document is deleted and inserted again.
    pub generation: Generation,
}

impl VersionToken {
    /// Create a token with an explicit generation.
    pub fn new(instance_id: impl Into<InstanceId>, generation: Generation) -> Self {
        Self {
            instance_id: instance_id.into(),
            generation,
        }
    }

    /// First version of a document written by `instance_id`.
    pub fn initial(instance_id: impl Into<InstanceId>) -> Self {
        Self::new(instance_id, 0)
    }

    /// The version `instance_id` writes when replacing `baseline`.
    pub fn next_for(baseline: Option<&VersionToken>, instance_id: impl Into<InstanceId>) -> Self {
        match baseline {
            Some(base) => Self::new(instance_id, base.generation.saturating_add(1)),
            None => Self::initial(instance_id),
        }
    }

    /// Whether this token was written by the given instance.
    pub fn produced_by(&self, instance_id: &str) -> bool {
        self.instance_id == instance_id
    }

    /// Whether this token is the immediate successor of `baseline`.
    pub fn is_successor_of(&self, baseline: Option<&VersionToken>) -> bool {
        match baseline {
            Some(base) => base.generation.checked_add(1) == Some(self.generation),
            None => self.generation == 0,
        }
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instance_id, self.generation)
    }
}
