//! Version classification and conflict resolution.
//!
//! Whenever the synchronizer observes a remote version for a document it has
//! a baseline for, it classifies the observation with [`classify`]. Only
//! [`VersionState::New`] is a true conflict; everything else is routine and
//! handled without user involvement.
//!
//! # Rules
//!
//! 1. `None` - no local baseline and no remote version
//! 2. `Same` - remote equals the local baseline
//! 3. `Previous` - remote is the version before the baseline, or older;
//!    only meaningful while a baseline exists
//! 4. `Next` - remote is this instance's own write on top of the baseline
//! 5. `New` - anything else (someone else changed the document)
//!
//! Generations are only compared against a baseline, and a baseline is
//! dropped together with the document lifetime it belongs to (see
//! [`crate::DocumentMeta::advance_version`]).

use crate::{ChangeEvent, DocumentKey, LocalWrite, VersionToken};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Relationship between an observed remote version and the local baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VersionState {
    None,
    Previous,
    Same,
    Next,
    New,
}

impl VersionState {
    /// Whether the observation must be handed to the conflict handler.
    pub fn is_conflict(self) -> bool {
        match self {
            VersionState::New => true,
            VersionState::None | VersionState::Previous | VersionState::Same | VersionState::Next => {
                false
            }
        }
    }
}

/// What the local side knows about a document's remote version.
#[derive(Debug, Clone, Copy)]
pub struct VersionContext<'a> {
    /// Last remote version confirmed for the document
    pub baseline: Option<&'a VersionToken>,
    /// Version confirmed before `baseline`
    pub previous: Option<&'a VersionToken>,
    /// This synchronizer instance
    pub instance_id: &'a str,
}

/// Classify an observed remote version against the local context.
pub fn classify(context: &VersionContext<'_>, observed: Option<&VersionToken>) -> VersionState {
    let Some(observed) = observed else {
        return match context.baseline {
            None => VersionState::None,
            Some(_) => VersionState::New,
        };
    };

    if context.baseline == Some(observed) {
        return VersionState::Same;
    }

    // Without a baseline the document is in a new lifetime and nothing it
    // shows can be stale
    if let Some(base) = context.baseline {
        if context.previous == Some(observed) || observed.generation < base.generation {
            return VersionState::Previous;
        }
    }

    if observed.produced_by(context.instance_id) && observed.is_successor_of(context.baseline) {
        return VersionState::Next;
    }

    VersionState::New
}

/// A true conflict: local and remote changed the same document independently.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictCase {
    pub key: DocumentKey,
    /// The uncommitted local change
    pub local: ChangeEvent,
    /// The remote change that was not derived from the local baseline
    pub remote: ChangeEvent,
}

/// Outcome chosen by a conflict handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The document should end up with this content
    Document(Value),
    /// The document should end up deleted
    Delete,
}

/// Error type conflict handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// User-supplied policy for true conflicts.
pub trait ConflictHandler: Send + Sync {
    fn resolve(&self, case: &ConflictCase) -> Result<Resolution, HandlerError>;
}

impl<F> ConflictHandler for F
where
    F: Fn(&ConflictCase) -> Result<Resolution, HandlerError> + Send + Sync,
{
    fn resolve(&self, case: &ConflictCase) -> Result<Resolution, HandlerError> {
        self(case)
    }
}

/// Keep whatever the remote has.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl ConflictHandler for RemoteWins {
    fn resolve(&self, case: &ConflictCase) -> Result<Resolution, HandlerError> {
        Ok(resolution_of(&case.remote))
    }
}

/// Keep the local change.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl ConflictHandler for LocalWins {
    fn resolve(&self, case: &ConflictCase) -> Result<Resolution, HandlerError> {
        Ok(resolution_of(&case.local))
    }
}

fn resolution_of(event: &ChangeEvent) -> Resolution {
    match (&event.full_document, event.is_delete()) {
        (Some(document), false) => Resolution::Document(document.clone()),
        _ => Resolution::Delete,
    }
}

/// What the synchronizer does with a [`Resolution`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionPlan {
    /// The result equals the remote state: adopt it and drop the pending write
    AcceptRemote(Option<Value>),
    /// Apply locally and push to the remote on top of the observed version
    Schedule(LocalWrite),
}

impl ResolutionPlan {
    pub fn new(resolution: Resolution, remote: &ChangeEvent) -> Self {
        match resolution {
            Resolution::Delete if remote.is_delete() => ResolutionPlan::AcceptRemote(None),
            Resolution::Delete => ResolutionPlan::Schedule(LocalWrite::delete()),
            Resolution::Document(document) if remote.is_delete() => {
                ResolutionPlan::Schedule(LocalWrite::insert(document))
            }
            Resolution::Document(document) => {
                if remote.full_document.as_ref() == Some(&document) {
                    ResolutionPlan::AcceptRemote(Some(document))
                } else {
                    ResolutionPlan::Schedule(LocalWrite::replace(document))
                }
            }
        }
    }
}
