//! Listener registry and event dispatch.
//!
//! Change listeners and conflict handlers are registered per namespace; one
//! error listener is global. Host callbacks run on the sync pass's task, so
//! a failing or panicking callback is contained here and reported once
//! through the error listener.

use crate::error::SyncError;
use dashmap::DashMap;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tether_engine::{
    ChangeEvent, ConflictCase, ConflictHandler, DocumentKey, HandlerError, Namespace, RemoteWins,
    Resolution,
};

/// Receives change events for one namespace.
pub trait ChangeListener: Send + Sync {
    fn on_event(&self, event: &ChangeEvent) -> Result<(), HandlerError>;
}

impl<F> ChangeListener for F
where
    F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn on_event(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Receives per-document failures.
pub trait ErrorListener: Send + Sync {
    fn on_error(&self, key: &DocumentKey, error: &SyncError);
}

impl<F> ErrorListener for F
where
    F: Fn(&DocumentKey, &SyncError) + Send + Sync,
{
    fn on_error(&self, key: &DocumentKey, error: &SyncError) {
        self(key, error)
    }
}

#[derive(Default)]
pub struct EventDispatcher {
    change_listeners: DashMap<Namespace, Arc<dyn ChangeListener>>,
    conflict_handlers: DashMap<Namespace, Arc<dyn ConflictHandler>>,
    error_listener: RwLock<Option<Arc<dyn ErrorListener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_change_listener(&self, namespace: Namespace, listener: Arc<dyn ChangeListener>) {
        self.change_listeners.insert(namespace, listener);
    }

    pub fn remove_change_listener(&self, namespace: &Namespace) {
        self.change_listeners.remove(namespace);
    }

    pub fn set_conflict_handler(&self, namespace: Namespace, handler: Arc<dyn ConflictHandler>) {
        self.conflict_handlers.insert(namespace, handler);
    }

    pub fn set_error_listener(&self, listener: Arc<dyn ErrorListener>) {
        *self
            .error_listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Deliver a change event to the namespace's listener, if any.
    pub fn emit_change(&self, event: &ChangeEvent) {
        let Some(listener) = self
            .change_listeners
            .get(&event.namespace)
            .map(|l| Arc::clone(l.value()))
        else {
            return;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
        let message = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(panic) => format!("listener panicked: {}", panic_message(&panic)),
        };
        tracing::warn!(key = %event.key(), error = %message, "Change listener failed");
        self.emit_error(&event.key(), &SyncError::Listener(message));
    }

    /// Report a failure for one document.
    pub fn emit_error(&self, key: &DocumentKey, error: &SyncError) {
        let listener = self
            .error_listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(listener) = listener else {
            tracing::debug!(key = %key, error = %error, "No error listener registered");
            return;
        };

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener.on_error(key, error))) {
            tracing::error!(
                key = %key,
                error = %error,
                panic = %panic_message(&panic),
                "Error listener panicked"
            );
        }
    }

    /// Ask the namespace's conflict handler for a resolution.
    ///
    /// Namespaces without a registered handler resolve in favour of the remote.
    pub fn resolve_conflict(&self, case: &ConflictCase) -> Result<Resolution, SyncError> {
        let handler = self
            .conflict_handlers
            .get(&case.key.namespace)
            .map(|h| Arc::clone(h.value()));

        let outcome = catch_unwind(AssertUnwindSafe(|| match &handler {
            Some(handler) => handler.resolve(case),
            None => RemoteWins.resolve(case),
        }));

        let message = match outcome {
            Ok(Ok(resolution)) => return Ok(resolution),
            Ok(Err(err)) => err.to_string(),
            Err(panic) => format!("handler panicked: {}", panic_message(&panic)),
        };
        Err(SyncError::ConflictHandler {
            key: case.key.clone(),
            message,
        })
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
