//! Lifecycle control: start/stop, connectivity and authentication gates,
//! the periodic scheduler and the per-namespace stream consumers.

use crate::error::Result;
use crate::stream::ChangeStreamConsumer;
use crate::synchronizer::Shared;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tether_engine::{DocumentId, Namespace};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Scheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Tasks {
    scheduler: Option<Scheduler>,
    consumers: HashMap<Namespace, JoinHandle<()>>,
}

/// Run state and gates of one synchronizer.
pub(crate) struct Lifecycle {
    running: AtomicBool,
    stopping: AtomicBool,
    online: AtomicBool,
    authenticated: AtomicBool,
    tasks: Mutex<Tasks>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            online: AtomicBool::new(true),
            authenticated: AtomicBool::new(true),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Remote calls are allowed only while online and authenticated.
    pub(crate) fn gates_open(&self) -> bool {
        self.is_online() && self.is_authenticated()
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort_consumers(&self) {
        let consumers: Vec<_> = self.tasks().consumers.drain().collect();
        for (namespace, handle) in consumers {
            tracing::debug!(namespace = %namespace, "Stopping change stream consumer");
            handle.abort();
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        let tasks = self.tasks();
        for handle in tasks.consumers.values() {
            handle.abort();
        }
        if let Some(scheduler) = &tasks.scheduler {
            scheduler.handle.abort();
        }
    }
}

impl Shared {
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut tasks = self.lifecycle.tasks();
            if self.lifecycle.running.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let (shutdown, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(run_scheduler(
                Arc::downgrade(self),
                self.config.sync_interval,
                shutdown_rx,
            ));
            tasks.scheduler = Some(Scheduler { shutdown, handle });
        }

        tracing::info!(
            instance_id = %self.instance_id,
            interval = ?self.config.sync_interval,
            "Synchronizer started"
        );
        self.ensure_consumers()
    }

    /// Stop background work. An in-flight pass finishes its current document.
    pub(crate) async fn stop(&self) {
        let scheduler = {
            let mut tasks = self.lifecycle.tasks();
            if !self.lifecycle.running.swap(false, Ordering::SeqCst) {
                return;
            }
            tasks.scheduler.take()
        };

        self.lifecycle.stopping.store(true, Ordering::SeqCst);
        self.lifecycle.abort_consumers();

        if let Some(scheduler) = scheduler {
            // The receiver may already be gone if the task ended
            let _ = scheduler.shutdown.send(true);
            if let Err(err) = scheduler.handle.await {
                if err.is_panic() {
                    tracing::error!(error = %err, "Sync scheduler panicked");
                }
            }
        }
        // Wait out a pass triggered by hand
        drop(self.pass_lock.lock().await);
        self.lifecycle.stopping.store(false, Ordering::SeqCst);

        tracing::info!(instance_id = %self.instance_id, "Synchronizer stopped");
    }

    pub(crate) fn set_online(&self, online: bool) -> Result<()> {
        if self.lifecycle.online.swap(online, Ordering::SeqCst) == online {
            return Ok(());
        }
        tracing::info!(online, "Connectivity changed");
        self.gates_changed()
    }

    pub(crate) fn set_authenticated(&self, authenticated: bool) -> Result<()> {
        if self.lifecycle.authenticated.swap(authenticated, Ordering::SeqCst) == authenticated {
            return Ok(());
        }
        tracing::info!(authenticated, "Authentication changed");
        self.gates_changed()
    }

    fn gates_changed(&self) -> Result<()> {
        if self.lifecycle.gates_open() {
            self.ensure_consumers()
        } else {
            self.lifecycle.abort_consumers();
            Ok(())
        }
    }

    /// Start a consumer for every synced namespace that lacks a live one.
    pub(crate) fn ensure_consumers(&self) -> Result<()> {
        if !self.lifecycle.is_running() || !self.lifecycle.gates_open() {
            return Ok(());
        }

        let mut tasks = self.lifecycle.tasks();
        for namespace in self.log.namespaces() {
            if tasks
                .consumers
                .get(&namespace)
                .is_some_and(|handle| !handle.is_finished())
            {
                continue;
            }

            let ids = self.watch_ids(&namespace);
            let token = self.log.metadata().resume_token(&namespace)?;
            let handle = ChangeStreamConsumer::new(
                namespace.clone(),
                self.remote.clone(),
                ids,
                self.inbound_tx.clone(),
                self.forwarded.clone(),
            )
            .with_resume_token(token)
            .with_retry(self.config.stream_retry.clone())
            .with_open_timeout(self.config.operation_timeout)
            .spawn();

            tracing::debug!(namespace = %namespace, "Started change stream consumer");
            tasks.consumers.insert(namespace, handle);
        }
        Ok(())
    }

    fn watch_ids(&self, namespace: &Namespace) -> watch::Receiver<Vec<DocumentId>> {
        self.refresh_watch(namespace);
        self.watchers
            .entry(namespace.clone())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .subscribe()
    }

    /// Publish the current synced id set of a namespace to its consumer.
    pub(crate) fn refresh_watch(&self, namespace: &Namespace) {
        let ids = self.log.synced_ids(namespace);
        match self.watchers.entry(namespace.clone()) {
            Entry::Occupied(entry) => {
                entry.get().send_if_modified(|current| {
                    if *current == ids {
                        return false;
                    }
                    *current = ids;
                    true
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(watch::channel(ids).0);
            }
        }
    }

    pub(crate) fn refresh_watches(&self) {
        let mut namespaces = self.log.namespaces();
        namespaces.extend(self.watchers.iter().map(|entry| entry.key().clone()));
        namespaces.sort();
        namespaces.dedup();
        for namespace in &namespaces {
            self.refresh_watch(namespace);
        }
    }
}

async fn run_scheduler(
    shared: Weak<Shared>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.run_pass().await;
                if let Err(err) = shared.ensure_consumers() {
                    tracing::warn!(error = %err, "Failed to restart change stream consumers");
                }
            }
        }
    }
}
