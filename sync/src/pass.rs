//! The sync pass.
//!
//! A pass pushes every pending local write to the remote (local to remote),
//! then applies buffered remote changes locally (remote to local). Passes are
//! serialized; within a pass documents are processed independently, so one
//! document's failure never stops the others.

use crate::error::{Result, SyncError};
use crate::remote::RemoteError;
use crate::stream::{buffered_change, InboundBuffer, InboundEvent};
use crate::synchronizer::Shared;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::PoisonError;
use tether_engine::{
    classify, ChangeEvent, ConflictCase, DocumentId, DocumentKey, Namespace, PendingWrite,
    ResolutionPlan, VersionState, VersionToken, WriteKind,
};

/// Outcome of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPassReport {
    pub started_at: DateTime<Utc>,
    /// The pass did nothing because a gate was closed
    pub skipped: bool,
    /// Local writes confirmed by the remote
    pub pushed: usize,
    /// Remote changes applied locally
    pub applied: usize,
    pub conflicts: usize,
    pub errors: usize,
}

impl SyncPassReport {
    pub fn skipped(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            skipped: true,
            pushed: 0,
            applied: 0,
            conflicts: 0,
            errors: 0,
        }
    }
}

/// Totals across all passes of a synchronizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub passes: u64,
    pub skipped_passes: u64,
    pub pushed: u64,
    pub applied: u64,
    pub conflicts: u64,
    pub errors: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
}

impl SyncStats {
    pub fn record(&mut self, report: &SyncPassReport) {
        self.passes += 1;
        if report.skipped {
            self.skipped_passes += 1;
        }
        self.pushed += report.pushed as u64;
        self.applied += report.applied as u64;
        self.conflicts += report.conflicts as u64;
        self.errors += report.errors as u64;
        self.last_pass_at = Some(report.started_at);
    }
}

#[derive(Default)]
struct PassCounters {
    pushed: AtomicUsize,
    applied: AtomicUsize,
    conflicts: AtomicUsize,
    errors: AtomicUsize,
}

impl PassCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, started_at: DateTime<Utc>) -> SyncPassReport {
        SyncPassReport {
            started_at,
            skipped: false,
            pushed: self.pushed.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Result of pushing one pending write.
enum Pushed {
    Confirmed,
    Conflict,
    /// Left pending for a later pass
    Deferred,
}

/// What to do after the remote rejected a write's precondition.
enum Mismatch {
    Retry {
        kind: WriteKind,
        expected: Option<VersionToken>,
    },
    Settled(Pushed),
}

/// Result of handling one remote change.
enum Received {
    Applied,
    Conflict,
    Ignored,
}

impl Shared {
    pub(crate) async fn run_pass(&self) -> SyncPassReport {
        let started_at = Utc::now();
        if !self.lifecycle.gates_open() {
            tracing::debug!("Sync pass skipped, offline or unauthenticated");
            return self.finish_pass(SyncPassReport::skipped(started_at));
        }

        let _pass = self.pass_lock.lock().await;
        if !self.lifecycle.gates_open() {
            return self.finish_pass(SyncPassReport::skipped(started_at));
        }

        let counters = PassCounters::default();
        let mut inbound = self.inbound.lock().await;
        self.push_local(inbound.collect(), &counters).await;
        self.pull_remote(&mut inbound, &counters).await;
        drop(inbound);
        self.refresh_watches();

        let report = counters.report(started_at);
        tracing::debug!(
            pushed = report.pushed,
            applied = report.applied,
            conflicts = report.conflicts,
            errors = report.errors,
            "Sync pass complete"
        );
        self.finish_pass(report)
    }

    fn finish_pass(&self, report: SyncPassReport) -> SyncPassReport {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&report);
        report
    }

    fn should_halt(&self) -> bool {
        self.lifecycle.is_stopping() || !self.lifecycle.gates_open()
    }

    /// Bound a remote call by the operation timeout.
    async fn call<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, RemoteError>>,
    ) -> std::result::Result<T, RemoteError> {
        let timeout = self.config.operation_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Network(format!(
                "remote call timed out after {timeout:?}"
            ))),
        }
    }

    // ========================================================================
    // Local to remote
    // ========================================================================

    async fn push_local(&self, buffered: &[InboundEvent], counters: &PassCounters) {
        futures::stream::iter(self.log.peek_all())
            .for_each_concurrent(self.config.max_concurrent_writes, |(key, pending)| async move {
                if self.should_halt() {
                    return;
                }
                match self.push(&key, pending, buffered).await {
                    Ok(Pushed::Confirmed) => PassCounters::bump(&counters.pushed),
                    Ok(Pushed::Conflict) => PassCounters::bump(&counters.conflicts),
                    Ok(Pushed::Deferred) => {}
                    Err(err) => {
                        PassCounters::bump(&counters.errors);
                        self.record_push_failure(&key, &err).await;
                    }
                }
            })
            .await;
    }

    async fn push(
        &self,
        key: &DocumentKey,
        pending: PendingWrite,
        buffered: &[InboundEvent],
    ) -> Result<Pushed> {
        let Some(meta) = self.log.meta(key) else {
            return Ok(Pushed::Deferred);
        };

        let mut kind = pending.kind;
        let mut expected = meta.version;
        let mut retried = false;

        loop {
            let version = VersionToken::next_for(expected.as_ref(), self.instance_id.as_str());
            let matched = self
                .send(key, kind, pending.document.as_ref(), expected.as_ref(), &version)
                .await?;

            if matched {
                let confirmed = (kind != WriteKind::Delete).then_some(version);
                self.confirm(key, &pending, kind, confirmed).await?;
                return Ok(Pushed::Confirmed);
            }
            if retried {
                tracing::debug!(key = %key, "Version mismatch persists, retrying next pass");
                return Ok(Pushed::Deferred);
            }

            tracing::debug!(key = %key, kind = ?kind, "Remote rejected write precondition");
            match self.reconcile_mismatch(key, &pending, kind, buffered).await? {
                Mismatch::Retry {
                    kind: next_kind,
                    expected: next_expected,
                } => {
                    kind = next_kind;
                    expected = next_expected;
                    retried = true;
                }
                Mismatch::Settled(outcome) => return Ok(outcome),
            }
        }
    }

    /// Issue the remote operation. Returns false when the precondition did not match.
    async fn send(
        &self,
        key: &DocumentKey,
        kind: WriteKind,
        document: Option<&Value>,
        expected: Option<&VersionToken>,
        version: &VersionToken,
    ) -> Result<bool> {
        let namespace = &key.namespace;
        let body = || {
            document.ok_or_else(|| {
                SyncError::LocalStore(tether_engine::Error::InvalidDocument(format!(
                    "pending write for {key} has no document"
                )))
            })
        };

        let matched = match kind {
            WriteKind::Insert => {
                match self
                    .call(self.remote.insert_one(namespace, body()?, version))
                    .await
                {
                    Ok(_) => true,
                    Err(RemoteError::DuplicateKey(_)) => false,
                    Err(err) => return Err(err.into()),
                }
            }
            WriteKind::Update => {
                self.call(
                    self.remote
                        .replace_one(namespace, &key.id, expected, body()?, version),
                )
                .await?
                .matched_count
                    > 0
            }
            WriteKind::Delete => {
                self.call(self.remote.delete_one(namespace, &key.id, expected))
                    .await?
                    .deleted_count
                    > 0
            }
        };
        Ok(matched)
    }

    async fn confirm(
        &self,
        key: &DocumentKey,
        pending: &PendingWrite,
        kind: WriteKind,
        version: Option<VersionToken>,
    ) -> Result<()> {
        let synced = {
            let _guard = self.log.lock(key).await;
            self.log.confirm(key, pending.seq, kind, version.clone())?
        };
        tracing::debug!(key = %key, kind = ?kind, "Pending write confirmed");
        if synced {
            self.dispatcher
                .emit_change(&pending.to_confirmed_event(key, version));
        }
        Ok(())
    }

    async fn reconcile_mismatch(
        &self,
        key: &DocumentKey,
        pending: &PendingWrite,
        kind: WriteKind,
        buffered: &[InboundEvent],
    ) -> Result<Mismatch> {
        let observed = self
            .call(
                self.remote
                    .find(&key.namespace, std::slice::from_ref(&key.id)),
            )
            .await?
            .into_iter()
            .next();

        if kind == WriteKind::Delete && observed.is_none() {
            self.confirm(key, pending, kind, None).await?;
            return Ok(Mismatch::Settled(Pushed::Confirmed));
        }

        let guard = self.log.lock(key).await;
        let Some(meta) = self.log.meta(key) else {
            return Ok(Mismatch::Settled(Pushed::Deferred));
        };
        let Some(current) = meta.pending.clone().filter(|p| p.seq == pending.seq) else {
            // A newer local write replaced this one while it was in flight
            return Ok(Mismatch::Settled(Pushed::Deferred));
        };

        let observed_version = observed.as_ref().and_then(|doc| doc.version.clone());
        let retry_kind = match (&observed, kind) {
            (None, WriteKind::Update) => WriteKind::Insert,
            (Some(_), WriteKind::Insert) => WriteKind::Update,
            _ => kind,
        };

        let state = classify(
            &meta.version_context(&self.instance_id),
            observed_version.as_ref(),
        );
        tracing::debug!(key = %key, state = ?state, "Classified remote version after mismatch");

        let next = match state {
            VersionState::None => Mismatch::Retry {
                kind: retry_kind,
                expected: None,
            },
            VersionState::Previous => Mismatch::Retry {
                kind: retry_kind,
                expected: observed_version,
            },
            VersionState::Same => Mismatch::Settled(Pushed::Deferred),
            VersionState::Next => {
                let advanced = observed_version.clone();
                self.log
                    .update_meta(key, |meta| meta.advance_version(advanced))?;
                Mismatch::Retry {
                    kind: retry_kind,
                    expected: observed_version,
                }
            }
            VersionState::New => {
                // A streamed event keeps the update description a fetched
                // document lacks
                let known = buffered_change(buffered, key, observed_version.as_ref()).cloned();
                let remote = match (known, observed) {
                    (Some(event), _) => event,
                    (None, Some(doc)) => {
                        ChangeEvent::replace(key.namespace.clone(), key.id.clone(), doc.document)
                            .with_version(doc.version)
                    }
                    (None, None) => ChangeEvent::delete(key.namespace.clone(), key.id.clone()),
                };
                let emitted = self.handle_conflict(key, current.to_change_event(key), remote);
                drop(guard);
                self.emit_resolution(key, emitted?);
                Mismatch::Settled(Pushed::Conflict)
            }
        };
        Ok(next)
    }

    async fn record_push_failure(&self, key: &DocumentKey, err: &SyncError) {
        tracing::warn!(key = %key, error = %err, "Failed to push pending write");
        let message = err.to_string();
        {
            let _guard = self.log.lock(key).await;
            if let Err(meta_err) = self
                .log
                .update_meta(key, |meta| meta.last_error = Some(message))
            {
                tracing::error!(key = %key, error = %meta_err, "Failed to record push failure");
            }
        }
        self.dispatcher.emit_error(key, err);
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    /// Ask the conflict handler and apply its resolution. Must be called with
    /// the document's lock held; returns the event to emit once it is released.
    fn handle_conflict(
        &self,
        key: &DocumentKey,
        local: ChangeEvent,
        remote: ChangeEvent,
    ) -> Result<Option<ChangeEvent>> {
        tracing::info!(
            key = %key,
            local = ?local.operation_type,
            remote = ?remote.operation_type,
            "Conflict detected"
        );
        let case = ConflictCase {
            key: key.clone(),
            local,
            remote,
        };

        let resolution = match self.dispatcher.resolve_conflict(&case) {
            Ok(resolution) => resolution,
            Err(err) => {
                self.pause(key, &err)?;
                return Ok(None);
            }
        };

        let remote_version = case.remote.version.clone();
        let plan = ResolutionPlan::new(resolution, &case.remote);
        let accepts_remote = matches!(plan, ResolutionPlan::AcceptRemote(_));
        self.log.resolve(key, plan, remote_version)?;

        let event = if accepts_remote {
            Some(case.remote)
        } else {
            self.log
                .meta(key)
                .and_then(|meta| meta.pending)
                .map(|pending| pending.to_change_event(key))
        };
        Ok(event)
    }

    fn emit_resolution(&self, key: &DocumentKey, event: Option<ChangeEvent>) {
        if let Some(event) = event {
            tracing::debug!(key = %key, operation = ?event.operation_type, "Conflict resolved");
            self.dispatcher.emit_change(&event);
        }
    }

    /// Exclude a document from sync after its conflict handler failed.
    fn pause(&self, key: &DocumentKey, err: &SyncError) -> Result<()> {
        tracing::warn!(key = %key, error = %err, "Conflict handler failed, pausing document");
        let message = err.to_string();
        self.log.update_meta(key, |meta| {
            meta.paused = true;
            meta.last_error = Some(message);
        })?;
        self.dispatcher.emit_error(key, err);
        Ok(())
    }

    // ========================================================================
    // Remote to local
    // ========================================================================

    async fn pull_remote(&self, inbound: &mut InboundBuffer, counters: &PassCounters) {
        self.refresh_stale(counters).await;
        self.drain_inbound(inbound, counters).await;
    }

    /// Fetch documents whose remote state has never been seen.
    async fn refresh_stale(&self, counters: &PassCounters) {
        let mut by_namespace: BTreeMap<Namespace, Vec<DocumentId>> = BTreeMap::new();
        for key in self.log.stale_keys() {
            by_namespace.entry(key.namespace).or_default().push(key.id);
        }

        for (namespace, ids) in by_namespace {
            if self.should_halt() {
                return;
            }
            let found = match self.call(self.remote.find(&namespace, &ids)).await {
                Ok(found) => found,
                Err(err) => {
                    PassCounters::bump(&counters.errors);
                    tracing::warn!(namespace = %namespace, error = %err, "Failed to fetch stale documents");
                    continue;
                }
            };
            let mut found: HashMap<DocumentId, _> =
                found.into_iter().map(|doc| (doc.id.clone(), doc)).collect();

            for id in ids {
                if self.lifecycle.is_stopping() {
                    return;
                }
                let event = match found.remove(&id) {
                    Some(doc) => ChangeEvent::replace(namespace.clone(), id, doc.document)
                        .with_version(doc.version),
                    None => ChangeEvent::delete(namespace.clone(), id),
                };
                let key = event.key();
                if let Err(err) = self.receive(event, true, counters).await {
                    PassCounters::bump(&counters.errors);
                    tracing::warn!(key = %key, error = %err, "Failed to refresh document");
                    self.dispatcher.emit_error(&key, &err);
                }
            }
        }
    }

    /// Apply buffered stream events in arrival order.
    async fn drain_inbound(&self, inbound: &mut InboundBuffer, counters: &PassCounters) {
        while !self.lifecycle.is_stopping() {
            let Some(InboundEvent {
                namespace,
                event,
                resume_token,
            }) = inbound.next()
            else {
                break;
            };

            let key = event.key();
            if let Err(err) = self.receive(event, false, counters).await {
                PassCounters::bump(&counters.errors);
                tracing::warn!(key = %key, error = %err, "Failed to apply remote change");
                self.mark_stale(&key).await;
                self.dispatcher.emit_error(&key, &err);
            }

            if let Err(err) = self
                .log
                .metadata()
                .set_resume_token(&namespace, &resume_token)
            {
                tracing::error!(namespace = %namespace, error = %err, "Failed to persist resume token");
            }
        }
    }

    /// Refetch a document whose remote change could not be applied.
    async fn mark_stale(&self, key: &DocumentKey) {
        let _guard = self.log.lock(key).await;
        if let Err(err) = self.log.update_meta(key, |meta| meta.stale = true) {
            tracing::error!(key = %key, error = %err, "Failed to mark document stale");
        }
    }

    async fn receive(
        &self,
        event: ChangeEvent,
        refresh: bool,
        counters: &PassCounters,
    ) -> Result<()> {
        let key = event.key();
        if let Err(err) = event.validate() {
            let err = SyncError::UnknownRemoteEvent(err.to_string());
            tracing::warn!(key = %key, error = %err, "Skipping remote event");
            return Ok(());
        }

        let guard = self.log.lock(&key).await;
        let Some(meta) = self.log.meta(&key) else {
            return Ok(());
        };
        if meta.paused {
            return Ok(());
        }

        let state = classify(
            &meta.version_context(&self.instance_id),
            event.version.as_ref(),
        );
        let mut emit = None;
        let received = match (&meta.pending, state) {
            (None, VersionState::Same | VersionState::Previous) => Received::Ignored,
            (None, VersionState::None | VersionState::Next | VersionState::New) => {
                let already_absent = event.is_delete() && self.log.find(&key)?.is_none();
                if !already_absent || meta.version.is_some() {
                    self.log.apply_remote(
                        &key,
                        event.full_document.clone(),
                        event.version.clone(),
                    )?;
                }
                if already_absent {
                    Received::Ignored
                } else {
                    emit = Some(event);
                    Received::Applied
                }
            }
            (Some(_), VersionState::None | VersionState::Previous | VersionState::Same) => {
                Received::Ignored
            }
            (Some(_), VersionState::Next) => {
                let advanced = event.version.clone();
                self.log
                    .update_meta(&key, |meta| meta.advance_version(advanced))?;
                Received::Ignored
            }
            (Some(pending), VersionState::New) => {
                emit = self.handle_conflict(&key, pending.to_change_event(&key), event)?;
                Received::Conflict
            }
        };

        if refresh && self.log.meta(&key).is_some_and(|meta| meta.stale) {
            self.log.update_meta(&key, |meta| meta.stale = false)?;
        }
        drop(guard);

        match received {
            Received::Applied => {
                PassCounters::bump(&counters.applied);
                tracing::debug!(key = %key, "Applied remote change");
                if let Some(event) = emit {
                    self.dispatcher.emit_change(&event);
                }
            }
            Received::Conflict => {
                PassCounters::bump(&counters.conflicts);
                self.emit_resolution(&key, emit);
            }
            Received::Ignored => {
                tracing::trace!(key = %key, state = ?state, "Remote change needs no local action");
            }
        }
        Ok(())
    }
}
