//! Change stream consumer.
//!
//! One background task per synced namespace keeps a remote change stream
//! open for the namespace's synced ids and forwards every item into the
//! bounded inbound buffer drained by the sync pass. The stream is reopened
//! from the last forwarded resume token after errors (with backoff) and
//! whenever the id set changes.

use crate::config::RetryConfig;
use crate::remote::{ChangeStream, RemoteCollection, RemoteError, WatchRequest};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tether_engine::{ChangeEvent, DocumentId, DocumentKey, Namespace, ResumeToken, VersionToken};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A remote change waiting to be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub namespace: Namespace,
    pub event: ChangeEvent,
    pub resume_token: ResumeToken,
}

/// Receiving end of the inbound buffer, owned by the sync pass.
///
/// A pass first collects everything forwarded so far into the backlog, so
/// pushes can consult changes that are already known before they are
/// applied. Items left in the backlog when a pass halts are applied by the
/// next one.
pub(crate) struct InboundBuffer {
    receiver: mpsc::Receiver<InboundEvent>,
    backlog: VecDeque<InboundEvent>,
}

impl InboundBuffer {
    pub(crate) fn new(receiver: mpsc::Receiver<InboundEvent>) -> Self {
        Self {
            receiver,
            backlog: VecDeque::new(),
        }
    }

    /// Move forwarded items into the backlog and return it in arrival order.
    pub(crate) fn collect(&mut self) -> &[InboundEvent] {
        while let Ok(item) = self.receiver.try_recv() {
            self.backlog.push_back(item);
        }
        self.backlog.make_contiguous()
    }

    /// Next item to apply, backlog first.
    pub(crate) fn next(&mut self) -> Option<InboundEvent> {
        self.backlog
            .pop_front()
            .or_else(|| self.receiver.try_recv().ok())
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

/// Latest buffered change to `key` that produced `version`.
pub(crate) fn buffered_change<'a>(
    buffered: &'a [InboundEvent],
    key: &DocumentKey,
    version: Option<&VersionToken>,
) -> Option<&'a ChangeEvent> {
    buffered
        .iter()
        .rev()
        .map(|item| &item.event)
        .filter(|event| event.namespace == key.namespace && event.document_key == key.id)
        .find(|event| match version {
            Some(_) => event.version.as_ref() == version,
            None => event.is_delete(),
        })
}

/// Last resume token forwarded per namespace, shared across consumer restarts.
pub type ForwardedTokens = Arc<DashMap<Namespace, ResumeToken>>;

/// Why forwarding from an open stream stopped.
enum StreamEnd {
    IdsChanged,
    Closed,
    Shutdown,
}

pub struct ChangeStreamConsumer {
    namespace: Namespace,
    remote: Arc<dyn RemoteCollection>,
    ids: watch::Receiver<Vec<DocumentId>>,
    outbound: mpsc::Sender<InboundEvent>,
    forwarded: ForwardedTokens,
    resume_from: Option<ResumeToken>,
    retry: RetryConfig,
    open_timeout: Duration,
}

impl ChangeStreamConsumer {
    pub fn new(
        namespace: Namespace,
        remote: Arc<dyn RemoteCollection>,
        ids: watch::Receiver<Vec<DocumentId>>,
        outbound: mpsc::Sender<InboundEvent>,
        forwarded: ForwardedTokens,
    ) -> Self {
        Self {
            namespace,
            remote,
            ids,
            outbound,
            forwarded,
            resume_from: None,
            retry: RetryConfig::default(),
            open_timeout: Duration::from_secs(30),
        }
    }

    /// Start after `token` unless a newer token was already forwarded.
    pub fn with_resume_token(mut self, token: Option<ResumeToken>) -> Self {
        self.resume_from = self
            .forwarded
            .get(&self.namespace)
            .map(|t| t.value().clone())
            .or(token);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            let ids = self.ids.borrow_and_update().clone();
            if ids.is_empty() {
                if self.ids.changed().await.is_err() {
                    return;
                }
                continue;
            }

            match self.open(ids).await {
                Ok(mut stream) => {
                    attempt = 0;
                    tracing::debug!(namespace = %self.namespace, "Change stream opened");
                    match self.forward(&mut stream).await {
                        StreamEnd::IdsChanged => continue,
                        StreamEnd::Shutdown => return,
                        StreamEnd::Closed => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(namespace = %self.namespace, error = %err, "Failed to open change stream");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.retry.delay_for_attempt(attempt);
            tracing::debug!(namespace = %self.namespace, attempt, ?delay, "Reopening change stream after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.ids.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn open(&self, ids: Vec<DocumentId>) -> Result<ChangeStream, RemoteError> {
        let request = WatchRequest {
            namespace: self.namespace.clone(),
            ids,
            resume_token: self.resume_from.clone(),
        };
        match tokio::time::timeout(self.open_timeout, self.remote.watch(request)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Network("timed out opening change stream".into())),
        }
    }

    async fn forward(&mut self, stream: &mut ChangeStream) -> StreamEnd {
        loop {
            tokio::select! {
                changed = self.ids.changed() => {
                    return match changed {
                        Ok(()) => StreamEnd::IdsChanged,
                        Err(_) => StreamEnd::Shutdown,
                    };
                }
                item = stream.next() => match item {
                    Some(Ok(item)) => {
                        let token = item.resume_token.clone();
                        let inbound = InboundEvent {
                            namespace: self.namespace.clone(),
                            event: item.event,
                            resume_token: item.resume_token,
                        };
                        // Waits while the buffer is full
                        if self.outbound.send(inbound).await.is_err() {
                            return StreamEnd::Shutdown;
                        }
                        self.forwarded.insert(self.namespace.clone(), token.clone());
                        self.resume_from = Some(token);
                    }
                    Some(Err(err)) => {
                        tracing::warn!(namespace = %self.namespace, error = %err, "Change stream failed");
                        return StreamEnd::Closed;
                    }
                    None => {
                        tracing::debug!(namespace = %self.namespace, "Change stream closed");
                        return StreamEnd::Closed;
                    }
                },
            }
        }
    }
}
