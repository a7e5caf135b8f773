use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::RelayError;
use super::parser::content_to_text;
use super::{OutboundEvent, UpstreamChunk};
use crate::session_key::SessionKey;

/// Bounded client-facing channel with at-most-once terminal semantics.
///
/// Several tasks may race to end a session (upstream `end` vs a transport
/// error vs a cancel); only the first terminal event is delivered and
/// closing is idempotent.
pub struct OutboundChannel {
    tx: Mutex<Option<mpsc::Sender<OutboundEvent>>>,
    completion_sent: AtomicBool,
}

impl OutboundChannel {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let channel = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            completion_sent: AtomicBool::new(false),
        });
        (channel, rx)
    }

    /// Enqueue a non-terminal event, waiting for room if the client is slow.
    /// Returns `false` once the channel is closed or the client went away.
    pub async fn send(&self, event: OutboundEvent) -> bool {
        if self.completion_sent.load(Ordering::Acquire) {
            return false;
        }
        self.deliver(event).await
    }

    /// Send the terminal event and close. Only the first caller wins; later
    /// calls are swallowed and return `false`.
    pub async fn finish(&self, event: OutboundEvent) -> bool {
        debug_assert!(event.kind.is_terminal());
        if self.completion_sent.swap(true, Ordering::AcqRel) {
            tracing::debug!(kind = ?event.kind, "terminal event already sent, suppressing");
            return false;
        }
        let delivered = self.deliver(event).await;
        self.close();
        delivered
    }

    /// Like `finish`, but never waits: if the client has stopped reading and
    /// the channel is full the terminal event is dropped and the channel
    /// closed anyway.
    pub fn finish_now(&self, event: OutboundEvent) -> bool {
        debug_assert!(event.kind.is_terminal());
        if self.completion_sent.swap(true, Ordering::AcqRel) {
            tracing::debug!(kind = ?event.kind, "terminal event already sent, suppressing");
            return false;
        }
        let tx = self.sender_slot().take();
        match tx {
            Some(tx) => match tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(event)) => {
                    tracing::debug!(kind = ?event.kind, "outbound channel full, dropping terminal event");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => false,
        }
    }

    /// Drop the sender. Returns whether this call did the closing.
    pub fn close(&self) -> bool {
        self.sender_slot().take().is_some()
    }

    pub fn completion_sent(&self) -> bool {
        self.completion_sent.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.sender_slot().is_none()
    }

    /// Resolves once the receiving side has been dropped.
    pub async fn client_gone(&self) {
        let tx = self.sender_slot().clone();
        if let Some(tx) = tx {
            tx.closed().await;
        }
    }

    async fn deliver(&self, event: OutboundEvent) -> bool {
        let tx = self.sender_slot().clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    fn sender_slot(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<OutboundEvent>>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// How a relayed session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    Failed(String),
    Cancelled,
    /// The client stopped reading; nothing more can be delivered.
    ClientGone,
}

/// Maps upstream chunks to outbound events for one session.
pub struct RelayEmitter {
    channel: Arc<OutboundChannel>,
    session_key: SessionKey,
}

impl RelayEmitter {
    pub fn new(channel: Arc<OutboundChannel>, session_key: SessionKey) -> Self {
        Self {
            channel,
            session_key,
        }
    }

    pub fn channel(&self) -> &Arc<OutboundChannel> {
        &self.channel
    }

    /// Immediate feedback before any upstream byte arrives.
    pub async fn connecting(&self) -> bool {
        self.channel.send(OutboundEvent::connecting()).await
    }

    pub async fn fail(&self, err: &RelayError) -> RelayOutcome {
        tracing::warn!(session_key = %self.session_key, error = %err, "relay failed");
        let message = err.user_message();
        self.channel.finish(OutboundEvent::error(message.clone())).await;
        RelayOutcome::Failed(message)
    }

    /// Close with a `cancelled` completion without waiting on a stalled client.
    pub fn cancelled(&self) -> RelayOutcome {
        let delivered = self.channel.finish_now(OutboundEvent::complete("cancelled"));
        tracing::info!(session_key = %self.session_key, delivered, "relay cancelled");
        RelayOutcome::Cancelled
    }

    pub fn client_gone(&self, relayed: usize) -> RelayOutcome {
        tracing::info!(session_key = %self.session_key, relayed, "client disconnected, dropping upstream");
        self.channel.close();
        RelayOutcome::ClientGone
    }

    async fn completed(&self) -> RelayOutcome {
        self.channel.finish(OutboundEvent::complete("")).await;
        RelayOutcome::Completed
    }

    /// Run a terminal step, abandoning delivery if the token fires while the
    /// client is not reading.
    async fn terminal(
        &self,
        step: impl Future<Output = RelayOutcome>,
        cancel: &CancellationToken,
    ) -> RelayOutcome {
        tokio::select! {
            biased;
            outcome = step => outcome,
            _ = cancel.cancelled() => {
                tracing::info!(session_key = %self.session_key, "cancelled while delivering terminal event");
                self.channel.close();
                RelayOutcome::Cancelled
            }
        }
    }

    /// Drive the chunk stream to a terminal state. Reading stops as soon as
    /// a terminal event is emitted, the token fires or the client is gone.
    pub async fn relay<S>(&self, chunks: S, cancel: &CancellationToken) -> RelayOutcome
    where
        S: Stream<Item = Result<UpstreamChunk, RelayError>>,
    {
        futures::pin_mut!(chunks);
        let mut relayed = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(),
                _ = self.channel.client_gone() => return self.client_gone(relayed),
                next = chunks.next() => next,
            };

            let event = match next {
                Some(Ok(UpstreamChunk::Begin)) => OutboundEvent::begin(),
                Some(Ok(UpstreamChunk::Chunk(content))) => {
                    relayed += 1;
                    OutboundEvent::chunk(content_to_text(&content))
                }
                Some(Ok(UpstreamChunk::End)) => {
                    tracing::debug!(session_key = %self.session_key, relayed, "upstream signalled end");
                    return self.terminal(self.completed(), cancel).await;
                }
                Some(Ok(UpstreamChunk::Error(message))) => {
                    return self.terminal(self.fail(&RelayError::Upstream(message)), cancel).await;
                }
                Some(Err(e)) => return self.terminal(self.fail(&e), cancel).await,
                None => {
                    tracing::debug!(session_key = %self.session_key, relayed, "upstream closed without end record");
                    return self.terminal(self.completed(), cancel).await;
                }
            };

            // A full channel must not hide a cancel from a stalled client.
            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(),
                delivered = self.channel.send(event) => delivered,
            };
            if !delivered {
                return self.client_gone(relayed);
            }
        }
    }
}
