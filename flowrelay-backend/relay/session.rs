use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connector::{QuestionRequest, StreamingConnector};
use super::emitter::{OutboundChannel, RelayEmitter, RelayOutcome};
use super::OutboundEvent;
use crate::cancel::{self, registry::CancellationRegistry, repository::CancellationStore};
use crate::session_key::SessionKey;

/// Everything a session needs from the process, cheap to clone.
#[derive(Clone)]
pub struct RelayContext {
    pub connector: Arc<StreamingConnector>,
    pub registry: Arc<CancellationRegistry>,
    pub store: Arc<dyn CancellationStore>,
    pub poll_interval: Duration,
    pub long_poll_ceiling: Duration,
    pub outbound_capacity: usize,
}

/// One session's claim on its key, handed back on release.
#[derive(Debug, Clone)]
pub(crate) struct Lease {
    pub key: SessionKey,
    pub id: u64,
    pub token: CancellationToken,
}

impl RelayContext {
    /// Clear any stale flag left for `key` and register a fresh token.
    pub(crate) async fn register(&self, key: &SessionKey) -> Lease {
        if let Err(e) = self.store.cleanup(key).await {
            tracing::warn!(session_key = %key, error = %e, "failed to clear stale cancellation flag");
        }
        let token = CancellationToken::new();
        let id = self.registry.register(key, token.clone());
        Lease {
            key: key.clone(),
            id,
            token,
        }
    }

    pub(crate) async fn release(&self, lease: &Lease) {
        cancel::release(&self.registry, self.store.as_ref(), &lease.key, lease.id).await;
    }
}

/// Start a streaming session in the background and hand back the receiving
/// end of its outbound channel. Dropping the receiver aborts the upstream.
pub async fn start_stream(
    ctx: &RelayContext,
    request: QuestionRequest,
    user_agent: Option<String>,
) -> mpsc::Receiver<OutboundEvent> {
    let lease = ctx.register(&request.session_key).await;
    let (channel, rx) = OutboundChannel::new(ctx.outbound_capacity);
    tokio::spawn(run_stream_session(ctx.clone(), request, user_agent, channel, lease));
    rx
}

#[tracing::instrument(skip_all, fields(session_key = %request.session_key))]
async fn run_stream_session(
    ctx: RelayContext,
    request: QuestionRequest,
    user_agent: Option<String>,
    channel: Arc<OutboundChannel>,
    lease: Lease,
) -> RelayOutcome {
    let watcher = cancel::watch_store(
        ctx.store.clone(),
        lease.key.clone(),
        lease.token.clone(),
        ctx.poll_interval,
    );
    let emitter = RelayEmitter::new(channel, lease.key.clone());

    let outcome = relay_session(&ctx.connector, &emitter, &request, user_agent.as_deref(), &lease.token).await;

    watcher.abort();
    ctx.release(&lease).await;
    tracing::info!(
        ?outcome,
        completion_sent = emitter.channel().completion_sent(),
        "stream session finished"
    );
    outcome
}

/// Connect and relay one session to a terminal state.
pub async fn relay_session(
    connector: &StreamingConnector,
    emitter: &RelayEmitter,
    request: &QuestionRequest,
    user_agent: Option<&str>,
    token: &CancellationToken,
) -> RelayOutcome {
    if !emitter.connecting().await {
        return emitter.client_gone(0);
    }

    let connected = tokio::select! {
        biased;
        _ = token.cancelled() => return emitter.cancelled(),
        _ = emitter.channel().client_gone() => return emitter.client_gone(0),
        connected = connector.connect(request, user_agent) => connected,
    };

    match connected {
        Ok(connection) => emitter.relay(connection.into_chunks(), token).await,
        Err(e) => emitter.fail(&e).await,
    }
}
