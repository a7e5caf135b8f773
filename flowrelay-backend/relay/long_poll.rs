use std::time::Duration;

use serde_json::Value;
use tokio::task::AbortHandle;

use super::connector::{QuestionRequest, StreamPolicy};
use super::error::RelayError;
use super::parser::{content_to_text, parse_body};
use super::session::{Lease, RelayContext};
use super::UpstreamChunk;
use crate::cancel;

const ANSWER_FIELDS: [&str; 4] = ["output", "answer", "text", "content"];

/// How a long-poll request was resolved.
#[derive(Debug)]
pub enum LongPollOutcome {
    Answer(String),
    Cancelled,
    TimedOut,
    Failed(RelayError),
}

/// Send the question upstream and wait for the whole answer, checking for
/// cancellation every poll interval. Resolves as `TimedOut` once the
/// ceiling elapses without an answer.
///
/// Dropping the returned future (the client hung up) aborts the upstream
/// call and releases the session.
#[tracing::instrument(skip_all, fields(session_key = %request.session_key))]
pub async fn run_long_poll(
    ctx: &RelayContext,
    request: QuestionRequest,
    user_agent: Option<String>,
) -> LongPollOutcome {
    let lease = ctx.register(&request.session_key).await;
    let token = lease.token.clone();
    let key = lease.key.clone();

    let connector = ctx.connector.clone();
    let mut call = tokio::spawn(async move { connector.fetch(&request, user_agent.as_deref()).await });
    let guard = AbandonGuard {
        ctx: ctx.clone(),
        lease: Some(lease),
        call: call.abort_handle(),
    };

    let started = tokio::time::Instant::now();
    let deadline = started + ctx.long_poll_ceiling;
    let mut ticker = tokio::time::interval(ctx.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut polls = 0u32;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                call.abort();
                break LongPollOutcome::Cancelled;
            }
            joined = &mut call => {
                break match joined {
                    Ok(Ok((body, policy))) => match extract_answer(&body, &policy) {
                        Ok(answer) => LongPollOutcome::Answer(answer),
                        Err(e) => LongPollOutcome::Failed(e),
                    },
                    Ok(Err(RelayError::Timeout)) => LongPollOutcome::TimedOut,
                    Ok(Err(e)) => LongPollOutcome::Failed(e),
                    Err(join_err) => LongPollOutcome::Failed(RelayError::Transport(join_err.to_string())),
                };
            }
            _ = tokio::time::sleep_until(deadline) => {
                call.abort();
                tracing::warn!(elapsed_secs = started.elapsed().as_secs(), "long poll hit ceiling");
                break LongPollOutcome::TimedOut;
            }
            _ = ticker.tick() => {
                polls += 1;
                if cancel::flagged(ctx.store.as_ref(), &key).await {
                    call.abort();
                    break LongPollOutcome::Cancelled;
                }
            }
        }
    };

    guard.release().await;
    tracing::info!(polls, elapsed_ms = started.elapsed().as_millis() as u64, ?outcome, "long poll finished");
    outcome
}

/// Owns a long poll's registration until it resolves. If the poll is
/// dropped first, the upstream call is aborted and the session released.
struct AbandonGuard {
    ctx: RelayContext,
    lease: Option<Lease>,
    call: AbortHandle,
}

impl AbandonGuard {
    async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            self.ctx.release(&lease).await;
        }
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        self.call.abort();
        tracing::info!(session_key = %lease.key, "long poll abandoned by client, releasing session");
        if !self.ctx.registry.cleanup(&lease.key, lease.id) {
            return;
        }
        let store = self.ctx.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.cleanup(&lease.key).await {
                        tracing::warn!(session_key = %lease.key, error = %e, "failed to clean up cancellation flag");
                    }
                });
            }
            Err(_) => tracing::warn!(session_key = %lease.key, "no runtime to clean up cancellation flag"),
        }
    }
}

/// Turn a complete upstream body into answer text.
///
/// Bodies made of typed records have their chunk contents concatenated;
/// anything else is read as a JSON object (or a one-element array of one)
/// carrying the answer in a well-known field, or as plain text.
pub fn extract_answer(body: &[u8], policy: &StreamPolicy) -> Result<String, RelayError> {
    let chunks = parse_body(body, policy);
    let mut answer = String::new();
    let mut saw_chunk = false;
    for chunk in chunks {
        match chunk {
            UpstreamChunk::Chunk(content) => {
                saw_chunk = true;
                answer.push_str(&content_to_text(&content));
            }
            UpstreamChunk::Error(message) => return Err(RelayError::Upstream(message)),
            UpstreamChunk::Begin | UpstreamChunk::End => {}
        }
    }
    if saw_chunk {
        return Ok(answer);
    }

    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some(text) = answer_field(&value) {
            return Ok(text);
        }
    }
    Ok(String::from_utf8_lossy(body).trim().to_string())
}

fn answer_field(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => ANSWER_FIELDS
            .iter()
            .find_map(|field| map.get(*field))
            .map(content_to_text),
        Value::Array(items) => items.first().and_then(answer_field),
        _ => None,
    }
}

/// Short human-readable form of the long-poll ceiling, for timeout messages.
pub fn describe_ceiling(ceiling: Duration) -> String {
    let secs = ceiling.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{} min", secs / 60)
    } else {
        format!("{secs} s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cancel::memory_repository::MemoryCancellationStore;
    use crate::cancel::registry::CancellationRegistry;
    use crate::relay::connector::tests::{policies, request, FakeBackend};
    use crate::relay::connector::StreamingConnector;
    use crate::session_key::SessionKey;

    fn context(backend: FakeBackend, poll: Duration, ceiling: Duration) -> RelayContext {
        let (mobile, desktop) = policies();
        RelayContext {
            connector: Arc::new(StreamingConnector::new(Arc::new(backend), mobile, desktop)),
            registry: Arc::new(CancellationRegistry::new()),
            store: Arc::new(MemoryCancellationStore::new()),
            poll_interval: poll,
            long_poll_ceiling: ceiling,
            outbound_capacity: 8,
        }
    }

    fn desktop() -> StreamPolicy {
        policies().1
    }

    #[tokio::test]
    async fn returns_answer_from_records() {
        let ctx = context(
            FakeBackend::new(vec![Ok(
                "{\"type\":\"begin\"}\n{\"type\":\"item\",\"content\":\"Refunds \"}\n{\"type\":\"item\",\"content\":\"take 5 days.\"}\n{\"type\":\"end\"}\n",
            )]),
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        match run_long_poll(&ctx, request("lp-1"), None).await {
            LongPollOutcome::Answer(answer) => assert_eq!(answer, "Refunds take 5 days."),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(ctx.registry.get(&SessionKey::parse("lp-1").unwrap()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_poll_reports_cancelled() {
        let mut backend = FakeBackend::new(vec![Ok("{\"output\":\"too late\"}")]);
        backend.delay = Some(Duration::from_secs(60));
        let ctx = context(backend, Duration::from_secs(2), Duration::from_secs(300));
        let key = SessionKey::parse("lp-cancel").unwrap();

        let poll = tokio::spawn({
            let ctx = ctx.clone();
            async move { run_long_poll(&ctx, request("lp-cancel"), None).await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        // A different instance: only the shared store is touched.
        ctx.store.mark_cancelled(&key).await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = poll.await.unwrap();
        assert!(matches!(outcome, LongPollOutcome::Cancelled), "got {outcome:?}");
        assert!(started.elapsed() <= Duration::from_secs(2));
        assert!(!ctx.store.is_cancelled(&key).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn local_cancel_is_immediate() {
        let mut backend = FakeBackend::new(vec![Ok("{\"output\":\"too late\"}")]);
        backend.delay = Some(Duration::from_secs(60));
        let ctx = context(backend, Duration::from_secs(2), Duration::from_secs(300));
        let key = SessionKey::parse("lp-local").unwrap();

        let poll = tokio::spawn({
            let ctx = ctx.clone();
            async move { run_long_poll(&ctx, request("lp-local"), None).await }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(ctx.registry.is_active(&key));
        assert!(cancel::request_cancel(&ctx.registry, ctx.store.as_ref(), &key).await);

        assert!(matches!(poll.await.unwrap(), LongPollOutcome::Cancelled));
        assert!(ctx.registry.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_resolves_as_timeout() {
        let mut backend = FakeBackend::new(vec![Ok("{\"output\":\"never\"}")]);
        backend.delay = Some(Duration::from_secs(3600));
        let ctx = context(backend, Duration::from_secs(2), Duration::from_secs(300));

        let outcome = run_long_poll(&ctx, request("lp-timeout"), None).await;
        assert!(matches!(outcome, LongPollOutcome::TimedOut), "got {outcome:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_poll_releases_session() {
        let mut backend = FakeBackend::new(vec![Ok("{\"output\":\"nobody listening\"}")]);
        backend.delay = Some(Duration::from_secs(60));
        let ctx = context(backend, Duration::from_secs(2), Duration::from_secs(300));
        let key = SessionKey::parse("lp-drop").unwrap();

        let poll = tokio::spawn({
            let ctx = ctx.clone();
            async move { run_long_poll(&ctx, request("lp-drop"), None).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(ctx.registry.is_active(&key));
        ctx.store.mark_cancelled(&key).await.unwrap();

        // The handler future is dropped when the client disconnects.
        poll.abort();
        assert!(poll.await.unwrap_err().is_cancelled());
        assert!(ctx.registry.get(&key).is_none());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(ctx.registry.get(&key).is_none());
        assert!(!ctx.store.is_cancelled(&key).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn reused_key_supersedes_running_poll() {
        let mut backend = FakeBackend::new(vec![Ok("{\"output\":\"second answer\"}")]);
        backend.delay = Some(Duration::from_secs(10));
        let ctx = context(backend, Duration::from_secs(2), Duration::from_secs(300));

        let first = tokio::spawn({
            let ctx = ctx.clone();
            async move { run_long_poll(&ctx, request("lp-dup"), None).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = run_long_poll(&ctx, request("lp-dup"), None).await;

        assert!(matches!(first.await.unwrap(), LongPollOutcome::Cancelled));
        assert!(matches!(second, LongPollOutcome::Answer(ref a) if a == "second answer"));
        assert!(ctx.registry.get(&SessionKey::parse("lp-dup").unwrap()).is_none());
    }

    #[tokio::test]
    async fn upstream_failure_is_failed() {
        let mut backend = FakeBackend::new(vec![]);
        backend.fail_connect = true;
        let ctx = context(backend, Duration::from_millis(10), Duration::from_secs(5));
        let outcome = run_long_poll(&ctx, request("lp-fail"), None).await;
        assert!(matches!(outcome, LongPollOutcome::Failed(RelayError::Connect(_))));
    }

    #[test]
    fn extracts_json_fields() {
        let policy = desktop();
        assert_eq!(extract_answer(br#"{"output":"from output"}"#, &policy).unwrap(), "from output");
        assert_eq!(extract_answer(br#"{"answer":"from answer"}"#, &policy).unwrap(), "from answer");
        assert_eq!(extract_answer(br#"[{"text":"first item"}]"#, &policy).unwrap(), "first item");
        assert_eq!(
            extract_answer(br#"{"content":{"rows":2}}"#, &policy).unwrap(),
            "{\"rows\":2}"
        );
    }

    #[test]
    fn falls_back_to_raw_text() {
        let policy = desktop();
        assert_eq!(extract_answer(b"  plain answer\n", &policy).unwrap(), "plain answer");
        assert_eq!(extract_answer(br#"{"unrelated":true}"#, &policy).unwrap(), r#"{"unrelated":true}"#);
    }

    #[test]
    fn error_record_fails_extraction() {
        let body = b"{\"type\":\"error\",\"content\":\"workflow crashed\"}\n";
        let err = extract_answer(body, &desktop()).unwrap_err();
        assert!(matches!(err, RelayError::Upstream(ref m) if m == "workflow crashed"));
    }

    #[test]
    fn ceiling_description() {
        assert_eq!(describe_ceiling(Duration::from_secs(300)), "5 min");
        assert_eq!(describe_ceiling(Duration::from_secs(90)), "90 s");
    }
}
