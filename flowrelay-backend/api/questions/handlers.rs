use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use super::request::{CancelBody, QuestionBody};
use crate::api::auth::AuthUser;
use crate::api::AppState;
use crate::cancel;
use crate::relay::error::RelayError;
use crate::relay::long_poll::{describe_ceiling, run_long_poll, LongPollOutcome};
use crate::relay::session::start_stream;
use crate::session_key::SessionKey;

pub const SESSION_KEY_HEADER: HeaderName = HeaderName::from_static("x-session-key");
const ACCEL_BUFFERING_HEADER: HeaderName = HeaderName::from_static("x-accel-buffering");
/// Non-standard "client closed request", used for cancelled long polls.
const CLIENT_CLOSED_REQUEST: u16 = 499;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: impl ToString) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.to_string() })))
}

/// Any body that does not decode into a question is a client error.
fn question_body(body: Result<Json<QuestionBody>, JsonRejection>) -> Result<QuestionBody, ApiError> {
    body.map(|Json(body)| body).map_err(|rejection| {
        tracing::debug!(error = %rejection, "rejected question body");
        bad_request(rejection.body_text())
    })
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// POST /submit-question-stream: relay the answer as server-sent events.
#[tracing::instrument(skip_all, fields(session_key))]
pub(crate) async fn submit_question_stream(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    body: Result<Json<QuestionBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = question_body(body)?
        .validate(&user, state.config.max_attachment_bytes)
        .map_err(bad_request)?;
    let key = request.session_key.clone();
    tracing::Span::current().record("session_key", key.as_str());
    tracing::info!(
        request_type = %request.request_type,
        attachment_bytes = request.attachment.as_ref().map(|a| a.size),
        "starting stream session"
    );

    let key_header = HeaderValue::from_str(key.as_str()).map_err(|e| {
        tracing::error!(error = %e, "session key is not a valid header value");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "invalid session key" })))
    })?;

    let rx = start_stream(&state.relay, request, user_agent(&headers)).await;
    let events = ReceiverStream::new(rx).map(|event| Ok::<Event, Infallible>(event.to_sse()));
    let sse = Sse::new(events).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)));

    let mut response = sse.into_response();
    let out = response.headers_mut();
    out.insert(SESSION_KEY_HEADER, key_header);
    out.insert(ACCEL_BUFFERING_HEADER, HeaderValue::from_static("no"));
    out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

/// POST /submit-question: wait for the whole answer.
#[tracing::instrument(skip_all, fields(session_key))]
pub(crate) async fn submit_question(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    body: Result<Json<QuestionBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = question_body(body)?
        .validate(&user, state.config.max_attachment_bytes)
        .map_err(bad_request)?;
    let key = request.session_key.clone();
    tracing::Span::current().record("session_key", key.as_str());
    tracing::info!(
        request_type = %request.request_type,
        attachment_bytes = request.attachment.as_ref().map(|a| a.size),
        "starting long poll"
    );

    match run_long_poll(&state.relay, request, user_agent(&headers)).await {
        LongPollOutcome::Answer(answer) => Ok(Json(json!({
            "answer": answer,
            "sessionId": key.as_str(),
        }))),
        LongPollOutcome::Cancelled => {
            let status = StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::REQUEST_TIMEOUT);
            Err((
                status,
                Json(json!({ "error": RelayError::Cancelled.user_message(), "sessionId": key.as_str() })),
            ))
        }
        LongPollOutcome::TimedOut => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": format!(
                    "No answer within {}. The request timed out, please try again.",
                    describe_ceiling(state.relay.long_poll_ceiling)
                ),
                "sessionId": key.as_str(),
            })),
        )),
        LongPollOutcome::Failed(e) => {
            tracing::error!(error = %e, "long poll failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.user_message(), "sessionId": key.as_str() })),
            ))
        }
    }
}

/// POST /cancel-request: always answers success so callers cannot discover
/// which sessions exist.
pub(crate) async fn cancel_request(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    let key = serde_json::from_slice::<CancelBody>(&body)
        .ok()
        .and_then(|b| b.session_id)
        .and_then(|raw| SessionKey::parse(&raw));

    match key {
        Some(key) => {
            cancel::request_cancel(&state.relay.registry, state.relay.store.as_ref(), &key).await;
        }
        None => tracing::debug!("cancel request without a usable session id"),
    }

    Json(json!({ "success": true, "message": "Cancellation requested" }))
}
