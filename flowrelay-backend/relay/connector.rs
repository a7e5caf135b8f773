use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{header, Client};
use serde::Serialize;

use super::error::RelayError;
use super::parser::{chunk_stream, UpstreamChunkParser};
use super::UpstreamChunk;
use crate::session_key::SessionKey;

/// Raw upstream body, as delivered by the transport.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>;

const USER_AGENT: &str = "flowrelay";
const ACCEPT_STREAM: &str = "text/event-stream, application/x-ndjson, application/json";
const MOBILE_MARKERS: [&str; 8] = [
    "mobi",
    "android",
    "iphone",
    "ipad",
    "ipod",
    "opera mini",
    "iemobile",
    "blackberry",
];

/// Coarse client class derived from the user agent. Only used to pick
/// tuning defaults; a spoofed agent just gets the other tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientClass {
    Mobile,
    Desktop,
}

impl ClientClass {
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        let Some(ua) = user_agent else {
            return ClientClass::Desktop;
        };
        let ua = ua.to_ascii_lowercase();
        if MOBILE_MARKERS.iter().any(|m| ua.contains(m)) {
            ClientClass::Mobile
        } else {
            ClientClass::Desktop
        }
    }
}

/// Per-class timeout and buffer sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPolicy {
    pub class: ClientClass,
    pub timeout: Duration,
    pub soft_ceiling: usize,
    pub hard_ceiling: usize,
}

impl StreamPolicy {
    pub fn new(class: ClientClass, timeout: Duration, soft_ceiling: usize, hard_ceiling: usize) -> Self {
        let soft_ceiling = soft_ceiling.max(1);
        Self {
            class,
            timeout,
            soft_ceiling,
            hard_ceiling: hard_ceiling.max(soft_ceiling),
        }
    }
}

/// Small binary attachment, still base64-encoded as the client sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: String,
    #[serde(skip)]
    pub size: usize,
}

/// A validated question, ready to be sent upstream.
#[derive(Debug, Clone)]
pub struct QuestionRequest {
    pub question: String,
    pub request_type: String,
    pub ai_model: Option<String>,
    pub agent_models: Option<BTreeMap<String, String>>,
    pub session_key: SessionKey,
    pub attachment: Option<Attachment>,
    pub searching: bool,
    pub user_id: String,
}

/// Body posted to the automation backend webhook.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamPayload {
    pub action: &'static str,
    pub session_id: String,
    pub chat_input: String,
    pub metadata: UpstreamMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamMetadata {
    #[serde(rename = "type")]
    pub request_type: String,
    pub ai_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_models: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<Attachment>,
    pub searching: bool,
    pub user_id: String,
}

impl UpstreamPayload {
    pub fn from_request(request: &QuestionRequest) -> Self {
        Self {
            action: "sendMessage",
            session_id: request.session_key.to_string(),
            chat_input: request.question.clone(),
            metadata: UpstreamMetadata {
                request_type: request.request_type.clone(),
                ai_model: request.ai_model.clone(),
                agent_models: request.agent_models.clone(),
                file: request.attachment.clone(),
                searching: request.searching,
                user_id: request.user_id.clone(),
            },
        }
    }
}

/// The external workflow engine. Implemented over HTTP in production and
/// by in-memory fakes in tests.
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    /// Start a request and hand back the body as it arrives.
    async fn open_stream(
        &self,
        payload: &UpstreamPayload,
        timeout: Duration,
    ) -> Result<ByteStream, RelayError>;

    /// Start a request and read the whole body.
    async fn fetch(&self, payload: &UpstreamPayload, timeout: Duration) -> Result<Bytes, RelayError>;
}

pub struct HttpAutomationBackend {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpAutomationBackend {
    pub fn new(client: Client, url: String, token: Option<String>) -> Self {
        Self { client, url, token }
    }

    async fn send(
        &self,
        payload: &UpstreamPayload,
        timeout: Duration,
    ) -> Result<reqwest::Response, RelayError> {
        let mut req = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT, ACCEPT_STREAM)
            .json(payload);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl AutomationBackend for HttpAutomationBackend {
    async fn open_stream(
        &self,
        payload: &UpstreamPayload,
        timeout: Duration,
    ) -> Result<ByteStream, RelayError> {
        let resp = self.send(payload, timeout).await?;
        tracing::debug!(
            content_type = ?resp.headers().get(header::CONTENT_TYPE),
            "upstream stream opened"
        );
        Ok(Box::pin(resp.bytes_stream().map(|r| r.map_err(RelayError::from))))
    }

    async fn fetch(&self, payload: &UpstreamPayload, timeout: Duration) -> Result<Bytes, RelayError> {
        let resp = self.send(payload, timeout).await?;
        Ok(resp.bytes().await?)
    }
}

/// An open upstream connection plus the policy it was opened with.
pub struct UpstreamConnection {
    pub bytes: ByteStream,
    pub policy: StreamPolicy,
}

impl UpstreamConnection {
    pub fn into_chunks(self) -> impl Stream<Item = Result<UpstreamChunk, RelayError>> + Send {
        let parser = UpstreamChunkParser::for_policy(&self.policy);
        chunk_stream(self.bytes, parser)
    }
}

/// Opens upstream connections with the right policy for the caller.
/// One instance per process, shared through `AppState`.
pub struct StreamingConnector {
    backend: Arc<dyn AutomationBackend>,
    mobile: StreamPolicy,
    desktop: StreamPolicy,
}

impl StreamingConnector {
    pub fn new(backend: Arc<dyn AutomationBackend>, mobile: StreamPolicy, desktop: StreamPolicy) -> Self {
        Self {
            backend,
            mobile,
            desktop,
        }
    }

    pub fn policy_for(&self, user_agent: Option<&str>) -> &StreamPolicy {
        match ClientClass::from_user_agent(user_agent) {
            ClientClass::Mobile => &self.mobile,
            ClientClass::Desktop => &self.desktop,
        }
    }

    #[tracing::instrument(skip_all, fields(session_key = %request.session_key))]
    pub async fn connect(
        &self,
        request: &QuestionRequest,
        user_agent: Option<&str>,
    ) -> Result<UpstreamConnection, RelayError> {
        let policy = self.policy_for(user_agent).clone();
        let payload = UpstreamPayload::from_request(request);
        tracing::info!(
            class = ?policy.class,
            timeout_secs = policy.timeout.as_secs(),
            "opening upstream stream"
        );
        let bytes = self.backend.open_stream(&payload, policy.timeout).await?;
        Ok(UpstreamConnection { bytes, policy })
    }

    #[tracing::instrument(skip_all, fields(session_key = %request.session_key))]
    pub async fn fetch(
        &self,
        request: &QuestionRequest,
        user_agent: Option<&str>,
    ) -> Result<(Bytes, StreamPolicy), RelayError> {
        let policy = self.policy_for(user_agent).clone();
        let payload = UpstreamPayload::from_request(request);
        tracing::info!(class = ?policy.class, "sending upstream request");
        let body = self.backend.fetch(&payload, policy.timeout).await?;
        Ok((body, policy))
    }
}
