//! Streaming generation against the three provider protocol families.
//!
//! Each family module turns a [`GenerateRequest`] into an HTTP request and
//! folds decoded `data:` frames into a shared [`StreamAccumulator`]. The
//! adapter owns the read loop, retry of the initial request, and
//! cooperative cancellation.

use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::models::{fetch_catalog, supports_vision, ModelCatalog};
use crate::core::config::GenerationConfig;
use crate::core::message::{Attachment, AttachmentKind, Message};
use crate::core::providers::{ProviderFamily, ProviderIdentity};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::utils::auth::add_auth_headers;

mod anthropic;
mod native;
mod openai;

pub use native::{MODEL_FILLER, USER_FILLER};

pub const THINK_OPEN: &str = "<think>\n";
pub const THINK_CLOSE: &str = "\n</think>\n\n";

const MAX_ERROR_BODY_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Non-success HTTP status with the vendor's summarized message.
    Http { status: u16, message: String },
    Network(String),
    /// The request could not be built (bad URL, unencodable header).
    Request(String),
    /// An error frame inside an otherwise successful stream.
    Api(String),
    Decode(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Http { status, message } => write!(f, "HTTP {status}: {message}"),
            StreamError::Network(message) => write!(f, "network error: {message}"),
            StreamError::Request(message) => write!(f, "invalid request: {message}"),
            StreamError::Api(message) => write!(f, "API error: {message}"),
            StreamError::Decode(message) => write!(f, "invalid response: {message}"),
        }
    }
}

impl Error for StreamError {}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        // Gemini carries the key in the query string.
        let err = err.without_url();
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        if err.is_builder() {
            StreamError::Request(message)
        } else if err.is_decode() {
            StreamError::Decode(message)
        } else {
            StreamError::Network(message)
        }
    }
}

/// Running state of a generation, delivered once per applied frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Increment {
    /// Everything generated so far, not just the latest delta.
    pub text: String,
    pub metadata: Option<Value>,
}

/// How a generation ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model_id: String,
    pub turn_text: String,
    pub attachments: Vec<Attachment>,
    /// Prior turns, oldest first. Non-conversational turns are skipped.
    pub history: Vec<Message>,
    pub system_instruction: Option<String>,
    pub config: GenerationConfig,
}

impl GenerateRequest {
    pub(crate) fn system_instruction(&self) -> Option<&str> {
        self.system_instruction
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    pub(crate) fn conversational_history(&self) -> impl Iterator<Item = &Message> {
        self.history.iter().filter(|message| message.is_conversational())
    }
}

/// A backend the chat engine can drive.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_models(&self) -> Result<ModelCatalog, StreamError>;

    async fn stream_generate(
        &self,
        request: &GenerateRequest,
        on_increment: &mut (dyn FnMut(Increment) + Send),
        cancel: &CancellationToken,
    ) -> Result<Completion, StreamError>;
}

pub(crate) struct PreparedRequest {
    pub url: String,
    pub body: Vec<u8>,
}

pub(crate) fn encode_body<T: serde::Serialize>(
    url: String,
    body: &T,
) -> Result<PreparedRequest, StreamError> {
    let body = serde_json::to_vec(body).map_err(|err| StreamError::Request(err.to_string()))?;
    Ok(PreparedRequest { url, body })
}

#[derive(Clone, Debug)]
pub struct ProviderAdapter {
    client: reqwest::Client,
    identity: ProviderIdentity,
    retry: RetryPolicy,
}

impl ProviderAdapter {
    pub fn new(client: reqwest::Client, identity: ProviderIdentity, retry: RetryPolicy) -> Self {
        Self {
            client,
            identity,
            retry,
        }
    }

    pub fn identity(&self) -> &ProviderIdentity {
        &self.identity
    }

    fn prepare(&self, request: &GenerateRequest) -> Result<PreparedRequest, StreamError> {
        match self.identity.family {
            ProviderFamily::Native => native::prepare(&self.identity, request),
            ProviderFamily::OpenAiCompatible => openai::prepare(&self.identity, request),
            ProviderFamily::AnthropicCompatible => anthropic::prepare(&self.identity, request),
        }
    }

    async fn open_stream(
        &self,
        prepared: &PreparedRequest,
    ) -> Result<reqwest::Response, StreamError> {
        let request = self
            .client
            .post(&prepared.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .body(prepared.body.clone());
        let request = add_auth_headers(request, self.identity.family, &self.identity.api_key);

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(response_error(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for ProviderAdapter {
    async fn list_models(&self) -> Result<ModelCatalog, StreamError> {
        fetch_catalog(&self.client, &self.identity, &self.retry).await
    }

    async fn stream_generate(
        &self,
        request: &GenerateRequest,
        on_increment: &mut (dyn FnMut(Increment) + Send),
        cancel: &CancellationToken,
    ) -> Result<Completion, StreamError> {
        if cancel.is_cancelled() {
            return Ok(Completion::Cancelled);
        }

        let family = self.identity.family;
        let prepared = self.prepare(request)?;
        debug!(
            provider = %self.identity.provider_id,
            model = %request.model_id,
            history = request.history.len(),
            "starting generation"
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Completion::Cancelled),
            result = with_retry(&self.retry, || self.open_stream(&prepared)) => result?,
        };

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut accumulator = StreamAccumulator::default();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(provider = %self.identity.provider_id, "generation cancelled");
                    return Ok(Completion::Cancelled);
                }
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            lines.push(&chunk?);

            while let Some(line) = lines.next_line() {
                if cancel.is_cancelled() {
                    return Ok(Completion::Cancelled);
                }
                if let Some(increment) = apply_line(family, &mut accumulator, &line)? {
                    on_increment(increment);
                }
            }
        }

        if let Some(line) = lines.take_remainder() {
            if let Some(increment) = apply_line(family, &mut accumulator, &line)? {
                on_increment(increment);
            }
        }
        if let Some(increment) = accumulator.finish() {
            on_increment(increment);
        }
        Ok(Completion::Finished)
    }
}

fn apply_line(
    family: ProviderFamily,
    accumulator: &mut StreamAccumulator,
    line: &str,
) -> Result<Option<Increment>, StreamError> {
    match extract_data_payload(line) {
        Some(payload) => apply_payload(family, accumulator, payload),
        None => Ok(None),
    }
}

pub(crate) fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Fold one `data:` payload into the accumulator, returning the increment
/// to deliver, if any.
pub(crate) fn apply_payload(
    family: ProviderFamily,
    accumulator: &mut StreamAccumulator,
    payload: &str,
) -> Result<Option<Increment>, StreamError> {
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(None);
    }
    let emit = match family {
        ProviderFamily::Native => native::apply_frame(accumulator, payload)?,
        ProviderFamily::OpenAiCompatible => openai::apply_frame(accumulator, payload)?,
        ProviderFamily::AnthropicCompatible => anthropic::apply_frame(accumulator, payload)?,
    };
    Ok(emit.then(|| accumulator.snapshot()))
}

/// Splits a byte stream into trimmed text lines.
#[derive(Default)]
pub(crate) struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub(crate) fn next_line(&mut self) -> Option<String> {
        loop {
            let newline_pos = memchr(b'\n', &self.buffer)?;
            let line = std::str::from_utf8(&self.buffer[..newline_pos])
                .map(|text| text.trim().to_string());
            self.buffer.drain(..=newline_pos);
            match line {
                Ok(line) => return Some(line),
                Err(err) => warn!("skipping stream line with invalid UTF-8: {err}"),
            }
        }
    }

    /// Final unterminated line, if the body did not end with a newline.
    pub(crate) fn take_remainder(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Debug, Default)]
pub(crate) struct StreamAccumulator {
    text: String,
    metadata: Option<Value>,
    in_reasoning: bool,
}

impl StreamAccumulator {
    pub(crate) fn push_text(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if self.in_reasoning {
            self.text.push_str(THINK_CLOSE);
            self.in_reasoning = false;
        }
        self.text.push_str(delta);
    }

    pub(crate) fn push_reasoning(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if !self.in_reasoning {
            self.text.push_str(THINK_OPEN);
            self.in_reasoning = true;
        }
        self.text.push_str(delta);
    }

    /// Last seen wins.
    pub(crate) fn set_metadata(&mut self, metadata: Value) {
        self.metadata = Some(metadata);
    }

    pub(crate) fn len(&self) -> usize {
        self.text.len()
    }

    pub(crate) fn snapshot(&self) -> Increment {
        Increment {
            text: self.text.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Close a reasoning block left open by the end of the stream.
    pub(crate) fn finish(&mut self) -> Option<Increment> {
        if !self.in_reasoning {
            return None;
        }
        self.text.push_str(THINK_CLOSE);
        self.in_reasoning = false;
        Some(self.snapshot())
    }
}

/// Image attachments the model can receive inline. Everything else is
/// dropped with a warning; only the Gemini family takes other media.
pub(crate) fn inline_images<'a>(
    family: ProviderFamily,
    model_id: &str,
    attachments: &'a [Attachment],
) -> Vec<&'a Attachment> {
    let vision = supports_vision(family, model_id);
    attachments
        .iter()
        .filter(|attachment| {
            let keep = vision && attachment.kind == AttachmentKind::Image;
            if !keep {
                warn!(
                    model = model_id,
                    mime_type = %attachment.mime_type,
                    "dropping attachment the model cannot receive"
                );
            }
            keep
        })
        .collect()
}

pub(crate) async fn response_error(response: reqwest::Response) -> StreamError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = summarize_error_body(&body)
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_else(|| "request failed".to_string());
    StreamError::Http {
        status: status.as_u16(),
        message,
    }
}

/// The vendor's own error message from a JSON error body, or the trimmed
/// raw text otherwise.
pub(crate) fn summarize_error_body(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&value) {
            return Some(summary);
        }
    }
    Some(truncate(trimmed, MAX_ERROR_BODY_CHARS))
}

pub(crate) fn extract_error_summary(value: &Value) -> Option<String> {
    // Gemini wraps non-streamed errors in a one-element array.
    let value = match value {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let summary = value
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| match value.get("error") {
            Some(Value::String(text)) => Some(text.clone()),
            _ => None,
        })
        .or_else(|| value.get("message").and_then(Value::as_str).map(str::to_owned))?;

    let collapsed = summary.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}…", &text[..index]),
        None => text.to_string(),
    }
}

/// Separate `<think>` blocks from the visible answer.
///
/// Returns `(reasoning, answer)`. An unterminated block counts as reasoning
/// up to the end of the text.
pub fn split_reasoning(text: &str) -> (String, String) {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let mut reasoning = String::new();
    let mut answer = String::new();
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        answer.push_str(&rest[..start]);
        let inner = &rest[start + OPEN.len()..];
        match inner.find(CLOSE) {
            Some(end) => {
                push_section(&mut reasoning, &inner[..end]);
                rest = &inner[end + CLOSE.len()..];
            }
            None => {
                push_section(&mut reasoning, inner);
                rest = "";
            }
        }
    }
    answer.push_str(rest);

    (reasoning, answer.trim().to_string())
}

fn push_section(out: &mut String, section: &str) {
    let section = section.trim();
    if section.is_empty() {
        return;
    }
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(section);
}
