//! Shared fixtures for unit tests: a sleeper that records instead of
//! waiting, a scripted chat backend, and a one-shot HTTP mock server.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::models::ModelCatalog;
use crate::core::chat_stream::{ChatBackend, Completion, GenerateRequest, Increment, StreamError};
use crate::core::providers::{ProviderFamily, ProviderIdentity};
use crate::core::retry::Sleeper;

#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

pub fn test_identity(family: ProviderFamily, base_url: &str) -> ProviderIdentity {
    ProviderIdentity {
        provider_id: "test".to_string(),
        display_name: "Test".to_string(),
        family,
        api_key: "test-key".to_string(),
        base_url: base_url.to_string(),
    }
}

/// A client that never routes through an ambient proxy.
pub fn test_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("test client should build")
}

#[derive(Debug, Clone)]
pub enum Step {
    /// Deliver this accumulated text.
    Emit(String),
    EmitWithMetadata(String, Value),
    /// Block until notified, or until cancelled when the script honors it.
    Wait(Arc<Notify>),
    Fail(StreamError),
}

#[derive(Debug, Clone)]
pub struct Script {
    pub steps: Vec<Step>,
    /// When false the backend keeps going after cancellation, like a
    /// transport that only notices at the next read.
    pub honor_cancel: bool,
}

impl Script {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            honor_cancel: true,
        }
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }
}

/// Plays one [`Script`] per `stream_generate` call, in order, and records
/// the requests it was given.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn list_models(&self) -> Result<ModelCatalog, StreamError> {
        Ok(ModelCatalog {
            models: Vec::new(),
            platform_label: "Scripted".to_string(),
            balance: None,
        })
    }

    async fn stream_generate(
        &self,
        request: &GenerateRequest,
        on_increment: &mut (dyn FnMut(Increment) + Send),
        cancel: &CancellationToken,
    ) -> Result<Completion, StreamError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::new(Vec::new()));

        for step in script.steps {
            if script.honor_cancel && cancel.is_cancelled() {
                return Ok(Completion::Cancelled);
            }
            match step {
                Step::Emit(text) => on_increment(Increment {
                    text,
                    metadata: None,
                }),
                Step::EmitWithMetadata(text, metadata) => on_increment(Increment {
                    text,
                    metadata: Some(metadata),
                }),
                Step::Wait(notify) => {
                    if script.honor_cancel {
                        tokio::select! {
                            _ = notify.notified() => {}
                            _ = cancel.cancelled() => return Ok(Completion::Cancelled),
                        }
                    } else {
                        notify.notified().await;
                    }
                }
                Step::Fail(err) => return Err(err),
            }
        }
        Ok(Completion::Finished)
    }
}

pub struct MockResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
    /// Sent after the delay, on the same connection, once `body` is out.
    pub trailer: Option<(Duration, String)>,
}

impl MockResponse {
    /// An event stream with one `data:` frame per entry.
    pub fn sse(frames: &[&str]) -> Self {
        let body = frames
            .iter()
            .map(|frame| format!("data: {frame}\n\n"))
            .collect();
        Self {
            status: 200,
            content_type: "text/event-stream",
            body,
            trailer: None,
        }
    }

    /// Hold `frames` back for `delay` after the rest of the stream.
    pub fn with_late_frames(mut self, delay: Duration, frames: &[&str]) -> Self {
        let late = frames
            .iter()
            .map(|frame| format!("data: {frame}\n\n"))
            .collect();
        self.trailer = Some((delay, late));
        self
    }

    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
            trailer: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("request body should be JSON")
    }
}

/// Serve `responses` on successive connections, one each, then stop.
/// Returns the base URL and a handle yielding the captured requests.
pub async fn spawn_mock_server(
    responses: Vec<MockResponse>,
) -> (String, JoinHandle<Result<Vec<CapturedRequest>, String>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("local addr should resolve");

    let handle = tokio::spawn(async move {
        let mut captured = Vec::new();
        for response in responses {
            let (mut stream, _) = listener.accept().await.map_err(|err| err.to_string())?;
            captured.push(read_http_request(&mut stream).await?);

            let trailer_len = response
                .trailer
                .as_ref()
                .map_or(0, |(_, late)| late.len());
            let head = format!(
                "HTTP/1.1 {} {}\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                response.status,
                if response.status < 400 { "OK" } else { "Error" },
                response.content_type,
                response.body.len() + trailer_len
            );
            stream
                .write_all(head.as_bytes())
                .await
                .map_err(|err| err.to_string())?;
            stream
                .write_all(response.body.as_bytes())
                .await
                .map_err(|err| err.to_string())?;
            if let Some((delay, late)) = response.trailer {
                let _ = stream.flush().await;
                tokio::time::sleep(delay).await;
                // The client may have hung up by now.
                let _ = stream.write_all(late.as_bytes()).await;
            }
            let _ = stream.shutdown().await;
        }
        Ok(captured)
    });

    (format!("http://{addr}"), handle)
}

async fn read_http_request(stream: &mut TcpStream) -> Result<CapturedRequest, String> {
    let mut buffer = Vec::new();
    let mut header_end = None;
    while header_end.is_none() {
        let mut chunk = [0_u8; 1024];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP headers".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|index| index + 4);
    }

    let header_end = header_end.expect("header end should exist");
    let header_text =
        std::str::from_utf8(&buffer[..header_end]).map_err(|err| err.to_string())?;
    let mut lines = header_text.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| "Missing HTTP request line".to_string())?
        .to_string();

    let mut headers = Vec::new();
    let mut content_length = 0_usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().map_err(|err| err.to_string())?;
        }
        headers.push((name.to_string(), value));
    }

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0_u8; content_length - body.len()];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP body".to_string());
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        request_line,
        headers,
        body,
    })
}
