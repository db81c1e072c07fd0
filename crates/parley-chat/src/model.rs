//! Model-inference boundary.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use parley_types::models::Role;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Generated text, one delta at a time.
pub type TextDeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system: String,
    pub temperature: f32,
    pub messages: Vec<PromptMessage>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate_text(&self, request: GenerateRequest) -> Result<String>;

    async fn stream_text(&self, request: GenerateRequest) -> Result<TextDeltaStream>;
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).context("Invalid API key format")?,
        );

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn build_body(request: &GenerateRequest, stream: bool) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system }));
        }
        messages.extend(
            request
                .messages
                .iter()
                .map(|m| json!({ "role": m.role.as_str(), "content": m.content })),
        );

        json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": stream,
        })
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .context("Failed to send request to model API")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Model API request failed - status: {status}, body: {text}");
            return Err(anyhow!("Model API request failed with status {status}"));
        }
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
}

/// Interpret one line of an SSE body. Comments, blank lines and chunks
/// without text yield `None`.
fn parse_sse_line(line: &str) -> Result<Option<SseLine>> {
    let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(Some(SseLine::Done));
    }

    let chunk: StreamChunk = serde_json::from_str(data).context("Malformed stream chunk")?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty())
        .map(SseLine::Delta))
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn generate_text(&self, request: GenerateRequest) -> Result<String> {
        let body = Self::build_body(&request, false);
        let response: CompletionResponse = self
            .send(&body)
            .await?
            .json()
            .await
            .context("Failed to parse model API response")?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("Model returned no content"))
    }

    async fn stream_text(&self, request: GenerateRequest) -> Result<TextDeltaStream> {
        let body = Self::build_body(&request, true);
        let response = self.send(&body).await?;
        Ok(Box::pin(sse_deltas(response.bytes_stream(), request.model)))
    }
}

/// Decode an SSE byte stream into text deltas. The body must end with the
/// `[DONE]` marker; a stream that stops short is an error, since the reply it
/// carried is truncated.
fn sse_deltas<S, B, E>(bytes: S, model: String) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    async_stream::try_stream! {
        let mut bytes = std::pin::pin!(bytes);
        let mut buffer: VecDeque<u8> = VecDeque::with_capacity(8192);
        let mut done = false;

        'outer: while let Some(chunk) = bytes.next().await {
            buffer.extend(chunk.context("Model stream interrupted")?.as_ref());

            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(line.trim_end_matches('\n'))? {
                    Some(SseLine::Delta(text)) => {
                        yield text;
                    }
                    Some(SseLine::Done) => {
                        done = true;
                        break 'outer;
                    }
                    None => {}
                }
            }
        }

        // The last line may arrive without a trailing newline.
        if !done && !buffer.is_empty() {
            let rest: Vec<u8> = buffer.drain(..).collect();
            match parse_sse_line(&String::from_utf8_lossy(&rest))? {
                Some(SseLine::Delta(text)) => {
                    yield text;
                }
                Some(SseLine::Done) => done = true,
                None => {}
            }
        }

        if !done {
            warn!("Model stream for {} closed before [DONE]", model);
            Err::<(), _>(anyhow!("Model stream for {model} ended before completion"))?;
        }
        debug!("Model stream for {} ended", model);
    }
}
