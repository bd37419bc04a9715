//! Streaming chat completion clients.
//!
//! Two wire formats are supported behind [`CompletionService`]:
//! OpenAI-compatible server-sent events and Ollama's newline-delimited JSON.
//! Both are decoded line by line from the raw byte stream, so a delta split
//! across network packets still arrives whole.

use crate::config::{CompletionConfig, CompletionProvider};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// Ordered text deltas for one turn. Ends when the reply is complete.
pub type FragmentStream = Pin<Box<dyn Stream<Item = VoiceResult<String>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// System prompt plus a single user message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub user_message: String,
}

impl ChatRequest {
    pub fn new(system_prompt: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
        }
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        vec![
            ChatMessage {
                role: "system",
                content: self.system_prompt.clone(),
            },
            ChatMessage {
                role: "user",
                content: self.user_message.clone(),
            },
        ]
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Start a streamed reply. Connection and status failures surface here;
    /// failures mid-stream surface as `Err` items.
    async fn stream_chat(&self, request: ChatRequest) -> VoiceResult<FragmentStream>;

    fn name(&self) -> &str;
}

/// Build the client named by the config.
pub fn create_completion_service(config: &CompletionConfig) -> VoiceResult<Arc<dyn CompletionService>> {
    let service: Arc<dyn CompletionService> = match config.provider {
        CompletionProvider::OpenAiCompatible => Arc::new(OpenAiCompatClient::from_config(config)?),
        CompletionProvider::Ollama => Arc::new(OllamaClient::from_config(config)?),
    };
    info!(provider = service.name(), model = %config.model, "completion service ready");
    Ok(service)
}

/// What one decoded line means for the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Delta(String),
    Done,
    Skip,
    Failed(String),
}

/// Splits a byte stream into lines, holding partial lines (and partial
/// UTF-8 sequences) until their newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            lines.push(text.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Whatever is left once the stream ends without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

/// One SSE line from `/chat/completions`.
pub fn parse_sse_line(line: &str) -> LineOutcome {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return LineOutcome::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return LineOutcome::Done;
    }
    let json: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "skipping undecodable SSE payload");
            return LineOutcome::Skip;
        }
    };
    if let Some(message) = json["error"]["message"].as_str() {
        return LineOutcome::Failed(message.to_string());
    }
    match json["choices"][0]["delta"]["content"].as_str() {
        Some(delta) if !delta.is_empty() => LineOutcome::Delta(delta.to_string()),
        _ => LineOutcome::Skip,
    }
}

/// One NDJSON line from Ollama `/api/chat`.
pub fn parse_ndjson_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Skip;
    }
    let json: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return LineOutcome::Failed(format!("malformed stream line: {e}")),
    };
    if let Some(error) = json["error"].as_str() {
        return LineOutcome::Failed(error.to_string());
    }
    let content = json["message"]["content"].as_str().unwrap_or_default();
    if json["done"].as_bool().unwrap_or(false) {
        // The closing object may still carry a last piece of text.
        return if content.is_empty() {
            LineOutcome::Done
        } else {
            LineOutcome::Delta(content.to_string())
        };
    }
    if content.is_empty() {
        LineOutcome::Skip
    } else {
        LineOutcome::Delta(content.to_string())
    }
}

struct DecodeState<S> {
    bytes: Pin<Box<S>>,
    lines: LineBuffer,
    ready: VecDeque<VoiceResult<String>>,
    finished: bool,
}

impl<S> DecodeState<S> {
    fn absorb(&mut self, line: &str, decode: fn(&str) -> LineOutcome) {
        if self.finished {
            return;
        }
        match decode(line) {
            LineOutcome::Delta(text) => self.ready.push_back(Ok(text)),
            LineOutcome::Skip => {}
            LineOutcome::Done => self.finished = true,
            LineOutcome::Failed(message) => {
                self.ready.push_back(Err(VoiceError::Completion(message)));
                self.finished = true;
            }
        }
    }
}

/// Decode a raw body stream into text deltas using `decode` per line.
pub fn decode_stream<S, B, E>(bytes: S, decode: fn(&str) -> LineOutcome) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        lines: LineBuffer::default(),
        ready: VecDeque::new(),
        finished: false,
    };

    let deltas = stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for line in state.lines.push(chunk.as_ref()) {
                        state.absorb(&line, decode);
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(VoiceError::Completion(format!("stream interrupted: {e}"))), state));
                }
                None => {
                    if let Some(line) = state.lines.finish() {
                        state.absorb(&line, decode);
                    }
                    state.finished = true;
                }
            }
        }
    });
    Box::pin(deltas)
}

fn build_http_client(config: &CompletionConfig) -> VoiceResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| VoiceError::Config(format!("HTTP client: {e}")))
}

async fn check_status(response: reqwest::Response) -> VoiceResult<reqwest::Response> {
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(VoiceError::RateLimited);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(VoiceError::CompletionStatus {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// `/chat/completions` with `stream: true` (OpenAI, DeepSeek, gateways).
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl OpenAiCompatClient {
    pub fn from_config(config: &CompletionConfig) -> VoiceResult<Self> {
        Ok(Self {
            client: build_http_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.resolved_api_key(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompatClient {
    async fn stream_chat(&self, request: ChatRequest) -> VoiceResult<FragmentStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": request.messages(),
            "stream": true,
            "temperature": self.temperature,
        });

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| VoiceError::Completion(format!("request to {url} failed: {e}")))?;
        let response = check_status(response).await?;
        Ok(decode_stream(response.bytes_stream(), parse_sse_line))
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

/// Ollama `/api/chat` with `stream: true`.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaClient {
    pub fn from_config(config: &CompletionConfig) -> VoiceResult<Self> {
        Ok(Self {
            client: build_http_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl CompletionService for OllamaClient {
    async fn stream_chat(&self, request: ChatRequest) -> VoiceResult<FragmentStream> {
        let url = format!("{}/api/chat", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": request.messages(),
            "stream": true,
            "options": { "temperature": self.temperature },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Completion(format!("request to {url} failed: {e}")))?;
        let response = check_status(response).await?;
        Ok(decode_stream(response.bytes_stream(), parse_ndjson_line))
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(parts: Vec<&'static str>) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send {
        stream::iter(parts.into_iter().map(|p| Ok(p.as_bytes().to_vec())))
    }

    async fn collect(stream: FragmentStream) -> Vec<VoiceResult<String>> {
        stream.collect().await
    }

    #[test]
    fn sse_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            LineOutcome::Delta("Hi".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), LineOutcome::Done);
        assert_eq!(parse_sse_line(": keep-alive"), LineOutcome::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            LineOutcome::Skip
        );
    }

    #[test]
    fn ndjson_lines() {
        assert_eq!(
            parse_ndjson_line(r#"{"message":{"role":"assistant","content":"你好"},"done":false}"#),
            LineOutcome::Delta("你好".into())
        );
        assert_eq!(
            parse_ndjson_line(r#"{"message":{"role":"assistant","content":""},"done":true}"#),
            LineOutcome::Done
        );
        assert!(matches!(parse_ndjson_line(r#"{"error":"model not found"}"#), LineOutcome::Failed(_)));
    }

    #[test]
    fn line_buffer_holds_partial_utf8() {
        let mut buf = LineBuffer::default();
        let bytes = "好\n".as_bytes();
        assert!(buf.push(&bytes[..1]).is_empty());
        assert_eq!(buf.push(&bytes[1..]), vec!["好".to_string()]);
        assert_eq!(buf.finish(), None);
    }

    #[tokio::test]
    async fn sse_deltas_split_across_packets() {
        let stream = decode_stream(
            byte_stream(vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel",
                "lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n",
                "data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
            ]),
            parse_sse_line,
        );
        let items: Vec<String> = collect(stream).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(items, vec!["Hello", " world"]);
    }

    #[tokio::test]
    async fn ndjson_without_trailing_newline() {
        let stream = decode_stream(
            byte_stream(vec![
                "{\"message\":{\"content\":\"A\"},\"done\":false}\n",
                "{\"message\":{\"content\":\"B\"},\"done\":false}",
            ]),
            parse_ndjson_line,
        );
        let items: Vec<String> = collect(stream).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(items, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn transport_error_ends_stream_with_error() {
        let parts: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"{\"message\":{\"content\":\"A\"},\"done\":false}\n".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(b"{\"message\":{\"content\":\"B\"},\"done\":false}\n".to_vec()),
        ];
        let items = collect(decode_stream(stream::iter(parts), parse_ndjson_line)).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "A");
        assert!(matches!(items[1], Err(VoiceError::Completion(_))));
    }

    #[test]
    fn request_has_system_then_user() {
        let messages = ChatRequest::new("be brief", "hello").messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test]
    async fn unreachable_server_is_a_completion_error() {
        let config = CompletionConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout_secs: 2,
            ..CompletionConfig::default()
        };
        let client = OllamaClient::from_config(&config).unwrap();
        let err = match client.stream_chat(ChatRequest::new("s", "u")).await {
            Ok(_) => panic!("port 9 should refuse connections"),
            Err(e) => e,
        };
        assert!(err.is_upstream());
    }
}
