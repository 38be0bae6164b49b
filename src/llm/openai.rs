//! `OpenAI`-compatible chat completions transport.

use super::{ChatMessage, Completion, CompletionRequest, CompletionTransport, FragmentStream};
use crate::config::LlmConfig;
use crate::{Error, ErrorKind, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::time::Duration;

/// Longest slice of an error body carried into an error message.
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Blocking transport for `{base_url}/chat/completions`.
pub struct OpenAiTransport {
    api_key: Option<SecretString>,
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl OpenAiTransport {
    /// Default API endpoint.
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.openai.com/v1";

    /// Creates a transport from model configuration.
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            endpoint: config.base_url.trim_end_matches('/').to_string(),
            client: build_http_client(Duration::from_millis(config.timeout_ms)),
        }
    }

    /// Sets the API key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    /// Sets the API endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn send(&self, request: &CompletionRequest) -> Result<reqwest::blocking::Response> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::ai(ErrorKind::Client, "OPENAI_API_KEY not set"))?;

        let body = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            response_format: request
                .structured_output
                .then_some(ResponseFormat { kind: "json_object" }),
            stream: request.stream,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .header(
                "Authorization",
                format!("Bearer {}", api_key.expose_secret()),
            )
            .json(&body)
            .send()
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(classify_status(status.as_u16(), &body))
    }
}

impl Default for OpenAiTransport {
    fn default() -> Self {
        Self::from_config(&LlmConfig::default())
    }
}

impl CompletionTransport for OpenAiTransport {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let response: ChatCompletionResponse = self
            .send(request)?
            .json()
            .map_err(|e| classify_transport_error(&e))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content);
        Ok(Completion {
            content,
            prompt_tokens: response.usage.as_ref().map(|u| u.prompt_tokens),
            completion_tokens: response.usage.as_ref().map(|u| u.completion_tokens),
        })
    }

    fn stream(&self, request: &CompletionRequest) -> Result<FragmentStream> {
        let response = self.send(request)?;
        Ok(Box::new(SseFragments::new(BufReader::new(response))))
    }
}

/// Maps a non-success HTTP status to an error kind.
///
/// Authentication and other 4xx failures are client errors, except 408
/// (timeout) and 429 (remote rate limiting, treated as a server error).
#[must_use]
pub fn classify_status(status: u16, body: &str) -> Error {
    let detail: String = body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
    let (kind, label) = match status {
        401 | 403 => (ErrorKind::Client, "authentication failed"),
        408 => (ErrorKind::Timeout, "request timed out"),
        429 => (ErrorKind::Server, "rate limited"),
        400..=499 => (ErrorKind::Client, "request rejected"),
        500..=599 => (ErrorKind::Server, "server error"),
        _ => (ErrorKind::Server, "unexpected status"),
    };
    Error::ai(kind, format!("{label} (HTTP {status}): {detail}"))
}

fn classify_transport_error(err: &reqwest::Error) -> Error {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_decode() {
        ErrorKind::Parse
    } else {
        ErrorKind::Server
    };
    Error::ai(kind, err.to_string())
}

fn build_http_client(timeout: Duration) -> reqwest::blocking::Client {
    let mut builder = reqwest::blocking::Client::builder();
    if !timeout.is_zero() {
        builder = builder.timeout(timeout);
    }
    builder.build().unwrap_or_else(|err| {
        tracing::warn!("Failed to build completion HTTP client: {err}");
        reqwest::blocking::Client::new()
    })
}

/// Server-Sent Events reader yielding the text delta of each chunk.
///
/// Ends at `data: [DONE]` or end of input. After the first error it yields
/// nothing more.
pub struct SseFragments<R> {
    reader: R,
    line: String,
    finished: bool,
}

impl<R: BufRead> SseFragments<R> {
    /// Wraps a buffered event stream.
    pub const fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            finished: false,
        }
    }

    fn next_fragment(&mut self) -> Option<Result<String>> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {},
                Err(e) => {
                    let kind = match e.kind() {
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                            ErrorKind::Timeout
                        },
                        _ => ErrorKind::Server,
                    };
                    return Some(Err(Error::ai(kind, format!("stream read failed: {e}"))));
                },
            }

            let Some(payload) = self.line.trim().strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                return None;
            }

            let chunk: StreamChunk = match serde_json::from_str(payload) {
                Ok(chunk) => chunk,
                Err(e) => {
                    return Some(Err(Error::ai(
                        ErrorKind::Parse,
                        format!("malformed stream chunk: {e}"),
                    )));
                },
            };
            if let Some(error) = chunk.error {
                return Some(Err(Error::ai(ErrorKind::Server, error.message)));
            }
            let text = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .unwrap_or_default();
            if !text.is_empty() {
                return Some(Ok(text));
            }
        }
    }
}

impl<R: BufRead> Iterator for SseFragments<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let item = self.next_fragment();
        if !matches!(item, Some(Ok(_))) {
            self.finished = true;
        }
        item
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    message: String,
}
