//! OpenAI-compatible streaming chat completions

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{ChatEvent, ChatMessage, ChatProvider, ChatRequest, ChatStream};
use crate::tools::ToolDefinition;
use crate::{Error, Result};

/// Chat endpoint configuration
#[derive(Debug, Clone)]
pub struct OpenAiChatConfig {
    /// API base, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Streams completions from `POST {base_url}/chat/completions`
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    client: reqwest::Client,
    config: OpenAiChatConfig,
}

impl OpenAiChat {
    /// Create a provider
    ///
    /// # Errors
    ///
    /// Returns error if the API key or model is empty
    pub fn new(config: OpenAiChatConfig) -> Result<Self> {
        if config.api_key.expose_secret().is_empty() {
            return Err(Error::Config("API key required for chat".to_string()));
        }
        if config.model.trim().is_empty() {
            return Err(Error::Config("chat model name required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            config,
        })
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[derive(serde::Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(serde::Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolDefinition,
}

#[async_trait]
impl ChatProvider for OpenAiChat {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        let body = WireRequest {
            model: &self.config.model,
            messages: &request.messages,
            stream: true,
            tools: request
                .tools
                .iter()
                .map(|function| WireTool {
                    kind: "function",
                    function,
                })
                .collect(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        tracing::debug!(
            model = %self.config.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "chat request"
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("chat request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("chat error {status}: {body}")));
        }

        Ok(sse_events(response.bytes_stream()))
    }
}

/// Turn a raw SSE body into completion events
///
/// The stream ends after `Done`; a body that closes before the completion
/// finished yields a [`Error::Protocol`].
pub fn sse_events<S, B, E>(body: S) -> ChatStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Send + 'static,
    Error: From<E>,
{
    struct State<S> {
        body: std::pin::Pin<Box<S>>,
        parser: SseParser,
        closed: bool,
    }

    let state = State {
        body: Box::pin(body),
        parser: SseParser::new(),
        closed: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.parser.next_event() {
                return Some((Ok(event), state));
            }
            if state.closed || state.parser.is_finished() {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    if let Err(e) = state.parser.push(bytes.as_ref()) {
                        state.closed = true;
                        return Some((Err(e), state));
                    }
                }
                Some(Err(e)) => {
                    state.closed = true;
                    return Some((Err(Error::from(e)), state));
                }
                None => {
                    state.closed = true;
                    if let Err(e) = state.parser.finish() {
                        return Some((Err(e), state));
                    }
                }
            }
        }
    }))
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallChunk {
    index: u32,
    id: Option<String>,
    function: Option<FunctionChunk>,
}

#[derive(Debug, Deserialize)]
struct FunctionChunk {
    name: Option<String>,
    arguments: Option<String>,
}

/// Incremental parser for `data:` lines of a chat-completions SSE body
#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    events: VecDeque<ChatEvent>,
    finished: bool,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw body bytes
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for malformed lines and [`Error::Llm`]
    /// for an error object sent mid-stream
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        for &byte in bytes {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.parse_line(&line)?;
            } else {
                self.line.push(byte);
            }
        }
        Ok(())
    }

    /// The body closed
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the completion never finished
    pub fn finish(&mut self) -> Result<()> {
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.parse_line(&line)?;
        }
        if self.finished {
            Ok(())
        } else {
            Err(Error::Protocol("chat stream ended before completion".into()))
        }
    }

    /// Next parsed event, if any
    pub fn next_event(&mut self) -> Option<ChatEvent> {
        self.events.pop_front()
    }

    /// Whether `Done` has been produced
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    fn parse_line(&mut self, raw: &[u8]) -> Result<()> {
        let line = std::str::from_utf8(raw)
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in chat stream: {e}")))?
            .trim_end_matches('\r');

        let Some(data) = line.strip_prefix("data:") else {
            // blank separators, comments, event names
            return Ok(());
        };
        let data = data.trim();

        if self.finished || data.is_empty() {
            return Ok(());
        }
        if data == "[DONE]" {
            self.finish_with(None);
            return Ok(());
        }

        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|e| Error::Protocol(format!("bad chat chunk: {e}")))?;

        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string);
            return Err(Error::Llm(message));
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };

        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content
                && !content.is_empty()
            {
                self.events.push_back(ChatEvent::ContentDelta(content));
            }

            for call in delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = call
                    .function
                    .map(|f| (f.name, f.arguments))
                    .unwrap_or_default();

                if let Some(name) = name {
                    self.events.push_back(ChatEvent::ToolCallStart {
                        index: call.index,
                        id: call.id.unwrap_or_default(),
                        name,
                    });
                }
                if let Some(arguments) = arguments
                    && !arguments.is_empty()
                {
                    self.events.push_back(ChatEvent::ToolCallDelta {
                        index: call.index,
                        arguments,
                    });
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.finish_with(Some(reason));
        }

        Ok(())
    }

    fn finish_with(&mut self, finish_reason: Option<String>) {
        self.finished = true;
        self.events.push_back(ChatEvent::Done { finish_reason });
    }
}
