//! Chat completion and response streaming
//!
//! [`ChatProvider`] is the seam to the model; [`ResponseStreamer`] drives
//! one turn's exchange over it, running tool rounds and cutting the reply
//! into speakable chunks as tokens arrive.

mod chunker;
mod history;
mod openai;
mod streamer;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

pub use chunker::SentenceChunker;
pub use history::Conversation;
pub use openai::{OpenAiChat, OpenAiChatConfig, SseParser, sse_events};
pub use streamer::{ResponseStreamer, StreamerConfig};

use crate::Result;
use crate::tools::ToolDefinition;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call the assistant made, as echoed back in the next request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

/// Function name and raw JSON arguments of a [`ToolCall`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// One message in the chat-completions wire shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Assistant message that requested tool calls
    ///
    /// Empty `content` is sent as `null`, which providers expect when the
    /// model went straight to the tools.
    #[must_use]
    pub fn assistant_tool_calls(content: String, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: (!content.is_empty()).then_some(content),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Result of the tool call `tool_call_id`
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Provider-independent request for one streamed completion
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Tools offered for this round; empty disables tool calling
    pub tools: Vec<ToolDefinition>,
}

/// Incremental output of a streamed completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Reply text
    ContentDelta(String),
    /// The model started tool call `index`
    ToolCallStart { index: u32, id: String, name: String },
    /// More argument JSON for tool call `index`
    ToolCallDelta { index: u32, arguments: String },
    /// The completion finished; `tool_calls` means a tool round is due
    Done { finish_reason: Option<String> },
}

/// Boxed stream of completion events
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatEvent>> + Send>>;

/// A streaming chat-completion backend
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Start a streamed completion
    ///
    /// Dropping the returned stream abandons the request.
    ///
    /// # Errors
    ///
    /// Returns error if the request is rejected before streaming starts
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let message = ChatMessage::assistant_tool_calls(
            String::new(),
            vec![ToolCall {
                id: "call_1".to_string(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: "get_current_time".to_string(),
                    arguments: "{}".to_string(),
                },
            }],
        );

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["role"], "assistant");
        assert!(value["content"].is_null());
        assert_eq!(value["tool_calls"][0]["type"], "function");
        assert_eq!(value["tool_calls"][0]["function"]["name"], "get_current_time");
        assert!(value.get("tool_call_id").is_none());
    }

    #[test]
    fn test_tool_message() {
        let value = serde_json::to_value(ChatMessage::tool("call_1", "ok")).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_1");
        assert!(value.get("tool_calls").is_none());
    }
}
