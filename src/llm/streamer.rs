//! One turn's chat exchange, streamed into text chunks

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ChatEvent, ChatMessage, ChatProvider, ChatRequest, FunctionCall, SentenceChunker, ToolCall,
};
use crate::pipeline::{Query, TextChunk};
use crate::tools::ToolRegistry;
use crate::{Error, Result};

/// Response streamer tuning
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Follow-up requests allowed after tool calls
    pub max_tool_rounds: u32,
    pub min_chunk_chars: usize,
    pub max_chunk_chars: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 4,
            min_chunk_chars: 4,
            max_chunk_chars: 120,
        }
    }
}

/// Tool call being assembled from streamed deltas
#[derive(Debug, Default, Clone)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Where chunks of one turn go
struct ChunkSink<'a> {
    turn_id: u64,
    seq: u64,
    tx: &'a mpsc::Sender<TextChunk>,
    closed: bool,
}

impl ChunkSink<'_> {
    /// Send a chunk; returns false if the turn was cancelled meanwhile
    async fn emit(&mut self, text: String, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if self.closed {
            return true;
        }

        let chunk = TextChunk {
            turn_id: self.turn_id,
            seq: self.seq,
            text,
        };
        tokio::select! {
            () = cancel.cancelled() => return false,
            sent = self.tx.send(chunk) => {
                if sent.is_err() {
                    tracing::debug!(turn_id = self.turn_id, "synthesis gone, no longer emitting chunks");
                    self.closed = true;
                }
            }
        }
        self.seq += 1;
        true
    }
}

/// Drives the model for one turn
///
/// Text is cut into [`TextChunk`]s as it streams. Tool calls are run through
/// the registry and their results fed back until the model answers in
/// text or the round budget is spent.
#[derive(Clone)]
pub struct ResponseStreamer {
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolRegistry>,
    config: StreamerConfig,
}

impl ResponseStreamer {
    #[must_use]
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        tools: Arc<ToolRegistry>,
        config: StreamerConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            config,
        }
    }

    /// Answer `query` on top of `history`, sending chunks to `chunks`
    ///
    /// Returns the full reply text, or `None` if `cancel` fired first. On
    /// cancellation the provider stream is dropped and nothing more is
    /// sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Llm`] or [`Error::Protocol`] if the provider fails
    #[allow(clippy::too_many_lines)]
    pub async fn run(
        &self,
        query: &Query,
        history: Vec<ChatMessage>,
        chunks: mpsc::Sender<TextChunk>,
        cancel: CancellationToken,
    ) -> Result<Option<String>> {
        let mut messages = history;
        messages.push(ChatMessage::user(query.text.clone()));

        let definitions = self.tools.definitions();
        let mut chunker =
            SentenceChunker::new(self.config.min_chunk_chars, self.config.max_chunk_chars);
        let mut sink = ChunkSink {
            turn_id: query.id,
            seq: 0,
            tx: &chunks,
            closed: false,
        };
        let mut full_response = String::new();

        for round in 0..=self.config.max_tool_rounds {
            let request = ChatRequest {
                messages: messages.clone(),
                tools: if round < self.config.max_tool_rounds {
                    definitions.clone()
                } else {
                    Vec::new()
                },
            };

            let mut stream = tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                stream = self.provider.stream_chat(&request) => stream?,
            };

            let mut round_text = String::new();
            let mut pending: Vec<PendingToolCall> = Vec::new();
            let finish_reason = loop {
                let event = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(None),
                    event = stream.next() => event,
                };

                match event {
                    Some(Ok(ChatEvent::ContentDelta(text))) => {
                        round_text.push_str(&text);
                        for piece in chunker.push(&text) {
                            if !sink.emit(piece, &cancel).await {
                                return Ok(None);
                            }
                        }
                    }
                    Some(Ok(ChatEvent::ToolCallStart { index, id, name })) => {
                        let idx = index as usize;
                        if idx >= pending.len() {
                            pending.resize_with(idx + 1, PendingToolCall::default);
                        }
                        pending[idx].id = id;
                        pending[idx].name = name;
                    }
                    Some(Ok(ChatEvent::ToolCallDelta { index, arguments })) => {
                        if let Some(call) = pending.get_mut(index as usize) {
                            call.arguments.push_str(&arguments);
                        }
                    }
                    Some(Ok(ChatEvent::Done { finish_reason })) => break finish_reason,
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(Error::Protocol(
                            "chat stream ended before completion".into(),
                        ));
                    }
                }
            };
            drop(stream);

            full_response.push_str(&round_text);
            pending.retain(|call| !call.name.is_empty());

            if finish_reason.as_deref() != Some("tool_calls") || pending.is_empty() {
                break;
            }
            if round == self.config.max_tool_rounds {
                tracing::warn!(turn_id = query.id, "tool round budget spent");
                break;
            }

            // Speak what was said before the tools run
            if let Some(piece) = chunker.flush()
                && !sink.emit(piece, &cancel).await
            {
                return Ok(None);
            }

            let tool_calls = pending
                .iter()
                .map(|call| ToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect();
            messages.push(ChatMessage::assistant_tool_calls(round_text, tool_calls));

            for call in pending {
                let registry = Arc::clone(&self.tools);
                let name = call.name.clone();
                let arguments = call.arguments.clone();
                let task = tokio::task::spawn_blocking(move || registry.invoke(&name, &arguments));

                let invocation = tokio::select! {
                    () = cancel.cancelled() => return Ok(None),
                    joined = task => joined
                        .map_err(|e| Error::Tool(format!("tool task failed: {e}")))?,
                };

                tracing::info!(
                    turn_id = query.id,
                    round,
                    tool = %invocation.name,
                    is_error = invocation.is_error(),
                    "tool call"
                );
                messages.push(ChatMessage::tool(call.id, invocation.content()));
            }
        }

        if let Some(piece) = chunker.flush()
            && !sink.emit(piece, &cancel).await
        {
            return Ok(None);
        }

        Ok(Some(full_response))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::{ChatStream, Role};
    use crate::tools::CalculatorTool;

    /// Replays one scripted event list per request and records requests
    struct Scripted {
        rounds: Mutex<VecDeque<Vec<Result<ChatEvent>>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl Scripted {
        fn new(rounds: Vec<Vec<Result<ChatEvent>>>) -> Arc<Self> {
            Arc::new(Self {
                rounds: Mutex::new(rounds.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatProvider for Scripted {
        async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
            self.requests.lock().unwrap().push(request.clone());
            let events = self
                .rounds
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::Llm("no more scripted rounds".into()))?;
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    fn text(s: &str) -> Result<ChatEvent> {
        Ok(ChatEvent::ContentDelta(s.to_string()))
    }

    fn done(reason: &str) -> Result<ChatEvent> {
        Ok(ChatEvent::Done {
            finish_reason: Some(reason.to_string()),
        })
    }

    fn query(text: &str) -> Query {
        Query {
            id: 7,
            text: text.to_string(),
            created_at: Instant::now(),
        }
    }

    fn streamer(provider: Arc<Scripted>) -> ResponseStreamer {
        let tools = ToolRegistry::new().with_tool(Arc::new(CalculatorTool));
        ResponseStreamer::new(provider, Arc::new(tools), StreamerConfig::default())
    }

    async fn collect(mut rx: mpsc::Receiver<TextChunk>) -> Vec<TextChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_plain_reply_is_chunked() {
        let provider = Scripted::new(vec![vec![
            text("你好，我是"),
            text("小爱。有什么"),
            text("可以帮你"),
            done("stop"),
        ]]);
        let (tx, rx) = mpsc::channel(16);

        let reply = streamer(provider)
            .run(&query("你好"), Vec::new(), tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.as_deref(), Some("你好，我是小爱。有什么可以帮你"));
        let chunks = collect(rx).await;
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["你好，我是小爱。", "有什么可以帮你"]);
        assert!(chunks.iter().all(|c| c.turn_id == 7));
        assert_eq!(chunks[1].seq, 1);
    }

    #[tokio::test]
    async fn test_tool_round_feeds_result_back() {
        let provider = Scripted::new(vec![
            vec![
                Ok(ChatEvent::ToolCallStart {
                    index: 0,
                    id: "call_1".to_string(),
                    name: "calculate".to_string(),
                }),
                Ok(ChatEvent::ToolCallDelta {
                    index: 0,
                    arguments: "{\"expression\":\"6*7\"}".to_string(),
                }),
                done("tool_calls"),
            ],
            vec![text("结果是42。"), done("stop")],
        ]);
        let (tx, rx) = mpsc::channel(16);

        let reply = streamer(Arc::clone(&provider))
            .run(&query("六乘七"), Vec::new(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("结果是42。"));
        assert_eq!(collect(rx).await.len(), 1);

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let follow_up = &requests[1].messages;
        assert_eq!(follow_up[1].role, Role::Assistant);
        assert_eq!(follow_up[1].tool_calls[0].function.name, "calculate");
        assert_eq!(follow_up[2].role, Role::Tool);
        assert_eq!(follow_up[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(follow_up[2].content.as_deref(), Some("计算结果：6*7 = 42"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let provider = Scripted::new(vec![
            vec![
                Ok(ChatEvent::ToolCallStart {
                    index: 0,
                    id: "call_1".to_string(),
                    name: "launch_rocket".to_string(),
                }),
                done("tool_calls"),
            ],
            vec![text("做不到。"), done("stop")],
        ]);
        let (tx, _rx) = mpsc::channel(16);

        let reply = streamer(Arc::clone(&provider))
            .run(&query("发射"), Vec::new(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("做不到。"));

        let requests = provider.requests.lock().unwrap();
        let content = requests[1].messages[2].content.clone().unwrap();
        assert!(content.starts_with("error: "));
    }

    #[tokio::test]
    async fn test_round_budget_withholds_tools() {
        let call = || {
            vec![
                Ok(ChatEvent::ToolCallStart {
                    index: 0,
                    id: "c".to_string(),
                    name: "calculate".to_string(),
                }),
                Ok(ChatEvent::ToolCallDelta {
                    index: 0,
                    arguments: "{\"expression\":\"1+1\"}".to_string(),
                }),
                done("tool_calls"),
            ]
        };
        let provider = Scripted::new(vec![call(), call(), vec![text("好了。"), done("stop")]]);
        let tools = ToolRegistry::new().with_tool(Arc::new(CalculatorTool));
        let streamer = ResponseStreamer::new(
            Arc::clone(&provider) as Arc<dyn ChatProvider>,
            Arc::new(tools),
            StreamerConfig {
                max_tool_rounds: 2,
                ..StreamerConfig::default()
            },
        );
        let (tx, _rx) = mpsc::channel(16);

        streamer
            .run(&query("算"), Vec::new(), tx, CancellationToken::new())
            .await
            .unwrap();

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(!requests[1].tools.is_empty());
        assert!(requests[2].tools.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_emits_nothing() {
        let provider = Scripted::new(vec![vec![text("很长的一句话。"), done("stop")]]);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let reply = streamer(provider)
            .run(&query("说话"), Vec::new(), tx, cancel)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert!(collect(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_fails_turn() {
        let provider = Scripted::new(vec![vec![
            text("半句"),
            Err(Error::Protocol("bad chunk".into())),
        ]]);
        let (tx, _rx) = mpsc::channel(16);

        let result = streamer(provider)
            .run(&query("hi"), Vec::new(), tx, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_history_comes_first() {
        let provider = Scripted::new(vec![vec![text("嗯。"), done("stop")]]);
        let (tx, _rx) = mpsc::channel(16);

        streamer(Arc::clone(&provider))
            .run(
                &query("然后呢"),
                vec![ChatMessage::system("sys"), ChatMessage::user("之前")],
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let requests = provider.requests.lock().unwrap();
        let messages = &requests[0].messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2], ChatMessage::user("然后呢"));
    }
}
