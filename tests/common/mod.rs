//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;

use voxhook::llm::{ChatEvent, ChatProvider, ChatRequest, ChatStream};
use voxhook::pipeline::{PipelineEvent, Query};
use voxhook::voice::{AudioFormat, AudioSink, SpeechSynthesizer, SynthesisSession, VolumeControl};
use voxhook::{Error, Result};

/// How long a test waits for a pipeline event before failing
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Chat provider replaying one scripted round per request
///
/// A round without a `Done` event stalls after its last event, the way a
/// slow model keeps the connection open.
#[derive(Default)]
pub struct ScriptedChat {
    rounds: Mutex<VecDeque<Vec<ChatEvent>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn new(rounds: Vec<Vec<ChatEvent>>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        self.requests.lock().unwrap().push(request.clone());
        let events = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Llm("no more scripted rounds".into()))?;

        let finished = events.iter().any(|e| matches!(e, ChatEvent::Done { .. }));
        let stream = futures::stream::iter(events.into_iter().map(Ok));
        if finished {
            Ok(Box::pin(stream))
        } else {
            Ok(Box::pin(stream.chain(futures::stream::pending())))
        }
    }
}

pub fn text(s: &str) -> ChatEvent {
    ChatEvent::ContentDelta(s.to_string())
}

pub fn done(reason: &str) -> ChatEvent {
    ChatEvent::Done {
        finish_reason: Some(reason.to_string()),
    }
}

/// Events of a round that calls `name` once
pub fn tool_call(id: &str, name: &str, arguments: &str) -> Vec<ChatEvent> {
    vec![
        ChatEvent::ToolCallStart {
            index: 0,
            id: id.to_string(),
            name: name.to_string(),
        },
        ChatEvent::ToolCallDelta {
            index: 0,
            arguments: arguments.to_string(),
        },
        done("tool_calls"),
    ]
}

/// Synthesizer turning each text chunk into one 16-bit PCM block
#[derive(Default)]
pub struct EchoSynth {
    submitted: Arc<Mutex<Vec<String>>>,
}

impl EchoSynth {
    /// Every chunk synthesized so far
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for EchoSynth {
    async fn open(&self, _format: &AudioFormat) -> Result<SynthesisSession> {
        let ((text_tx, audio_rx), (mut text_rx, audio_tx)) = SynthesisSession::channels();
        let submitted = Arc::clone(&self.submitted);
        let task = tokio::spawn(async move {
            while let Some(text) = text_rx.recv().await {
                let pcm: Vec<u8> = text.bytes().flat_map(|b| [b, 0]).collect();
                submitted.lock().unwrap().push(text);
                if audio_tx.send(Ok(pcm)).await.is_err() {
                    return;
                }
            }
        });
        Ok(SynthesisSession::new(text_tx, audio_rx, Some(task)))
    }
}

/// What a [`RecordingSink`] saw
#[derive(Debug, Default)]
pub struct SinkLog {
    pub open: bool,
    pub samples: usize,
    pub opens: usize,
    pub releases: usize,
    pub flushes: usize,
}

/// Sink that plays instantly and counts everything
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub log: Arc<Mutex<SinkLog>>,
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn open(&mut self, _sample_rate: u32) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if !log.open {
            log.open = true;
            log.opens += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.log.lock().unwrap().open
    }

    fn write(&mut self, samples: &[f32]) -> usize {
        self.log.lock().unwrap().samples += samples.len();
        samples.len()
    }

    fn pending(&self) -> usize {
        0
    }

    fn flush(&mut self) {
        self.log.lock().unwrap().flushes += 1;
    }

    async fn release(&mut self) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.open = false;
        log.releases += 1;
        Ok(())
    }
}

/// Volume control that records every change
#[derive(Default)]
pub struct FakeVolume {
    pub changes: Mutex<Vec<u8>>,
}

impl VolumeControl for FakeVolume {
    fn set_percent(&self, percent: u8) -> Result<u8> {
        let percent = percent.min(100);
        self.changes.lock().unwrap().push(percent);
        Ok(percent)
    }

    fn percent(&self) -> u8 {
        self.changes.lock().unwrap().last().copied().unwrap_or(50)
    }
}

pub fn query(id: u64, text: &str) -> Query {
    Query {
        id,
        text: text.to_string(),
        created_at: Instant::now(),
    }
}

/// Collect events until `stop` matches, failing after [`EVENT_TIMEOUT`]
pub async fn events_until(
    rx: &mut broadcast::Receiver<PipelineEvent>,
    stop: impl Fn(&PipelineEvent) -> bool,
) -> Vec<PipelineEvent> {
    let mut seen = Vec::new();
    let finished = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            let last = stop(&event);
            seen.push(event);
            if last {
                return;
            }
        }
    })
    .await
    .is_ok();
    assert!(finished, "timed out; events so far: {seen:?}");
    seen
}
