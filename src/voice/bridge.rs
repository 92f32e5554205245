//! Synthesis bridge
//!
//! Forwards one turn's text chunks into a single streaming synthesis
//! session and the session's audio into playback, both directions at once.
//! Text waiting for room in the session is queued locally so audio keeps
//! draining while the provider is busy. The session opens lazily on the
//! first chunk so a reply that is pure tool chatter never touches the
//! provider.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{AudioFormat, PlaybackHandle, SpeechSynthesizer, SynthesisSession};
use crate::pipeline::{ActiveQuery, AudioFrame, TextChunk};
use crate::{Error, Result};

/// Chunks held for the session before the bridge stops reading more
const PENDING_CHUNKS: usize = 8;

/// Everything one turn's bridge needs
pub struct BridgeTask {
    pub turn_id: u64,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub format: AudioFormat,
    pub playback: PlaybackHandle,
    pub gate: ActiveQuery,
    /// Fired when the first frame is handed to playback
    pub first_frame: Option<oneshot::Sender<()>>,
}

impl BridgeTask {
    /// Pump `chunks` through synthesis into playback
    ///
    /// Returns the number of frames forwarded. On cancellation the session
    /// is dropped, buffered audio is discarded, and the count so far is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tts`] if the provider fails or closes early
    pub async fn run(
        mut self,
        mut chunks: mpsc::Receiver<TextChunk>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let started = Instant::now();
        let mut session: Option<SynthesisSession> = None;
        let mut input: Option<mpsc::Sender<String>> = None;
        let mut pending: VecDeque<String> = VecDeque::new();
        let mut chunks_open = true;
        let mut seq: u64 = 0;

        loop {
            if !chunks_open && pending.is_empty() {
                // Closing the text side lets the provider wind down
                input = None;
                if session.is_none() {
                    return Ok(0);
                }
            }

            tokio::select! {
                biased;

                () = cancel.cancelled() => return Ok(self.cancelled(seq)),

                audio = next_audio(&mut session) => match audio {
                    Some(Ok(data)) => {
                        if !self.gate.is_current(self.turn_id) {
                            tracing::debug!(turn_id = self.turn_id, "turn superseded, dropping synthesis");
                            return Ok(seq);
                        }
                        if seq == 0 {
                            tracing::info!(
                                turn_id = self.turn_id,
                                first_audio_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                                "first audio"
                            );
                            if let Some(signal) = self.first_frame.take() {
                                let _ = signal.send(());
                            }
                        }
                        let frame = AudioFrame { turn_id: self.turn_id, seq, data };
                        tokio::select! {
                            () = cancel.cancelled() => return Ok(self.cancelled(seq)),
                            played = self.playback.play(frame) => played?,
                        }
                        seq += 1;
                    }
                    Some(Err(e)) => return Err(e),
                    None if input.is_some() => {
                        return Err(Error::Tts("synthesis session closed early".into()));
                    }
                    None => {
                        tracing::debug!(turn_id = self.turn_id, frames = seq, "synthesis finished");
                        return Ok(seq);
                    }
                },

                sent = submit_next(input.as_ref(), &mut pending), if !pending.is_empty() => sent?,

                chunk = chunks.recv(), if chunks_open && pending.len() < PENDING_CHUNKS => match chunk {
                    Some(chunk) => {
                        if session.is_none() {
                            tracing::debug!(turn_id = self.turn_id, "opening synthesis session");
                            let mut opened = tokio::select! {
                                () = cancel.cancelled() => return Ok(self.cancelled(seq)),
                                opened = self.synthesizer.open(&self.format) => opened?,
                            };
                            input = opened.take_input();
                            session = Some(opened);
                        }
                        pending.push_back(chunk.text);
                    }
                    None => chunks_open = false,
                },
            }
        }
    }

    fn cancelled(&self, frames: u64) -> u64 {
        tracing::debug!(turn_id = self.turn_id, frames, "synthesis cancelled");
        frames
    }
}

/// Next audio block, or never if no session is open
async fn next_audio(session: &mut Option<SynthesisSession>) -> Option<Result<Vec<u8>>> {
    match session {
        Some(active) => active.next_audio().await,
        None => std::future::pending().await,
    }
}

/// Hand the oldest pending chunk to the session once it has room
///
/// Nothing is taken from `pending` until room is reserved.
async fn submit_next(
    input: Option<&mpsc::Sender<String>>,
    pending: &mut VecDeque<String>,
) -> Result<()> {
    let tx = input.ok_or_else(|| Error::Tts("session already finished".into()))?;
    let permit = tx
        .reserve()
        .await
        .map_err(|_| Error::Tts("synthesis session closed".into()))?;
    if let Some(text) = pending.pop_front() {
        permit.send(text);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::pipeline::EventBus;
    use crate::voice::{AudioSink, PlaybackConfig, PlaybackController};

    /// Echoes each chunk's bytes back as one audio block
    struct EchoSynth {
        opened: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl SpeechSynthesizer for EchoSynth {
        async fn open(&self, _format: &AudioFormat) -> Result<SynthesisSession> {
            *self.opened.lock().unwrap() += 1;
            let ((text_tx, audio_rx), (mut text_rx, audio_tx)) = SynthesisSession::channels();
            let task = tokio::spawn(async move {
                while let Some(text) = text_rx.recv().await {
                    let pcm: Vec<u8> = text.bytes().flat_map(|b| [b, 0]).collect();
                    if audio_tx.send(Ok(pcm)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(SynthesisSession::new(text_tx, audio_rx, Some(task)))
        }
    }

    /// Answers every chunk with several one-sample blocks
    struct BurstSynth {
        blocks_per_chunk: usize,
    }

    #[async_trait]
    impl SpeechSynthesizer for BurstSynth {
        async fn open(&self, _format: &AudioFormat) -> Result<SynthesisSession> {
            let blocks = self.blocks_per_chunk;
            let ((text_tx, audio_rx), (mut text_rx, audio_tx)) = SynthesisSession::channels();
            let task = tokio::spawn(async move {
                while text_rx.recv().await.is_some() {
                    for _ in 0..blocks {
                        if audio_tx.send(Ok(vec![0x00, 0x10])).await.is_err() {
                            return;
                        }
                    }
                }
            });
            Ok(SynthesisSession::new(text_tx, audio_rx, Some(task)))
        }
    }

    #[derive(Clone, Default)]
    struct NullSink {
        written: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl AudioSink for NullSink {
        async fn open(&mut self, _sample_rate: u32) -> Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        fn write(&mut self, samples: &[f32]) -> usize {
            *self.written.lock().unwrap() += samples.len();
            samples.len()
        }
        fn pending(&self) -> usize {
            0
        }
        fn flush(&mut self) {}
        async fn release(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn playback(gate: &ActiveQuery) -> (PlaybackHandle, NullSink, CancellationToken) {
        let sink = NullSink::default();
        let (controller, handle) = PlaybackController::new(
            sink.clone(),
            AudioFormat::default(),
            gate.clone(),
            PlaybackConfig::default(),
            EventBus::new(),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(controller.run(cancel.clone()));
        (handle, sink, cancel)
    }

    fn chunk(turn_id: u64, seq: u64, text: &str) -> TextChunk {
        TextChunk {
            turn_id,
            seq,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_forwards_frames_in_order() {
        let gate = ActiveQuery::new();
        gate.publish(1);
        let (handle, sink, stop) = playback(&gate);
        let opened = Arc::new(Mutex::new(0));
        let (first_tx, first_rx) = oneshot::channel();

        let task = BridgeTask {
            turn_id: 1,
            synthesizer: Arc::new(EchoSynth {
                opened: Arc::clone(&opened),
            }),
            format: AudioFormat::default(),
            playback: handle.clone(),
            gate: gate.clone(),
            first_frame: Some(first_tx),
        };

        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(1, 0, "ab")).await.unwrap();
        tx.send(chunk(1, 1, "cde")).await.unwrap();
        drop(tx);

        let frames = task.run(rx, CancellationToken::new()).await.unwrap();
        assert_eq!(frames, 2);
        assert!(first_rx.await.is_ok());
        assert_eq!(*opened.lock().unwrap(), 1);

        handle.end_turn(1).await.unwrap();
        // 5 bytes of text became 5 samples, plus trailing silence
        assert!(*sink.written.lock().unwrap() >= 5);
        stop.cancel();
    }

    #[tokio::test]
    async fn test_no_chunks_never_opens_session() {
        let gate = ActiveQuery::new();
        let (handle, _sink, stop) = playback(&gate);
        let opened = Arc::new(Mutex::new(0));

        let task = BridgeTask {
            turn_id: 1,
            synthesizer: Arc::new(EchoSynth {
                opened: Arc::clone(&opened),
            }),
            format: AudioFormat::default(),
            playback: handle,
            gate,
            first_frame: None,
        };

        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        assert_eq!(task.run(rx, CancellationToken::new()).await.unwrap(), 0);
        assert_eq!(*opened.lock().unwrap(), 0);
        stop.cancel();
    }

    #[tokio::test]
    async fn test_cancel_returns_promptly() {
        let gate = ActiveQuery::new();
        gate.publish(1);
        let (handle, _sink, stop) = playback(&gate);

        let task = BridgeTask {
            turn_id: 1,
            synthesizer: Arc::new(EchoSynth {
                opened: Arc::new(Mutex::new(0)),
            }),
            format: AudioFormat::default(),
            playback: handle,
            gate,
            first_frame: None,
        };

        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(task.run(rx, cancel).await.unwrap(), 0);
        stop.cancel();
    }

    #[tokio::test]
    async fn test_long_reply_keeps_audio_flowing() {
        let gate = ActiveQuery::new();
        gate.publish(1);
        let (handle, sink, stop) = playback(&gate);

        let task = BridgeTask {
            turn_id: 1,
            synthesizer: Arc::new(BurstSynth {
                blocks_per_chunk: 8,
            }),
            format: AudioFormat::default(),
            playback: handle.clone(),
            gate: gate.clone(),
            first_frame: None,
        };

        // more chunks than the session's text channel holds
        let (tx, rx) = mpsc::channel(128);
        for seq in 0..100 {
            tx.send(chunk(1, seq, "好")).await.unwrap();
        }
        drop(tx);

        let frames = tokio::time::timeout(
            Duration::from_secs(5),
            task.run(rx, CancellationToken::new()),
        )
        .await
        .expect("bridge stalled")
        .unwrap();
        assert_eq!(frames, 800);

        handle.end_turn(1).await.unwrap();
        assert!(*sink.written.lock().unwrap() >= 800);
        stop.cancel();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_playback() {
        let gate = ActiveQuery::new();
        gate.publish(1);
        // never run, so its queue fills after one frame
        let (_controller, handle) = PlaybackController::new(
            NullSink::default(),
            AudioFormat::default(),
            gate.clone(),
            PlaybackConfig {
                queue_capacity: 1,
                ..PlaybackConfig::default()
            },
            EventBus::new(),
        )
        .unwrap();

        let task = BridgeTask {
            turn_id: 1,
            synthesizer: Arc::new(BurstSynth {
                blocks_per_chunk: 4,
            }),
            format: AudioFormat::default(),
            playback: handle,
            gate,
            first_frame: None,
        };

        let (tx, rx) = mpsc::channel(4);
        tx.send(chunk(1, 0, "好")).await.unwrap();

        let cancel = CancellationToken::new();
        let bridge = tokio::spawn(task.run(rx, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!bridge.is_finished());

        cancel.cancel();
        let frames = tokio::time::timeout(Duration::from_secs(1), bridge)
            .await
            .expect("bridge ignored cancellation")
            .unwrap()
            .unwrap();
        assert_eq!(frames, 1);
    }
}
