//! Playback controller
//!
//! The single owner of the audio sink. A feed loop consumes frames and
//! end-of-turn markers in order and writes decoded samples to the device.
//! Anything belonging to a turn that is no longer the active query is
//! dropped without being played, and a stop request flushes the device
//! queue and releases the device within a bounded time.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{AudioFormat, AudioSink, FrameDecoder, TurnRecorder};
use crate::pipeline::{ActiveQuery, AudioFrame, EventBus, PipelineEvent};
use crate::{Error, Result};

/// Extra time a stop caller waits beyond the release timeout
const STOP_ACK_GRACE: Duration = Duration::from_millis(100);

/// Control messages a stop request may queue
const CONTROL_CHANNEL_CAPACITY: usize = 8;

/// Playback tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Audio queued ahead of the device
    pub buffer_ms: u32,
    /// How often a blocked write re-checks for room and interrupts
    pub poll_interval: Duration,
    /// Hard bound on releasing the device
    pub release_timeout: Duration,
    /// Silence appended after each turn so the tail is not clipped
    pub trailing_silence: Duration,
    /// Frames queued between the synthesis bridge and the feed loop
    pub queue_capacity: usize,
    /// Save each played turn as WAV here
    pub record_dir: Option<PathBuf>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            buffer_ms: 400,
            poll_interval: Duration::from_millis(10),
            release_timeout: Duration::from_millis(200),
            trailing_silence: Duration::from_millis(150),
            queue_capacity: 64,
            record_dir: None,
        }
    }
}

/// Work for the feed loop, consumed in order
#[derive(Debug)]
pub enum PlaybackItem {
    Frame(AudioFrame),
    /// Drain the turn's audio, then acknowledge
    EndOfTurn {
        turn_id: u64,
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum Control {
    Stop {
        turn_id: Option<u64>,
        ack: Option<oneshot::Sender<()>>,
    },
}

/// Cloneable handle to the playback feed loop
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    items: mpsc::Sender<PlaybackItem>,
    control: mpsc::Sender<Control>,
    release_timeout: Duration,
}

impl PlaybackHandle {
    /// Queue a frame for playback
    ///
    /// # Errors
    ///
    /// Returns error if the feed loop has stopped
    pub async fn play(&self, frame: AudioFrame) -> Result<()> {
        self.items
            .send(PlaybackItem::Frame(frame))
            .await
            .map_err(|_| Error::Audio("playback controller stopped".into()))
    }

    /// Mark the end of a turn and wait until its audio has played out
    ///
    /// # Errors
    ///
    /// Returns error if the feed loop has stopped
    pub async fn end_turn(&self, turn_id: u64) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.items
            .send(PlaybackItem::EndOfTurn { turn_id, done })
            .await
            .map_err(|_| Error::Audio("playback controller stopped".into()))?;
        done_rx
            .await
            .map_err(|_| Error::Audio("playback controller stopped".into()))
    }

    /// Stop playback now and release the device
    ///
    /// `turn_id` names the turn whose remaining frames are discarded;
    /// `None` means whatever is currently playing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceBusy`] if the feed loop does not confirm
    /// within the release timeout, or [`Error::Audio`] if it has stopped
    pub async fn stop(&self, turn_id: Option<u64>) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.control
            .send(Control::Stop {
                turn_id,
                ack: Some(ack),
            })
            .await
            .map_err(|_| Error::Audio("playback controller stopped".into()))?;

        match tokio::time::timeout(self.release_timeout + STOP_ACK_GRACE, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Audio("playback controller stopped".into())),
            Err(_) => Err(Error::ResourceBusy(
                "audio device did not release in time".into(),
            )),
        }
    }

    /// Ask for a stop without waiting for it
    ///
    /// Returns `false` if the request could not be queued.
    #[must_use]
    pub fn request_stop(&self) -> bool {
        self.control
            .try_send(Control::Stop {
                turn_id: None,
                ack: None,
            })
            .is_ok()
    }
}

/// Feed loop owning the audio sink
pub struct PlaybackController<S: AudioSink> {
    sink: S,
    decoder: FrameDecoder,
    gate: ActiveQuery,
    config: PlaybackConfig,
    events: EventBus,
    items: mpsc::Receiver<PlaybackItem>,
    control: mpsc::Receiver<Control>,
    recorder: Option<TurnRecorder>,
    recording: bool,
    /// Turn whose audio is currently being played
    turn: Option<u64>,
    next_seq: u64,
    /// Every turn up to and including this one has been stopped
    discard_through: u64,
}

impl<S: AudioSink> PlaybackController<S> {
    /// Create the feed loop and its handle
    ///
    /// # Errors
    ///
    /// Returns error if `format` is not playable or the recording directory
    /// cannot be created
    pub fn new(
        sink: S,
        format: AudioFormat,
        gate: ActiveQuery,
        config: PlaybackConfig,
        events: EventBus,
    ) -> Result<(Self, PlaybackHandle)> {
        format.validate()?;

        let recorder = config
            .record_dir
            .as_ref()
            .map(TurnRecorder::new)
            .transpose()?;

        let (items_tx, items) = mpsc::channel(config.queue_capacity.max(1));
        let (control_tx, control) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

        let handle = PlaybackHandle {
            items: items_tx,
            control: control_tx,
            release_timeout: config.release_timeout,
        };

        let controller = Self {
            sink,
            decoder: FrameDecoder::new(format),
            gate,
            config,
            events,
            items,
            control,
            recorder,
            recording: false,
            turn: None,
            next_seq: 0,
            discard_through: 0,
        };

        Ok((controller, handle))
    }

    /// Run until cancelled or every handle is dropped
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(control) = self.control.recv() => self.handle_control(control).await,
                item = self.items.recv() => match item {
                    Some(PlaybackItem::Frame(frame)) => self.play_frame(frame).await,
                    Some(PlaybackItem::EndOfTurn { turn_id, done }) => {
                        self.end_turn(turn_id).await;
                        let _ = done.send(());
                    }
                    None => break,
                },
            }
        }

        self.abandon_turn();
        self.release_device().await;
        tracing::debug!("playback controller stopped");
    }

    fn is_live(&self, turn_id: u64) -> bool {
        turn_id > self.discard_through && self.gate.is_current(turn_id)
    }

    async fn play_frame(&mut self, frame: AudioFrame) {
        let turn_id = frame.turn_id;
        if !self.is_live(turn_id) {
            tracing::trace!(turn_id, seq = frame.seq, "stale frame discarded");
            return;
        }

        if self.turn != Some(turn_id) {
            self.begin_turn(turn_id);
        }

        if frame.seq < self.next_seq {
            tracing::debug!(turn_id, seq = frame.seq, expected = self.next_seq, "out-of-order frame discarded");
            return;
        }
        self.next_seq = frame.seq + 1;

        let samples = match self.decoder.push(&frame.data) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(turn_id, seq = frame.seq, error = %e, "undecodable frame skipped");
                return;
            }
        };

        if samples.is_empty() {
            // e.g. a header or a partial MP3 frame; nothing reached the device
            tracing::trace!(turn_id, seq = frame.seq, "frame buffered");
            return;
        }

        if self.write_live(turn_id, &samples).await {
            self.events.emit(PipelineEvent::FramePlayed {
                turn_id,
                seq: frame.seq,
            });
        }
    }

    fn begin_turn(&mut self, turn_id: u64) {
        if let Some(previous) = self.turn {
            tracing::debug!(previous, turn_id, "turn superseded before it finished");
            self.abandon_turn();
        }
        self.turn = Some(turn_id);
        self.next_seq = 0;
        self.decoder.reset();
    }

    /// Drop the current turn's queued audio
    fn abandon_turn(&mut self) {
        self.sink.flush();
        self.decoder.reset();
        self.turn = None;
        self.finish_recording();
    }

    /// Write samples, waiting for device room
    ///
    /// Returns `false` if the turn was interrupted before everything was
    /// queued.
    async fn write_live(&mut self, turn_id: u64, samples: &[f32]) -> bool {
        if samples.is_empty() {
            return self.is_live(turn_id);
        }

        if let Err(e) = self.sink.open(self.decoder.sample_rate()).await {
            tracing::error!(turn_id, error = %e, "audio device unavailable");
            return false;
        }
        self.record(turn_id, samples);

        let mut offset = 0;
        loop {
            offset += self.sink.write(&samples[offset..]);
            if offset >= samples.len() {
                return true;
            }
            if !self.wait_for_device(turn_id).await {
                return false;
            }
        }
    }

    /// One poll while blocked on the device
    ///
    /// Handles any pending stop, abandons the turn if it is no longer live,
    /// otherwise sleeps one poll interval.
    async fn wait_for_device(&mut self, turn_id: u64) -> bool {
        if let Ok(control) = self.control.try_recv() {
            self.handle_control(control).await;
        }

        if !self.is_live(turn_id) {
            if self.turn == Some(turn_id) {
                tracing::debug!(turn_id, "turn interrupted mid-write");
                self.abandon_turn();
            }
            return false;
        }

        tokio::time::sleep(self.config.poll_interval).await;
        true
    }

    async fn end_turn(&mut self, turn_id: u64) {
        if self.turn != Some(turn_id) {
            // Nothing of this turn was played, or it was already stopped
            return;
        }
        if !self.is_live(turn_id) {
            self.abandon_turn();
            return;
        }

        self.decoder.finish();
        if !self.drain(turn_id).await {
            return;
        }

        if self.sink.is_open() && !self.config.trailing_silence.is_zero() {
            let rate = f64::from(self.decoder.sample_rate());
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let count = (rate * self.config.trailing_silence.as_secs_f64()) as usize;
            let silence = vec![0.0; count];
            if !self.write_live(turn_id, &silence).await || !self.drain(turn_id).await {
                return;
            }
        }

        self.finish_recording();
        self.turn = None;
        self.release_device().await;
        tracing::debug!(turn_id, "turn audio finished");
    }

    async fn drain(&mut self, turn_id: u64) -> bool {
        while self.sink.pending() > 0 {
            if !self.wait_for_device(turn_id).await {
                return false;
            }
        }
        true
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Stop { turn_id, ack } => {
                let target = turn_id.or(self.turn);

                self.sink.flush();
                self.release_device().await;

                if let Some(target) = target {
                    self.discard_through = self.discard_through.max(target);
                    self.events
                        .emit(PipelineEvent::PlaybackStopped { turn_id: target });
                }
                if self.turn.is_some_and(|t| t <= self.discard_through) {
                    self.abandon_turn();
                }

                tracing::info!(turn_id = ?target, "playback stopped");
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
    }

    async fn release_device(&mut self) {
        if !self.sink.is_open() {
            return;
        }
        match tokio::time::timeout(self.config.release_timeout, self.sink.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "audio device release failed"),
            Err(_) => tracing::warn!(
                timeout_ms = u64::try_from(self.config.release_timeout.as_millis()).unwrap_or(u64::MAX),
                "audio device release timed out"
            ),
        }
    }

    fn record(&mut self, turn_id: u64, samples: &[f32]) {
        let Some(recorder) = self.recorder.as_mut() else {
            return;
        };

        if !self.recording {
            if let Err(e) = recorder.begin(turn_id, self.decoder.sample_rate()) {
                tracing::warn!(turn_id, error = %e, "turn recording unavailable");
                return;
            }
            self.recording = true;
        }

        if let Err(e) = recorder.write(samples) {
            tracing::warn!(turn_id, error = %e, "turn recording failed");
        }
    }

    fn finish_recording(&mut self) {
        self.recording = false;
        if let Some(recorder) = self.recorder.as_mut()
            && let Err(e) = recorder.finish()
        {
            tracing::warn!(error = %e, "failed to finalize turn recording");
        }
    }
}
