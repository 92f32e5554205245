//! Audio output device
//!
//! [`AudioSink`] is what the playback feed loop writes decoded samples to.
//! [`CpalSink`] owns the real device: the cpal stream lives on a dedicated
//! thread (streams are not `Send`) and pulls from a shared sample queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::oneshot;

use crate::{Error, Result};

/// A writable audio output
///
/// Samples are mono `f32` in `-1.0..=1.0`.
#[async_trait]
pub trait AudioSink: Send {
    /// Claim the device at `sample_rate`; a no-op if already open at that rate
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    async fn open(&mut self, sample_rate: u32) -> Result<()>;

    /// Whether the device is currently claimed
    fn is_open(&self) -> bool;

    /// Queue samples without blocking; returns how many were accepted
    fn write(&mut self, samples: &[f32]) -> usize;

    /// Samples queued but not yet played
    fn pending(&self) -> usize;

    /// Drop everything queued
    fn flush(&mut self);

    /// Stop output and release the device
    ///
    /// Callers bound this with their own timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the device reports a failure while closing
    async fn release(&mut self) -> Result<()>;
}

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

struct DeviceThread {
    sample_rate: u32,
    stop_tx: std::sync::mpsc::Sender<()>,
    closed_rx: oneshot::Receiver<()>,
}

/// Default output device via cpal
pub struct CpalSink {
    buffer_ms: u32,
    capacity: usize,
    queue: SampleQueue,
    device: Option<DeviceThread>,
}

impl CpalSink {
    /// Create a sink buffering at most `buffer_ms` of audio
    #[must_use]
    pub fn new(buffer_ms: u32) -> Self {
        Self {
            buffer_ms,
            capacity: 0,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            device: None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<f32>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn open(&mut self, sample_rate: u32) -> Result<()> {
        if self.device.as_ref().is_some_and(|d| d.sample_rate == sample_rate) {
            return Ok(());
        }
        if self.device.is_some() {
            self.release().await?;
        }

        self.capacity = (sample_rate as usize * self.buffer_ms as usize / 1000).max(1);
        self.lock().clear();

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (closed_tx, closed_rx) = oneshot::channel();
        let queue = Arc::clone(&self.queue);

        std::thread::Builder::new()
            .name("voxhook-audio".into())
            .spawn(move || {
                let stream = match build_stream(sample_rate, queue) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Parks until release or until the sink is dropped
                let _ = stop_rx.recv();
                drop(stream);
                let _ = closed_tx.send(());
            })
            .map_err(|e| Error::Audio(format!("failed to start audio thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| Error::Audio("audio thread exited during open".into()))??;

        tracing::debug!(sample_rate, "audio device claimed");
        self.device = Some(DeviceThread {
            sample_rate,
            stop_tx,
            closed_rx,
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn write(&mut self, samples: &[f32]) -> usize {
        let capacity = self.capacity;
        let mut queue = self.lock();
        let room = capacity.saturating_sub(queue.len());
        let accepted = room.min(samples.len());
        queue.extend(&samples[..accepted]);
        accepted
    }

    fn pending(&self) -> usize {
        self.lock().len()
    }

    fn flush(&mut self) {
        self.lock().clear();
    }

    async fn release(&mut self) -> Result<()> {
        self.flush();
        let Some(device) = self.device.take() else {
            return Ok(());
        };

        let _ = device.stop_tx.send(());
        device
            .closed_rx
            .await
            .map_err(|_| Error::Audio("audio thread vanished during release".into()))?;

        tracing::debug!("audio device released");
        Ok(())
    }
}

/// Build and start an output stream that drains `queue`
fn build_stream(sample_rate: u32, queue: SampleQueue) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let rate = SampleRate(sample_rate);
    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .min_by_key(|c| c.channels())
        .ok_or_else(|| Error::Audio(format!("no output config supports {sample_rate} Hz")))?;

    let config: StreamConfig = supported.with_sample_rate(rate).config();
    let channels = usize::from(config.channels);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio output error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio output stream started"
    );

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_respects_capacity() {
        let mut sink = CpalSink::new(1000);
        sink.capacity = 4;

        assert_eq!(sink.write(&[0.1, 0.2, 0.3]), 3);
        assert_eq!(sink.write(&[0.4, 0.5, 0.6]), 1);
        assert_eq!(sink.pending(), 4);

        sink.flush();
        assert_eq!(sink.pending(), 0);
    }

    #[tokio::test]
    async fn test_release_without_open() {
        let mut sink = CpalSink::new(200);
        assert!(!sink.is_open());
        sink.release().await.unwrap();
    }
}
