//! Recognition event intake
//!
//! Wraps the device's speech-recognition feed behind [`EventSource`] and
//! turns feed loss into reconnects with bounded exponential backoff. The
//! adapter task never drops a lost feed silently: every loss surfaces as a
//! [`SourceEvent::FeedLost`] before the reconnect.

mod client;
mod log_tail;
mod retry;

use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

pub use client::{DeviceClient, DeviceClientConfig};
pub use log_tail::{LogTailConfig, LogTailSource, extract_query};
pub use retry::{RetryPolicy, delay_for_attempt};

/// One recognition result from the device ASR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionEvent {
    /// Recognized text
    pub text: String,
    /// Whether the recognizer considers the utterance complete
    pub is_final: bool,
    /// When the event was observed
    pub timestamp: Instant,
}

impl RecognitionEvent {
    /// Create an event stamped with the current instant
    #[must_use]
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
            timestamp: Instant::now(),
        }
    }

    /// Create a partial (in-progress) event
    #[must_use]
    pub fn partial(text: impl Into<String>) -> Self {
        Self::new(text, false)
    }

    /// Create a final event
    #[must_use]
    pub fn complete(text: impl Into<String>) -> Self {
        Self::new(text, true)
    }
}

/// What the adapter forwards downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A recognition result
    Recognition(RecognitionEvent),
    /// The feed dropped; a reconnect follows
    FeedLost {
        /// Consecutive failure count, starting at 1
        attempt: u32,
        /// Why the feed was lost
        reason: String,
    },
}

/// An opaque recognition feed
#[async_trait]
pub trait EventSource: Send {
    /// Open (or reopen) the feed
    ///
    /// # Errors
    ///
    /// Returns error if the feed cannot be opened
    async fn connect(&mut self) -> Result<()>;

    /// Wait for the next recognition event
    ///
    /// `Ok(None)` means the feed ended; the adapter treats it as a loss.
    ///
    /// # Errors
    ///
    /// Returns error if the feed breaks
    async fn next_event(&mut self) -> Result<Option<RecognitionEvent>>;
}

/// Pump `source` into `tx` until cancelled or the retry budget runs out
///
/// Returns `Ok(())` on cancellation or when the receiver is gone.
///
/// # Errors
///
/// Returns [`Error::EventSource`] after more than `policy.max_retries`
/// consecutive failures. A successfully delivered event resets the count.
pub async fn run_event_source<S: EventSource>(
    mut source: S,
    policy: RetryPolicy,
    tx: mpsc::Sender<SourceEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut failures: u32 = 0;
    let mut connected = false;

    loop {
        let outcome = if connected {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                next = source.next_event() => match next {
                    Ok(Some(event)) => {
                        failures = 0;
                        if tx.send(SourceEvent::Recognition(event)).await.is_err() {
                            tracing::debug!("recognition receiver dropped, stopping source");
                            return Ok(());
                        }
                        continue;
                    }
                    Ok(None) => Err("feed ended".to_string()),
                    Err(e) => Err(e.to_string()),
                },
            }
        } else {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                result = source.connect() => result.map_err(|e| e.to_string()),
            }
        };

        let reason = match outcome {
            Ok(()) => {
                tracing::info!("recognition feed connected");
                connected = true;
                continue;
            }
            Err(reason) => reason,
        };

        connected = false;
        failures += 1;
        if failures > policy.max_retries {
            tracing::error!(failures, reason = %reason, "recognition feed retry budget exhausted");
            return Err(Error::EventSource(format!(
                "feed lost {failures} times in a row: {reason}"
            )));
        }

        let delay = delay_for_attempt(&policy, failures - 1);
        tracing::warn!(
            attempt = failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            reason = %reason,
            "recognition feed lost, reconnecting"
        );

        let notice = SourceEvent::FeedLost {
            attempt: failures,
            reason,
        };
        if tx.send(notice).await.is_err() {
            return Ok(());
        }

        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
