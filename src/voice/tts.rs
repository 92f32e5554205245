//! Streaming text-to-speech
//!
//! A [`SynthesisSession`] is a duplex pair: text goes in through
//! [`SynthesisSession::submit`], encoded audio comes back out of
//! [`SynthesisSession::next_audio`] while later text is still being
//! submitted. Dropping the session aborts the provider task, which closes
//! any open HTTP response.

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::format::WavHeader;
use super::{AudioContainer, AudioFormat};
use crate::{Error, Result};

/// Text chunks a session buffers before `submit` waits
const TEXT_CHANNEL_CAPACITY: usize = 32;

/// Audio blocks a session buffers before the provider waits
const AUDIO_CHANNEL_CAPACITY: usize = 64;

/// One streaming synthesis exchange
pub struct SynthesisSession {
    text_tx: Option<mpsc::Sender<String>>,
    audio_rx: mpsc::Receiver<Result<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl SynthesisSession {
    /// Assemble a session from its channels
    ///
    /// `task`, when given, is aborted when the session is dropped.
    #[must_use]
    pub const fn new(
        text_tx: mpsc::Sender<String>,
        audio_rx: mpsc::Receiver<Result<Vec<u8>>>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            text_tx: Some(text_tx),
            audio_rx,
            task,
        }
    }

    /// Create the channel pairs for a provider implementation
    ///
    /// Returns the provider's ends: text receiver and audio sender.
    #[must_use]
    pub fn channels() -> (
        (mpsc::Sender<String>, mpsc::Receiver<Result<Vec<u8>>>),
        (mpsc::Receiver<String>, mpsc::Sender<Result<Vec<u8>>>),
    ) {
        let (text_tx, text_rx) = mpsc::channel(TEXT_CHANNEL_CAPACITY);
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        ((text_tx, audio_rx), (text_rx, audio_tx))
    }

    /// Queue text for synthesis
    ///
    /// # Errors
    ///
    /// Returns error if the session was finished or the provider has gone
    pub async fn submit(&self, text: String) -> Result<()> {
        let tx = self
            .text_tx
            .as_ref()
            .ok_or_else(|| Error::Tts("session already finished".into()))?;
        tx.send(text)
            .await
            .map_err(|_| Error::Tts("synthesis session closed".into()))
    }

    /// Signal that no more text follows
    pub fn finish(&mut self) {
        self.text_tx = None;
    }

    /// Take the text sender so input and output can be driven separately
    ///
    /// Dropping the returned sender finishes the session. Later calls and
    /// [`Self::submit`] see the session as finished.
    pub fn take_input(&mut self) -> Option<mpsc::Sender<String>> {
        self.text_tx.take()
    }

    /// Next block of encoded audio; `None` once the provider is done
    pub async fn next_audio(&mut self) -> Option<Result<Vec<u8>>> {
        self.audio_rx.recv().await
    }
}

impl Drop for SynthesisSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A streaming speech synthesis capability
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Open a session producing audio in `format`
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be established
    async fn open(&self, format: &AudioFormat) -> Result<SynthesisSession>;
}

/// OpenAI-compatible speech endpoint configuration
#[derive(Debug, Clone)]
pub struct OpenAiSpeechConfig {
    /// API base, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    pub voice: String,
    pub speed: f32,
}

/// Synthesizes through `POST {base_url}/audio/speech`
///
/// Each submitted chunk becomes one request; requests run in submission
/// order and each response body is streamed back as it arrives. For WAV
/// only the first response keeps its header, so the session reads as one
/// continuous stream.
#[derive(Clone)]
pub struct OpenAiSpeech {
    client: reqwest::Client,
    config: OpenAiSpeechConfig,
}

impl OpenAiSpeech {
    /// Create a synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(config: OpenAiSpeechConfig) -> Result<Self> {
        if config.api_key.expose_secret().is_empty() {
            return Err(Error::Config("API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            config,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn open(&self, format: &AudioFormat) -> Result<SynthesisSession> {
        format.validate()?;

        let ((text_tx, audio_rx), (text_rx, audio_tx)) = SynthesisSession::channels();
        let task = tokio::spawn(run_speech_session(
            self.clone(),
            format.container,
            text_rx,
            audio_tx,
        ));

        Ok(SynthesisSession::new(text_tx, audio_rx, Some(task)))
    }
}

/// One response body's bytes as they go into the session
struct ResponseBody {
    header: Option<WavHeader>,
}

impl ResponseBody {
    /// Body of the `index`th response in a session
    fn new(container: AudioContainer, index: usize) -> Self {
        Self {
            header: (container == AudioContainer::Wav && index > 0).then(WavHeader::new),
        }
    }

    /// Bytes to forward for one piece of the body, if any
    fn accept(&mut self, bytes: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let Some(header) = self.header.as_mut() else {
            return Ok(Some(bytes));
        };
        let body = header.push(&bytes)?;
        if header.is_complete() {
            self.header = None;
        }
        Ok(body.filter(|rest| !rest.is_empty()))
    }
}

async fn run_speech_session(
    speech: OpenAiSpeech,
    container: AudioContainer,
    mut text_rx: mpsc::Receiver<String>,
    audio_tx: mpsc::Sender<Result<Vec<u8>>>,
) {
    #[derive(serde::Serialize)]
    struct SpeechRequest<'a> {
        model: &'a str,
        input: &'a str,
        voice: &'a str,
        response_format: &'a str,
        speed: f32,
    }

    let url = speech.endpoint();
    let mut responses = 0;

    while let Some(text) = text_rx.recv().await {
        let request = SpeechRequest {
            model: &speech.config.model,
            input: &text,
            voice: &speech.config.voice,
            response_format: container.response_format(),
            speed: speech.config.speed,
        };

        let response = speech
            .client
            .post(&url)
            .bearer_auth(speech.config.api_key.expose_secret())
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                let _ = audio_tx
                    .send(Err(Error::Tts(format!("speech error {status}: {body}"))))
                    .await;
                return;
            }
            Err(e) => {
                let _ = audio_tx.send(Err(Error::Tts(e.to_string()))).await;
                return;
            }
        };

        tracing::trace!(chars = text.chars().count(), "speech request accepted");

        let mut filter = ResponseBody::new(container, responses);
        responses += 1;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let item = chunk
                .map_err(|e| Error::Tts(format!("speech stream broke: {e}")))
                .and_then(|bytes| filter.accept(bytes.to_vec()));
            let sent = match item {
                Ok(None) => continue,
                Ok(Some(bytes)) => audio_tx.send(Ok(bytes)).await,
                Err(e) => {
                    let _ = audio_tx.send(Err(e)).await;
                    return;
                }
            };
            if sent.is_err() {
                return;
            }
        }
    }
}
