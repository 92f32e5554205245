//! Voice output
//!
//! Streaming synthesis, the bridge that feeds it, and the playback
//! controller that owns the speaker.

mod bridge;
mod format;
mod playback;
mod recorder;
mod sink;
mod tts;
mod volume;

pub use bridge::BridgeTask;
pub use format::{AudioContainer, AudioFormat, FrameDecoder, WavHeader};
pub use playback::{PlaybackConfig, PlaybackController, PlaybackHandle, PlaybackItem};
pub use recorder::TurnRecorder;
pub use sink::{AudioSink, CpalSink};
pub use tts::{OpenAiSpeech, OpenAiSpeechConfig, SpeechSynthesizer, SynthesisSession};
pub use volume::{CommandVolume, VolumeConfig, VolumeControl};
