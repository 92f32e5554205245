//! Synthesis output format and incremental decoding to playable samples

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Container the synthesis provider returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioContainer {
    /// Raw signed 16-bit little-endian samples
    Pcm,
    Wav,
    Mp3,
    /// Needs transcoding; rejected at configuration time
    OggOpus,
}

impl AudioContainer {
    /// Value for the provider's `response_format` field
    #[must_use]
    pub const fn response_format(self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::OggOpus => "opus",
        }
    }
}

impl FromStr for AudioContainer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pcm" | "raw" => Ok(Self::Pcm),
            "wav" => Ok(Self::Wav),
            "mp3" => Ok(Self::Mp3),
            "opus" | "ogg" | "ogg_opus" => Ok(Self::OggOpus),
            other => Err(Error::Config(format!("unknown audio container: {other}"))),
        }
    }
}

impl fmt::Display for AudioContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.response_format())
    }
}

/// Audio format requested from the synthesis provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub container: AudioContainer,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        // OpenAI-compatible `pcm` output
        Self {
            container: AudioContainer::Pcm,
            sample_rate: 24_000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl AudioFormat {
    /// Check that playback can handle this format without transcoding
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for Ogg/Opus, sample rates outside
    /// 8-48 kHz, more than two channels, or a bit depth other than 16
    pub fn validate(&self) -> Result<()> {
        if self.container == AudioContainer::OggOpus {
            return Err(Error::Config(
                "ogg/opus synthesis output is not playable without transcoding".into(),
            ));
        }
        if !(8_000..=48_000).contains(&self.sample_rate) {
            return Err(Error::Config(format!(
                "sample rate {} outside 8000..=48000",
                self.sample_rate
            )));
        }
        if !matches!(self.channels, 1 | 2) {
            return Err(Error::Config(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        if self.bit_depth != 16 {
            return Err(Error::Config(format!(
                "unsupported bit depth {}",
                self.bit_depth
            )));
        }
        Ok(())
    }
}

/// Collects a RIFF/WAVE header off the front of a byte stream
///
/// Learns sample rate and channels from the `fmt ` chunk and hands back
/// whatever follows the start of the `data` chunk.
#[derive(Debug, Default)]
pub struct WavHeader {
    buf: Vec<u8>,
    complete: bool,
    sample_rate: Option<u32>,
    channels: Option<u16>,
}

impl WavHeader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    #[must_use]
    pub const fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    #[must_use]
    pub const fn channels(&self) -> Option<u16> {
        self.channels
    }

    /// Feed bytes; returns the sample data past the header once it is complete
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audio`] if the stream does not start with RIFF/WAVE
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.complete {
            return Ok(Some(bytes.to_vec()));
        }
        self.buf.extend_from_slice(bytes);
        let header = &self.buf;

        if header.len() < 12 {
            return Ok(None);
        }
        if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
            return Err(Error::Audio("missing RIFF/WAVE header".into()));
        }

        let mut pos = 12;
        while header.len() >= pos + 8 {
            let id = [header[pos], header[pos + 1], header[pos + 2], header[pos + 3]];
            let size = u32::from_le_bytes([
                header[pos + 4],
                header[pos + 5],
                header[pos + 6],
                header[pos + 7],
            ]) as usize;
            let body = pos + 8;

            if &id == b"data" {
                let rest = header[body..].to_vec();
                self.buf = Vec::new();
                self.complete = true;
                return Ok(Some(rest));
            }

            // Chunks are word aligned
            let next = body + size + size % 2;
            if header.len() < next {
                return Ok(None);
            }
            if &id == b"fmt " && size >= 16 {
                self.channels = Some(u16::from_le_bytes([header[body + 2], header[body + 3]]));
                self.sample_rate = Some(u32::from_le_bytes([
                    header[body + 4],
                    header[body + 5],
                    header[body + 6],
                    header[body + 7],
                ]));
            }
            pos = next;
        }

        Ok(None)
    }
}

/// Turns encoded frames into mono `f32` samples
///
/// PCM decodes incrementally, carrying a partial sample between frames.
/// WAV strips the RIFF header (learning rate and channels from `fmt `) and
/// then behaves like PCM. MP3 decodes each complete frame as soon as its
/// bytes have arrived and keeps a partial frame for the next push.
#[derive(Debug)]
pub struct FrameDecoder {
    format: AudioFormat,
    sample_rate: u32,
    channels: u16,
    carry: Vec<u8>,
    header: Option<WavHeader>,
    mp3: Option<Mp3Stream>,
}

impl FrameDecoder {
    /// Create a decoder for one turn's audio
    #[must_use]
    pub fn new(format: AudioFormat) -> Self {
        let mut decoder = Self {
            format,
            sample_rate: format.sample_rate,
            channels: format.channels,
            carry: Vec::new(),
            header: None,
            mp3: None,
        };
        decoder.reset();
        decoder
    }

    /// Sample rate of the decoded output
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Forget everything buffered for the current turn
    pub fn reset(&mut self) {
        self.sample_rate = self.format.sample_rate;
        self.channels = self.format.channels;
        self.carry.clear();
        self.mp3 = None;
        self.header = (self.format.container == AudioContainer::Wav).then(WavHeader::new);
    }

    /// Decode what can be decoded now
    ///
    /// # Errors
    ///
    /// Returns error on a malformed WAV header or corrupt MP3 data
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<f32>> {
        match self.format.container {
            AudioContainer::Mp3 => self.decode_mp3(bytes),
            AudioContainer::Wav if self.header.is_some() => {
                let Some(body) = self.strip_header(bytes)? else {
                    return Ok(Vec::new());
                };
                Ok(self.decode_pcm(&body))
            }
            AudioContainer::Pcm | AudioContainer::Wav => Ok(self.decode_pcm(bytes)),
            AudioContainer::OggOpus => Err(Error::Audio("ogg/opus is not decodable".into())),
        }
    }

    /// Close out the turn
    ///
    /// Every complete frame was already decoded by [`Self::push`]; what is
    /// left is a partial sample or a truncated MP3 frame, both dropped.
    pub fn finish(&mut self) {
        self.mp3 = None;
        self.carry.clear();
    }

    fn decode_pcm(&mut self, bytes: &[u8]) -> Vec<f32> {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(bytes);

        let frame_bytes = 2 * usize::from(self.channels.max(1));
        let whole = data.len() - data.len() % frame_bytes;
        self.carry = data[whole..].to_vec();

        let samples = data[..whole]
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0);

        if self.channels == 2 {
            let interleaved: Vec<f32> = samples.collect();
            interleaved
                .chunks(2)
                .map(|frame| f32::midpoint(frame[0], frame.get(1).copied().unwrap_or(frame[0])))
                .collect()
        } else {
            samples.collect()
        }
    }

    /// Strip the header, adopting its format once it is complete
    fn strip_header(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(header) = self.header.as_mut() else {
            return Ok(Some(bytes.to_vec()));
        };
        let body = header.push(bytes)?;
        if header.is_complete() {
            if let Some(rate) = header.sample_rate() {
                self.sample_rate = rate;
            }
            if let Some(channels) = header.channels() {
                self.channels = channels;
            }
            self.header = None;
        }
        Ok(body)
    }

    fn decode_mp3(&mut self, bytes: &[u8]) -> Result<Vec<f32>> {
        let stream = self.mp3.get_or_insert_with(Mp3Stream::new);
        let (samples, sample_rate) = stream.decode(bytes)?;
        if let Some(rate) = sample_rate {
            self.sample_rate = rate;
        }
        Ok(samples)
    }
}

/// MP3 decoder fed in pieces
///
/// minimp3 drops a truncated frame, loses sync on a lone frame behind
/// other bytes, and forgets its bit reservoir when it runs out of input.
/// So it is handed whole frames only and asked for exactly that many;
/// tags and junk are dropped here and a partial frame waits in `pending`.
struct Mp3Stream {
    decoder: minimp3::Decoder<VecDeque<u8>>,
    pending: Vec<u8>,
}

/// What starts an MP3 byte stream
#[derive(Debug, PartialEq, Eq)]
enum Mp3Unit {
    Frame(usize),
    Skip(usize),
    Incomplete,
}

impl Mp3Stream {
    fn new() -> Self {
        Self {
            decoder: minimp3::Decoder::new(VecDeque::new()),
            pending: Vec::new(),
        }
    }

    /// Decode every frame completed by `bytes`, plus the stream's sample rate
    fn decode(&mut self, bytes: &[u8]) -> Result<(Vec<f32>, Option<u32>)> {
        self.pending.extend_from_slice(bytes);

        let mut pos = 0;
        let mut frames = 0;
        loop {
            match next_mp3_unit(&self.pending[pos..]) {
                Mp3Unit::Frame(len) => {
                    self.decoder
                        .reader_mut()
                        .extend(&self.pending[pos..pos + len]);
                    pos += len;
                    frames += 1;
                }
                Mp3Unit::Skip(len) => pos += len,
                Mp3Unit::Incomplete => break,
            }
        }
        self.pending.drain(..pos);

        let mut samples = Vec::new();
        let mut sample_rate = None;
        for _ in 0..frames {
            match self.decoder.next_frame() {
                Ok(frame) => {
                    sample_rate = u32::try_from(frame.sample_rate).ok();
                    samples.extend(downmix(&frame.data, frame.channels));
                }
                Err(minimp3::Error::Eof) => break,
                Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
            }
        }

        Ok((samples, sample_rate))
    }
}

impl fmt::Debug for Mp3Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mp3Stream")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Classify the start of `data`: a whole frame, bytes to drop, or not enough yet
fn next_mp3_unit(data: &[u8]) -> Mp3Unit {
    if data.len() < 4 {
        return Mp3Unit::Incomplete;
    }
    if data.starts_with(b"ID3") {
        // ID3v2: 10 byte header, syncsafe size, optional 10 byte footer
        if data.len() < 10 {
            return Mp3Unit::Incomplete;
        }
        let size = data[6..10]
            .iter()
            .fold(0usize, |acc, &b| (acc << 7) | usize::from(b & 0x7f));
        let footer = if data[5] & 0x10 == 0 { 0 } else { 10 };
        let tag = 10 + size + footer;
        return if data.len() < tag {
            Mp3Unit::Incomplete
        } else {
            Mp3Unit::Skip(tag)
        };
    }
    match mp3_frame_len(data) {
        Some(len) if data.len() >= len => Mp3Unit::Frame(len),
        Some(_) => Mp3Unit::Incomplete,
        None => Mp3Unit::Skip(1),
    }
}

/// Size in bytes of the MPEG audio frame whose header starts `data`
fn mp3_frame_len(data: &[u8]) -> Option<usize> {
    const MPEG1_L1: [u32; 14] = [32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
    const MPEG1_L2: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
    const MPEG1_L3: [u32; 14] = [32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
    const MPEG2_L1: [u32; 14] = [32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
    const MPEG2_L23: [u32; 14] = [8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

    let &[b0, b1, b2, ..] = data else {
        return None;
    };
    if b0 != 0xff || b1 & 0xe0 != 0xe0 {
        return None;
    }

    let version = (b1 >> 3) & 0b11;
    let layer = (b1 >> 1) & 0b11;
    let bitrate_index = usize::from(b2 >> 4);
    let rate_index = usize::from((b2 >> 2) & 0b11);
    let padding = u32::from((b2 >> 1) & 1);

    // Reserved values, plus free format whose size cannot be known up front
    if version == 1 || layer == 0 || bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
        return None;
    }

    let mpeg1 = version == 3;
    let table = match (mpeg1, layer) {
        (true, 3) => &MPEG1_L1,
        (true, 2) => &MPEG1_L2,
        (true, _) => &MPEG1_L3,
        (false, 3) => &MPEG2_L1,
        (false, _) => &MPEG2_L23,
    };
    let bitrate = table[bitrate_index - 1] * 1000;
    let sample_rate = [44_100, 48_000, 32_000][rate_index] >> match version {
        3 => 0,
        2 => 1,
        _ => 2,
    };

    let len = match layer {
        3 => (12 * bitrate / sample_rate + padding) * 4,
        1 if !mpeg1 => 72 * bitrate / sample_rate + padding,
        _ => 144 * bitrate / sample_rate + padding,
    };
    usize::try_from(len).ok()
}

/// 16-bit samples to mono `f32`
fn downmix(data: &[i16], channels: usize) -> Vec<f32> {
    if channels == 2 {
        data.chunks(2)
            .map(|chunk| {
                let left = f32::from(chunk[0]) / 32768.0;
                let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                f32::midpoint(left, right)
            })
            .collect()
    } else {
        data.iter().map(|&s| f32::from(s) / 32768.0).collect()
    }
}
