//! Per-turn WAV capture of what was actually played

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Writes each played turn to `turn-{id}-{timestamp}.wav`
pub struct TurnRecorder {
    dir: PathBuf,
    current: Option<(PathBuf, hound::WavWriter<BufWriter<File>>)>,
}

impl TurnRecorder {
    /// Create a recorder writing into `dir` (created if missing)
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, current: None })
    }

    /// Directory recordings land in
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start a recording, finishing any previous one
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created
    pub fn begin(&mut self, turn_id: u64, sample_rate: u32) -> Result<()> {
        self.finish()?;

        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = self.dir.join(format!("turn-{turn_id}-{stamp}.wav"));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)
            .map_err(|e| Error::Audio(format!("failed to create {}: {e}", path.display())))?;

        self.current = Some((path, writer));
        Ok(())
    }

    /// Append samples to the open recording, if any
    ///
    /// # Errors
    ///
    /// Returns error if writing fails
    pub fn write(&mut self, samples: &[f32]) -> Result<()> {
        let Some((_, writer)) = self.current.as_mut() else {
            return Ok(());
        };

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer
                .write_sample(value)
                .map_err(|e| Error::Audio(format!("recording write failed: {e}")))?;
        }
        Ok(())
    }

    /// Finalize the open recording
    ///
    /// Returns the path written, if a recording was open.
    ///
    /// # Errors
    ///
    /// Returns error if the WAV header cannot be finalized
    pub fn finish(&mut self) -> Result<Option<PathBuf>> {
        let Some((path, writer)) = self.current.take() else {
            return Ok(None);
        };

        writer
            .finalize()
            .map_err(|e| Error::Audio(format!("recording finalize failed: {e}")))?;
        tracing::debug!(path = %path.display(), "turn audio saved");
        Ok(Some(path))
    }
}
