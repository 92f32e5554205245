//! Recognition feed read from the device ASR debug log
//!
//! The vendor client writes one JSON-bearing line per recognition result.
//! Lines carrying the final keyword become final events; lines carrying the
//! optional partial keyword become partial events. Everything else is noise.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use super::{EventSource, RecognitionEvent};
use crate::Result;

/// Longest line kept; anything longer is dropped up to its newline
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Log tail configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTailConfig {
    /// Debug log written by the vendor ASR client
    pub path: PathBuf,
    /// Substring marking a final recognition result
    pub final_keyword: String,
    /// Substring marking a partial recognition result
    pub partial_keyword: Option<String>,
    /// Empty the log when connecting so stale results are never replayed
    pub truncate_on_connect: bool,
    /// How often to look for new lines
    pub poll_interval: Duration,
}

impl Default for LogTailConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/sdcard/vpm/vpm_debug.log"),
            final_keyword: r#"rejectionRespNumReceived":1}}"#.to_string(),
            partial_keyword: None,
            truncate_on_connect: true,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Tails the ASR debug log
pub struct LogTailSource {
    config: LogTailConfig,
    file: Option<File>,
    position: u64,
    /// Bytes after the last newline seen
    partial_line: Vec<u8>,
    /// Inside an oversized line; skip to the next newline
    discarding: bool,
    ready: VecDeque<RecognitionEvent>,
}

impl LogTailSource {
    /// Create a source; nothing is opened until [`EventSource::connect`]
    #[must_use]
    pub const fn new(config: LogTailConfig) -> Self {
        Self {
            config,
            file: None,
            position: 0,
            partial_line: Vec::new(),
            discarding: false,
            ready: VecDeque::new(),
        }
    }

    /// Read whatever was appended since the last poll
    ///
    /// Returns the number of new bytes.
    async fn poll_file(&mut self) -> Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Err(crate::Error::EventSource("log not open".into()));
        };

        let len = file.metadata().await?.len();
        if len < self.position {
            tracing::debug!(
                previous = self.position,
                current = len,
                "ASR log truncated, rewinding"
            );
            file.seek(SeekFrom::Start(0)).await?;
            self.position = 0;
            self.partial_line.clear();
            self.discarding = false;
        }

        let read = (&mut *file)
            .take(MAX_LINE_BYTES as u64)
            .read_to_end(&mut self.partial_line)
            .await?;
        self.position += read as u64;

        if read > 0 {
            self.drain_lines();
        }

        Ok(read)
    }

    fn drain_lines(&mut self) {
        while let Some(newline) = self.partial_line.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial_line.drain(..=newline).collect();
            if std::mem::take(&mut self.discarding) || line.len() > MAX_LINE_BYTES {
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.parse_line(line.trim_end()) {
                self.ready.push_back(event);
            }
        }

        if self.partial_line.len() > MAX_LINE_BYTES {
            if !self.discarding {
                tracing::warn!(bytes = self.partial_line.len(), "ASR log line too long, dropping it");
            }
            self.partial_line.clear();
            self.discarding = true;
        }
    }

    fn parse_line(&self, line: &str) -> Option<RecognitionEvent> {
        let is_final = if line.contains(&self.config.final_keyword) {
            true
        } else if self
            .config
            .partial_keyword
            .as_deref()
            .is_some_and(|keyword| line.contains(keyword))
        {
            false
        } else {
            return None;
        };

        match extract_query(line) {
            Some(text) => {
                tracing::debug!(text = %text, is_final, "recognition line");
                Some(RecognitionEvent::new(text, is_final))
            }
            None => {
                tracing::debug!(line, "recognition line without query, skipping");
                None
            }
        }
    }
}

#[async_trait]
impl EventSource for LogTailSource {
    async fn connect(&mut self) -> Result<()> {
        let path = &self.config.path;

        if self.config.truncate_on_connect {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .await?;
            tracing::debug!(path = %path.display(), "ASR log cleared");
        }

        let mut file = File::open(path).await?;
        self.position = file.seek(SeekFrom::End(0)).await?;
        self.file = Some(file);
        self.partial_line.clear();
        self.discarding = false;
        self.ready.clear();

        tracing::info!(path = %path.display(), offset = self.position, "tailing ASR log");
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<RecognitionEvent>> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }

            if self.poll_file().await? == 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }
}

/// Pull the recognized text out of a log line
///
/// The JSON payload sits between the first `{` and the last `}`. The text is
/// the top-level `query`, falling back to `response.queries[0].query`.
/// Numeric queries are stringified; blank queries yield `None`.
#[must_use]
pub fn extract_query(line: &str) -> Option<String> {
    let start = line.find('{')?;
    let end = line.rfind('}')?;
    if end <= start {
        return None;
    }

    let value: serde_json::Value = serde_json::from_str(&line[start..=end]).ok()?;

    let query = value.get("query").or_else(|| {
        value
            .get("response")?
            .get("queries")?
            .get(0)?
            .get("query")
    })?;

    let text = match query {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };

    (!text.is_empty()).then_some(text)
}
