//! Error types for voxhook

use thiserror::Error;

/// Result type alias for voxhook operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credentials, bad values)
    #[error("configuration error: {0}")]
    Config(String),

    /// Recognition event feed error
    #[error("event source error: {0}")]
    EventSource(String),

    /// Chat completion error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Tool invocation error (unknown tool, bad arguments)
    #[error("tool error: {0}")]
    Tool(String),

    /// Malformed provider stream
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Vendor ASR client process error
    #[error("device client error: {0}")]
    Device(String),

    /// Exclusive resource already held
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse failure classes used when reporting a failed turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or device hiccup; the next query retries naturally
    TransientNetwork,
    /// Missing credentials or invalid arguments; fails fast
    Configuration,
    /// Provider sent something we could not parse
    Protocol,
    /// Exclusive device handoff contention
    ResourceBusy,
}

impl Error {
    /// Classify this error for observability
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Tool(_) | Self::Toml(_) => ErrorKind::Configuration,
            Self::Protocol(_) | Self::Serialization(_) => ErrorKind::Protocol,
            Self::ResourceBusy(_) => ErrorKind::ResourceBusy,
            Self::EventSource(_)
            | Self::Llm(_)
            | Self::Tts(_)
            | Self::Audio(_)
            | Self::Device(_)
            | Self::Io(_)
            | Self::Http(_) => ErrorKind::TransientNetwork,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Tts("socket closed".into()).kind(), ErrorKind::TransientNetwork);
        assert_eq!(Error::Config("no key".into()).kind(), ErrorKind::Configuration);
        assert_eq!(Error::Tool("bad args".into()).kind(), ErrorKind::Configuration);
        assert_eq!(Error::Protocol("bad sse".into()).kind(), ErrorKind::Protocol);
        assert_eq!(
            Error::ResourceBusy("device".into()).kind(),
            ErrorKind::ResourceBusy
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::Llm("stream ended early".to_string());
        assert_eq!(err.to_string(), "LLM error: stream ended early");
    }
}
