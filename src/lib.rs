//! voxhook - barge-in voice assistant pipeline for rooted smart speakers
//!
//! Tails the speaker's own speech recognizer, answers each recognized query
//! with a streaming chat model, and speaks the reply through streaming
//! synthesis while it is still being written. Speaking again interrupts
//! the current answer.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   ┌───────────┐   ┌──────────────┐
//! │ Event source  │──▶│ Segmenter │──▶│ Orchestrator │
//! │ (ASR log)     │   └─────┬─────┘   └──────┬───────┘
//! └───────────────┘         │ active query   │ one turn
//!                           ▼                ▼
//!                     ┌──────────┐    ┌──────────────┐
//!                     │ Playback │◀───│ LLM streamer │
//!                     │ (cpal)   │    │  → TTS bridge│
//!                     └──────────┘    └──────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod segmenter;
pub mod source;
pub mod tools;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, ErrorKind, Result};
pub use pipeline::{Orchestrator, Query, TurnOutcome, TurnState};
pub use tools::{Tool, ToolRegistry};
