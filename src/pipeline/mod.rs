//! Turn orchestration and the data passed between pipeline stages
//!
//! Data flows event source → segmenter → [`Orchestrator`] → response
//! streamer → synthesis bridge → playback. Every unit carries the id of the
//! turn it belongs to; the [`ActiveQuery`] gate lets any stage tell in one
//! atomic load whether its work is still wanted.

mod orchestrator;
mod turn;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::broadcast;

pub use orchestrator::{
    FinishCallback, Orchestrator, OrchestratorConfig, OrchestratorStatus, QueryCallback,
};
pub use turn::{Stage, Turn, TurnOutcome, TurnState};

/// Capacity of the pipeline event broadcast
pub const EVENT_BUS_CAPACITY: usize = 256;

/// A discrete user request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Strictly increasing, starting at 1; doubles as the turn id
    pub id: u64,
    /// Recognized text
    pub text: String,
    /// When the segmenter emitted it
    pub created_at: Instant,
}

/// A synthesizable slice of the assistant's reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub turn_id: u64,
    pub seq: u64,
    pub text: String,
}

/// Encoded audio as returned by the synthesis provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub turn_id: u64,
    pub seq: u64,
    pub data: Vec<u8>,
}

/// Id of the query currently being answered
///
/// Published by the segmenter before the orchestrator sees the query, so
/// playback and in-flight stages stop treating older turns as live the
/// moment a new utterance is recognized. Zero means no query yet.
#[derive(Debug, Clone, Default)]
pub struct ActiveQuery(Arc<AtomicU64>);

impl ActiveQuery {
    /// Create a gate with no active query
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` as the active query; ids never move backwards
    pub fn publish(&self, id: u64) {
        self.0.fetch_max(id, Ordering::AcqRel);
    }

    /// The active query id
    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Whether work for `turn_id` is still wanted
    #[must_use]
    pub fn is_current(&self, turn_id: u64) -> bool {
        self.current() == turn_id
    }
}

/// Observable pipeline notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The orchestrator accepted a query
    QueryAccepted { id: u64, text: String },
    /// A turn task was spawned
    TurnStarted { turn_id: u64 },
    /// A turn moved to a new state
    TurnStateChanged { turn_id: u64, state: TurnState },
    /// A frame was handed to the audio device
    FramePlayed { turn_id: u64, seq: u64 },
    /// Playback was stopped and the device released
    PlaybackStopped { turn_id: u64 },
    /// A turn reached a terminal state
    TurnFinished { turn_id: u64, outcome: TurnOutcome },
}

/// Broadcast sender for [`PipelineEvent`]s
///
/// Sends never fail the pipeline; with no subscribers events are dropped.
#[derive(Debug, Clone)]
pub struct EventBus(broadcast::Sender<PipelineEvent>);

impl EventBus {
    /// Create a bus with [`EVENT_BUS_CAPACITY`] slots
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self(tx)
    }

    /// Subscribe to future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.0.subscribe()
    }

    /// Publish an event
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.0.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_is_monotonic() {
        let gate = ActiveQuery::new();
        assert_eq!(gate.current(), 0);

        gate.publish(3);
        gate.publish(2);
        assert_eq!(gate.current(), 3);
        assert!(gate.is_current(3));
        assert!(!gate.is_current(2));

        let shared = gate.clone();
        shared.publish(4);
        assert!(gate.is_current(4));
    }

    #[test]
    fn test_bus_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(PipelineEvent::TurnStarted { turn_id: 1 });

        let mut rx = bus.subscribe();
        bus.emit(PipelineEvent::TurnStarted { turn_id: 2 });
        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::TurnStarted { turn_id: 2 }
        );
    }
}
