//! Turn state machine

use std::fmt;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::Query;

/// Lifecycle of one answered query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// The model is producing the reply
    Streaming,
    /// Audio has reached the speaker
    Speaking,
    Completed,
    Cancelled,
    Failed,
}

impl TurnState {
    /// Whether the turn is over
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether moving from `self` to `next` is allowed
    #[must_use]
    pub const fn can_become(self, next: Self) -> bool {
        match self {
            Self::Streaming => !matches!(next, Self::Streaming),
            Self::Speaking => next.is_terminal(),
            Self::Completed | Self::Cancelled | Self::Failed => false,
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Streaming => "streaming",
            Self::Speaking => "speaking",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Pipeline stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Llm,
    Synthesis,
    Playback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Llm => "llm",
            Self::Synthesis => "synthesis",
            Self::Playback => "playback",
        };
        f.write_str(name)
    }
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { reply: String },
    Cancelled,
    Failed { stage: Stage, error: String },
}

impl TurnOutcome {
    /// Terminal state this outcome puts the turn in
    #[must_use]
    pub const fn state(&self) -> TurnState {
        match self {
            Self::Completed { .. } => TurnState::Completed,
            Self::Cancelled => TurnState::Cancelled,
            Self::Failed { .. } => TurnState::Failed,
        }
    }
}

/// The query being answered, its state and its cancellation token
#[derive(Debug)]
pub struct Turn {
    query: Query,
    state: TurnState,
    cancel: CancellationToken,
    started_at: Instant,
}

impl Turn {
    /// Start a turn in [`TurnState::Streaming`]
    #[must_use]
    pub fn new(query: Query) -> Self {
        Self {
            query,
            state: TurnState::Streaming,
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    /// Turn id, equal to the query id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.query.id
    }

    #[must_use]
    pub const fn query(&self) -> &Query {
        &self.query
    }

    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Token handed to every stage working on this turn
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Move to `next`; returns false and stays put if the move is invalid
    pub fn advance(&mut self, next: TurnState) -> bool {
        if !self.state.can_become(next) {
            tracing::debug!(
                turn_id = self.id(),
                from = %self.state,
                to = %next,
                "ignored turn transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Cancel every stage of this turn
    ///
    /// Returns false if the turn had already ended.
    pub fn cancel(&mut self) -> bool {
        self.cancel.cancel();
        self.advance(TurnState::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn() -> Turn {
        Turn::new(Query {
            id: 3,
            text: "现在几点".to_string(),
            created_at: Instant::now(),
        })
    }

    #[test]
    fn test_happy_path() {
        let mut turn = turn();
        assert_eq!(turn.id(), 3);
        assert_eq!(turn.state(), TurnState::Streaming);
        assert!(turn.advance(TurnState::Speaking));
        assert!(turn.advance(TurnState::Completed));
        assert!(turn.state().is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut turn = turn();
        assert!(turn.advance(TurnState::Failed));
        assert!(!turn.advance(TurnState::Speaking));
        assert!(!turn.cancel());
        assert_eq!(turn.state(), TurnState::Failed);
    }

    #[test]
    fn test_no_return_to_streaming() {
        let mut turn = turn();
        assert!(turn.advance(TurnState::Speaking));
        assert!(!turn.advance(TurnState::Streaming));
        assert!(!turn.advance(TurnState::Speaking));
    }

    #[test]
    fn test_cancel_fires_token() {
        let mut turn = turn();
        let token = turn.token();
        assert!(turn.cancel());
        assert!(token.is_cancelled());
        assert_eq!(turn.state(), TurnState::Cancelled);
    }

    #[test]
    fn test_outcome_state_and_display() {
        let failed = TurnOutcome::Failed {
            stage: Stage::Synthesis,
            error: "socket closed".to_string(),
        };
        assert_eq!(failed.state(), TurnState::Failed);
        assert_eq!(Stage::Synthesis.to_string(), "synthesis");
        assert_eq!(TurnState::Speaking.to_string(), "speaking");
    }
}
