//! The single in-flight turn and barge-in
//!
//! The orchestrator accepts queries from the segmenter, spawns one task per
//! turn (response streamer and synthesis bridge joined), and when a new
//! query arrives while a turn is still running cancels that turn and stops
//! playback before the next one starts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ActiveQuery, EventBus, PipelineEvent, Query, Stage, Turn, TurnOutcome, TurnState};
use crate::llm::{ChatMessage, Conversation, ResponseStreamer};
use crate::voice::{AudioFormat, BridgeTask, PlaybackHandle, SpeechSynthesizer};

/// Turn tasks may queue this many state reports
const UPDATE_CHANNEL_CAPACITY: usize = 32;

/// How long shutdown waits for turn tasks to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Called with every accepted query
pub type QueryCallback = Box<dyn Fn(&Query) + Send + Sync>;

/// Called with every finished turn's id and outcome
pub type FinishCallback = Box<dyn Fn(u64, &TurnOutcome) + Send + Sync>;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Audio format requested from the synthesizer
    pub format: AudioFormat,
    pub system_prompt: String,
    /// Cap on remembered user/assistant messages
    pub max_history_messages: usize,
    /// Text chunks buffered between the streamer and the bridge
    pub chunk_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            system_prompt: String::new(),
            max_history_messages: 20,
            chunk_capacity: 32,
        }
    }
}

/// Point-in-time view for status reporting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorStatus {
    pub current_turn: Option<u64>,
    pub state: Option<TurnState>,
    pub last_query: Option<String>,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

/// What a turn task reports back
#[derive(Debug)]
enum TurnUpdate {
    Speaking { turn_id: u64 },
    Finished { turn_id: u64, outcome: TurnOutcome },
}

/// Everything a turn task needs, cloned per turn
#[derive(Clone)]
struct TurnContext {
    streamer: ResponseStreamer,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    playback: PlaybackHandle,
    gate: ActiveQuery,
    format: AudioFormat,
    chunk_capacity: usize,
}

/// Owns the current turn
pub struct Orchestrator {
    context: TurnContext,
    events: EventBus,
    history: Conversation,
    callbacks: Vec<QueryCallback>,
    finish_callbacks: Vec<FinishCallback>,
    current: Option<Turn>,
    tasks: Vec<JoinHandle<()>>,
    status: watch::Sender<OrchestratorStatus>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        streamer: ResponseStreamer,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        playback: PlaybackHandle,
        gate: ActiveQuery,
        events: EventBus,
    ) -> Self {
        let (status, _) = watch::channel(OrchestratorStatus::default());

        Self {
            context: TurnContext {
                streamer,
                synthesizer,
                playback,
                gate,
                format: config.format,
                chunk_capacity: config.chunk_capacity.max(1),
            },
            events,
            history: Conversation::new(config.system_prompt, config.max_history_messages),
            callbacks: Vec::new(),
            finish_callbacks: Vec::new(),
            current: None,
            tasks: Vec::new(),
            status,
        }
    }

    /// Run `callback` for every accepted query, before its turn starts
    pub fn on_query(&mut self, callback: impl Fn(&Query) + Send + Sync + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    /// Run `callback` whenever a turn ends
    ///
    /// A completed turn has finished playing out by the time this runs.
    pub fn on_turn_finished(
        &mut self,
        callback: impl Fn(u64, &TurnOutcome) + Send + Sync + 'static,
    ) {
        self.finish_callbacks.push(Box::new(callback));
    }

    /// Current status snapshot
    #[must_use]
    pub fn status(&self) -> OrchestratorStatus {
        self.status.borrow().clone()
    }

    /// Receiver that keeps seeing status updates while [`Self::run`] owns
    /// the orchestrator
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<OrchestratorStatus> {
        self.status.subscribe()
    }

    /// Conversation so far
    #[must_use]
    pub const fn history(&self) -> &Conversation {
        &self.history
    }

    /// Handle queries until `cancel` fires or the segmenter goes away
    ///
    /// On exit the running turn is cancelled, playback is stopped, and turn
    /// tasks are given a short grace period to finish.
    pub async fn run(mut self, mut queries: mpsc::Receiver<Query>, cancel: CancellationToken) {
        let (updates_tx, mut updates) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(update) = updates.recv() => self.apply(update),
                query = queries.recv() => match query {
                    Some(query) => self.accept(query, &updates_tx).await,
                    None => break,
                },
            }
        }

        self.interrupt("shutdown").await;
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("turn task did not finish during shutdown");
            }
        }
        tracing::debug!("orchestrator stopped");
    }

    async fn accept(&mut self, query: Query, updates: &mpsc::Sender<TurnUpdate>) {
        if let Some(turn) = &self.current
            && query.id <= turn.id()
        {
            tracing::warn!(query_id = query.id, turn_id = turn.id(), "out-of-order query ignored");
            return;
        }

        tracing::info!(query_id = query.id, text = %query.text, "query accepted");
        for callback in &self.callbacks {
            callback(&query);
        }
        self.events.emit(PipelineEvent::QueryAccepted {
            id: query.id,
            text: query.text.clone(),
        });

        self.interrupt("barge-in").await;
        self.tasks.retain(|task| !task.is_finished());
        self.start(query, updates.clone());
    }

    /// Cancel the running turn, if any, and stop its audio
    async fn interrupt(&mut self, reason: &str) {
        let Some(turn) = self.current.as_mut() else {
            return;
        };
        let turn_id = turn.id();
        if !turn.cancel() {
            return;
        }

        tracing::info!(turn_id, reason, "cancelling turn");
        if let Err(e) = self.context.playback.stop(Some(turn_id)).await {
            tracing::warn!(turn_id, error = %e, "playback stop failed");
        }
        self.finish(TurnOutcome::Cancelled);
    }

    fn start(&mut self, query: Query, updates: mpsc::Sender<TurnUpdate>) {
        let turn = Turn::new(query.clone());
        let turn_id = turn.id();
        let history = self.history.snapshot();

        self.tasks.push(tokio::spawn(run_turn(
            self.context.clone(),
            query.clone(),
            history,
            turn.token(),
            updates,
        )));

        self.current = Some(turn);
        self.events.emit(PipelineEvent::TurnStarted { turn_id });
        self.status.send_modify(|status| {
            status.current_turn = Some(turn_id);
            status.state = Some(TurnState::Streaming);
            status.last_query = Some(query.text);
        });
    }

    fn apply(&mut self, update: TurnUpdate) {
        let turn_id = match &update {
            TurnUpdate::Speaking { turn_id } | TurnUpdate::Finished { turn_id, .. } => *turn_id,
        };
        if self.current.as_ref().map(Turn::id) != Some(turn_id) {
            tracing::trace!(turn_id, "update for a turn that already ended");
            return;
        }

        match update {
            TurnUpdate::Speaking { .. } => {
                if let Some(turn) = self.current.as_mut()
                    && turn.advance(TurnState::Speaking)
                {
                    self.events.emit(PipelineEvent::TurnStateChanged {
                        turn_id,
                        state: TurnState::Speaking,
                    });
                    self.status
                        .send_modify(|status| status.state = Some(TurnState::Speaking));
                }
            }
            TurnUpdate::Finished { outcome, .. } => self.finish(outcome),
        }
    }

    /// Record how the current turn ended and clear it
    fn finish(&mut self, outcome: TurnOutcome) {
        let Some(mut turn) = self.current.take() else {
            return;
        };
        let turn_id = turn.id();
        let state = outcome.state();
        // an interrupted turn is already Cancelled
        turn.advance(state);

        match &outcome {
            TurnOutcome::Completed { reply } => {
                tracing::info!(
                    turn_id,
                    elapsed_ms = u64::try_from(turn.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "turn completed"
                );
                self.history.push_exchange(turn.query().text.clone(), reply.clone());
            }
            TurnOutcome::Cancelled => tracing::debug!(turn_id, "turn cancelled"),
            TurnOutcome::Failed { stage, error } => {
                tracing::error!(turn_id, stage = %stage, error = %error, "turn failed");
            }
        }

        for callback in &self.finish_callbacks {
            callback(turn_id, &outcome);
        }
        self.events
            .emit(PipelineEvent::TurnStateChanged { turn_id, state });
        self.events
            .emit(PipelineEvent::TurnFinished { turn_id, outcome });
        self.status.send_modify(|status| {
            status.current_turn = None;
            status.state = None;
            match state {
                TurnState::Completed => status.completed += 1,
                TurnState::Cancelled => status.cancelled += 1,
                _ => status.failed += 1,
            }
        });
    }
}

/// One turn: stream the reply, synthesize it, wait for it to play out
async fn run_turn(
    ctx: TurnContext,
    query: Query,
    history: Vec<ChatMessage>,
    cancel: CancellationToken,
    updates: mpsc::Sender<TurnUpdate>,
) {
    let turn_id = query.id;
    let (chunk_tx, chunk_rx) = mpsc::channel(ctx.chunk_capacity);
    let (first_tx, first_rx) = oneshot::channel();

    let bridge = BridgeTask {
        turn_id,
        synthesizer: Arc::clone(&ctx.synthesizer),
        format: ctx.format,
        playback: ctx.playback.clone(),
        gate: ctx.gate.clone(),
        first_frame: Some(first_tx),
    };

    let speaking = async {
        if first_rx.await.is_ok() {
            let _ = updates.send(TurnUpdate::Speaking { turn_id }).await;
        }
    };

    let (reply, frames, ()) = tokio::join!(
        ctx.streamer.run(&query, history, chunk_tx, cancel.clone()),
        bridge.run(chunk_rx, cancel.clone()),
        speaking,
    );

    let outcome = match (reply, frames) {
        _ if cancel.is_cancelled() || !ctx.gate.is_current(turn_id) => TurnOutcome::Cancelled,
        (Err(e), _) => TurnOutcome::Failed {
            stage: Stage::Llm,
            error: e.to_string(),
        },
        (_, Err(e)) => TurnOutcome::Failed {
            stage: Stage::Synthesis,
            error: e.to_string(),
        },
        (Ok(None), _) => TurnOutcome::Cancelled,
        (Ok(Some(reply)), Ok(0)) => TurnOutcome::Completed { reply },
        (Ok(Some(reply)), Ok(_)) => tokio::select! {
            () = cancel.cancelled() => TurnOutcome::Cancelled,
            played = ctx.playback.end_turn(turn_id) => match played {
                Ok(()) => TurnOutcome::Completed { reply },
                Err(e) => TurnOutcome::Failed {
                    stage: Stage::Playback,
                    error: e.to_string(),
                },
            },
        },
    };

    if matches!(outcome, TurnOutcome::Failed { .. })
        && let Err(e) = ctx.playback.stop(Some(turn_id)).await
    {
        tracing::warn!(turn_id, error = %e, "playback stop after failure failed");
    }

    let _ = updates.send(TurnUpdate::Finished { turn_id, outcome }).await;
}
