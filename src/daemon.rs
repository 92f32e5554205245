//! Daemon - the voice assistant service
//!
//! Wires the recognition feed, segmenter, orchestrator and playback
//! together from [`Config`] and runs them until Ctrl-C or a fatal feed
//! loss.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::llm::{OpenAiChat, ResponseStreamer};
use crate::pipeline::{
    ActiveQuery, EventBus, Orchestrator, OrchestratorConfig, OrchestratorStatus, Query,
    TurnOutcome,
};
use crate::segmenter::{Segmenter, run_segmenter};
use crate::source::{DeviceClient, LogTailSource, SourceEvent, run_event_source};
use crate::tools::builtin_registry;
use crate::voice::{CommandVolume, CpalSink, OpenAiSpeech, PlaybackController, VolumeControl};
use crate::{Config, Error, Result};

/// Recognition events buffered between the feed and the segmenter
const SOURCE_CHANNEL_CAPACITY: usize = 64;

/// Queries buffered between the segmenter and the orchestrator
const QUERY_CHANNEL_CAPACITY: usize = 16;

/// The voxhook daemon
pub struct Daemon {
    config: Config,
    status_interval: Duration,
}

impl Daemon {
    /// Create a daemon
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if credentials or settings are missing
    pub fn new(config: Config, status_interval: Duration) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            status_interval,
        })
    }

    /// Run the assistant until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if a component cannot start or the recognition feed
    /// is lost for good
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let shutdown = shutdown_on_ctrl_c();
        let gate = ActiveQuery::new();
        let events = EventBus::new();

        // Playback outlives the orchestrator so a running turn can be stopped
        let playback_cancel = CancellationToken::new();
        let (controller, playback) = PlaybackController::new(
            CpalSink::new(config.playback.buffer_ms),
            config.format,
            gate.clone(),
            config.playback.clone(),
            events.clone(),
        )?;
        let playback_task = tokio::spawn(controller.run(playback_cancel.clone()));

        let volume = match &config.volume {
            Some(volume) => {
                Some(Arc::new(CommandVolume::new(volume.clone())?) as Arc<dyn VolumeControl>)
            }
            None => None,
        };
        let tools = builtin_registry(playback.clone(), volume);
        tracing::info!(tools = ?tools.names(), "tools registered");

        let chat = OpenAiChat::new(config.chat.clone())?;
        let speech = OpenAiSpeech::new(config.speech.clone())?;
        tracing::info!(
            model = chat.model(),
            base_url = %config.chat.base_url,
            voice = %config.speech.voice,
            format = %config.format.container,
            "providers ready"
        );

        let streamer = ResponseStreamer::new(
            Arc::new(chat),
            Arc::new(tools),
            config.streamer.clone(),
        );
        let mut orchestrator = Orchestrator::new(
            OrchestratorConfig {
                format: config.format,
                system_prompt: config.system_prompt.clone(),
                max_history_messages: config.max_history_messages,
                ..OrchestratorConfig::default()
            },
            streamer,
            Arc::new(speech),
            playback,
            gate.clone(),
            events,
        );

        let client = start_device_client(&config).await?;
        if let Some(client) = &client {
            let client = Arc::clone(client);
            let after_query = Arc::clone(&client);
            orchestrator.on_query(move |_query| rearm(&after_query));
            // listen again once the reply has played out
            let after_play = Arc::clone(&client);
            orchestrator.on_turn_finished(move |_turn_id, outcome| {
                if matches!(outcome, TurnOutcome::Completed { .. }) {
                    rearm(&after_play);
                }
            });
        }

        let (query_tx, query_rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);
        let source_task = spawn_intake(&config, query_tx, gate, shutdown.clone());

        let ticker = tokio::spawn(report_status(
            orchestrator.watch_status(),
            client.clone(),
            self.status_interval,
            shutdown.clone(),
        ));

        tracing::info!("voxhook ready");
        orchestrator.run(query_rx, shutdown.clone()).await;

        shutdown.cancel();
        playback_cancel.cancel();
        let _ = playback_task.await;
        let _ = ticker.await;

        if let Some(client) = client
            && let Err(e) = client.shutdown().await
        {
            tracing::warn!(error = %e, "device client shutdown failed");
        }

        let result = join_source(source_task).await;
        tracing::info!("voxhook stopped");
        result
    }
}

/// Run only the recognition side and print each query
///
/// # Errors
///
/// Returns error if the device client cannot start or the feed is lost
pub async fn run_demo(config: Config) -> Result<()> {
    let shutdown = shutdown_on_ctrl_c();
    let client = start_device_client(&config).await?;

    let (query_tx, mut query_rx) = mpsc::channel::<Query>(QUERY_CHANNEL_CAPACITY);
    let source_task = spawn_intake(&config, query_tx, ActiveQuery::new(), shutdown.clone());

    println!("Listening for queries (Ctrl-C to stop)...");
    while let Some(query) = query_rx.recv().await {
        println!("[{}] {}", query.id, query.text);
        if let Some(client) = &client {
            rearm(client);
        }
    }

    shutdown.cancel();
    if let Some(client) = client
        && let Err(e) = client.shutdown().await
    {
        tracing::warn!(error = %e, "device client shutdown failed");
    }
    join_source(source_task).await
}

/// Cancellation token fired by Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            token.cancel();
        }
    });
    shutdown
}

async fn start_device_client(config: &Config) -> Result<Option<Arc<DeviceClient>>> {
    let Some(device) = &config.device else {
        tracing::info!("device client disabled, expecting recognition results from elsewhere");
        return Ok(None);
    };

    let client = DeviceClient::spawn(device).await?;
    tracing::info!(
        program = %device.program.display(),
        asr_timeout_ms = device.asr_timeout_ms,
        "device client started"
    );
    Ok(Some(Arc::new(client)))
}

/// Re-arm recognition for the next utterance
fn rearm(client: &Arc<DeviceClient>) {
    let client = Arc::clone(client);
    tokio::spawn(async move {
        if let Err(e) = client.wakeup().await {
            tracing::warn!(error = %e, "wakeup failed");
        }
    });
}

/// Spawn the feed and the segmenter; a dead feed fires `shutdown`
fn spawn_intake(
    config: &Config,
    queries: mpsc::Sender<Query>,
    gate: ActiveQuery,
    shutdown: CancellationToken,
) -> JoinHandle<Result<()>> {
    let (source_tx, source_rx) = mpsc::channel::<SourceEvent>(SOURCE_CHANNEL_CAPACITY);

    tokio::spawn(run_segmenter(
        Segmenter::new(config.segmenter),
        source_rx,
        queries,
        gate,
        shutdown.clone(),
    ));

    let source = LogTailSource::new(config.log_tail.clone());
    let retry = config.retry.clone();
    tokio::spawn(async move {
        let result = run_event_source(source, retry, source_tx, shutdown.clone()).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "recognition feed lost");
            shutdown.cancel();
        }
        result
    })
}

async fn join_source(task: JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(Error::EventSource(format!("feed task failed: {e}"))),
    }
}

/// Periodic status line, plus a check that the device client is alive
async fn report_status(
    mut status: watch::Receiver<OrchestratorStatus>,
    client: Option<Arc<DeviceClient>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = status.borrow_and_update().clone();
        tracing::info!(
            turn = ?snapshot.current_turn,
            state = ?snapshot.state,
            completed = snapshot.completed,
            cancelled = snapshot.cancelled,
            failed = snapshot.failed,
            "status"
        );

        if let Some(client) = &client
            && !client.is_running().await
        {
            tracing::error!("device client exited");
        }
    }
}
