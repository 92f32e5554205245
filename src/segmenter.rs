//! Query segmentation
//!
//! Turns the raw recognition feed into discrete [`Query`] units. Partials
//! replace each other, finals close the utterance, duplicate finals inside
//! the debounce window are dropped, and an utterance left hanging for the
//! silence timeout is closed with whatever partial text it has.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{ActiveQuery, Query};
use crate::source::{RecognitionEvent, SourceEvent};

/// Segmenter timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmenterConfig {
    /// Window in which a repeated final is treated as a duplicate
    pub debounce: Duration,
    /// Idle time after which a partial utterance is closed
    pub silence_timeout: Duration,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            silence_timeout: Duration::from_millis(5000),
        }
    }
}

/// Utterance window state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    /// No utterance in progress
    Idle,
    /// Partial results seen, waiting for a final or the silence timeout
    Accumulating,
}

/// Recognition events in, queries out
///
/// Pure state machine; time comes from event timestamps and the `now`
/// passed to [`Segmenter::poll_timeout`].
#[derive(Debug)]
pub struct Segmenter {
    config: SegmenterConfig,
    state: SegmenterState,
    accumulated: String,
    last_event_at: Option<Instant>,
    last_final_at: Option<Instant>,
    partial_since_final: bool,
    next_id: u64,
}

impl Segmenter {
    /// Create an idle segmenter; the first query gets id 1
    #[must_use]
    pub const fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            state: SegmenterState::Idle,
            accumulated: String::new(),
            last_event_at: None,
            last_final_at: None,
            partial_since_final: false,
            next_id: 1,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SegmenterState {
        self.state
    }

    /// When the pending utterance times out, if one is pending
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            SegmenterState::Idle => None,
            SegmenterState::Accumulating => self
                .last_event_at
                .map(|at| at + self.config.silence_timeout),
        }
    }

    /// Feed one recognition event
    pub fn observe(&mut self, event: &RecognitionEvent) -> Option<Query> {
        if !event.is_final {
            self.accumulated.clone_from(&event.text);
            self.state = SegmenterState::Accumulating;
            self.last_event_at = Some(event.timestamp);
            self.partial_since_final = true;
            return None;
        }

        let duplicate = !self.partial_since_final
            && self.last_final_at.is_some_and(|prev| {
                event.timestamp.saturating_duration_since(prev) < self.config.debounce
            });
        self.last_final_at = Some(event.timestamp);

        if duplicate {
            tracing::debug!(text = %event.text, "duplicate final inside debounce window, dropped");
            return None;
        }

        let text = if event.text.trim().is_empty() {
            std::mem::take(&mut self.accumulated)
        } else {
            event.text.clone()
        };
        self.close_window();

        self.emit(text, event.timestamp)
    }

    /// Close a stale utterance if the silence timeout has passed
    pub fn poll_timeout(&mut self, now: Instant) -> Option<Query> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }

        let text = std::mem::take(&mut self.accumulated);
        tracing::debug!(text = %text, "silence timeout closed utterance");
        self.close_window();
        self.last_final_at = Some(now);

        self.emit(text, now)
    }

    /// Discard any pending utterance
    pub fn reset(&mut self) {
        self.close_window();
    }

    fn close_window(&mut self) {
        self.state = SegmenterState::Idle;
        self.accumulated.clear();
        self.last_event_at = None;
        self.partial_since_final = false;
    }

    fn emit(&mut self, text: String, at: Instant) -> Option<Query> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;

        Some(Query {
            id,
            text: text.to_string(),
            created_at: at,
        })
    }
}

/// Run the segmenter as a task
///
/// Every emitted query is published on `gate` before it is sent to
/// `queries`. Feed-loss notices discard the pending utterance. Returns when
/// cancelled or when either channel closes.
pub async fn run_segmenter(
    mut segmenter: Segmenter,
    mut events: mpsc::Receiver<SourceEvent>,
    queries: mpsc::Sender<Query>,
    gate: ActiveQuery,
    cancel: CancellationToken,
) {
    loop {
        let deadline = segmenter.deadline();

        let query = tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep_until(deadline) => segmenter.poll_timeout(Instant::now()),
            event = events.recv() => match event {
                Some(SourceEvent::Recognition(event)) => segmenter.observe(&event),
                Some(SourceEvent::FeedLost { attempt, reason }) => {
                    tracing::warn!(attempt, reason = %reason, "recognition feed lost, pending utterance discarded");
                    segmenter.reset();
                    None
                }
                None => break,
            },
        };

        if let Some(query) = query {
            gate.publish(query.id);
            tracing::info!(query_id = query.id, text = %query.text, "query recognized");

            if queries.send(query).await.is_err() {
                tracing::debug!("query receiver dropped, stopping segmenter");
                break;
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str, is_final: bool, at: Instant) -> RecognitionEvent {
        RecognitionEvent {
            text: text.to_string(),
            is_final,
            timestamp: at,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_partials_replace_then_final_emits() {
        let t0 = Instant::now();
        let mut seg = Segmenter::new(SegmenterConfig::default());

        assert!(seg.observe(&event("今天", false, t0)).is_none());
        assert_eq!(seg.state(), SegmenterState::Accumulating);
        assert!(seg.observe(&event("今天几点", false, t0 + ms(100))).is_none());

        let query = seg.observe(&event("今天几点了", true, t0 + ms(200))).unwrap();
        assert_eq!(query.id, 1);
        assert_eq!(query.text, "今天几点了");
        assert_eq!(seg.state(), SegmenterState::Idle);
    }

    #[test]
    fn test_empty_final_uses_accumulated_partial() {
        let t0 = Instant::now();
        let mut seg = Segmenter::new(SegmenterConfig::default());

        seg.observe(&event("打开灯", false, t0));
        let query = seg.observe(&event("  ", true, t0 + ms(50))).unwrap();
        assert_eq!(query.text, "打开灯");
    }

    #[test]
    fn test_blank_final_without_partial_is_ignored() {
        let mut seg = Segmenter::new(SegmenterConfig::default());
        assert!(seg.observe(&event("", true, Instant::now())).is_none());
    }

    #[test]
    fn test_duplicate_final_dropped_inside_debounce() {
        let t0 = Instant::now();
        let mut seg = Segmenter::new(SegmenterConfig::default());

        assert!(seg.observe(&event("停", true, t0)).is_some());
        assert!(seg.observe(&event("停", true, t0 + ms(100))).is_none());

        // Outside the window it is a new query
        let again = seg.observe(&event("停", true, t0 + ms(700))).unwrap();
        assert_eq!(again.id, 2);
    }

    #[test]
    fn test_partial_between_finals_defeats_debounce() {
        let t0 = Instant::now();
        let mut seg = Segmenter::new(SegmenterConfig::default());

        assert!(seg.observe(&event("一", true, t0)).is_some());
        seg.observe(&event("二", false, t0 + ms(50)));
        let second = seg.observe(&event("二", true, t0 + ms(100))).unwrap();
        assert_eq!(second.id, 2);
    }

    #[test]
    fn test_silence_timeout_finalizes() {
        let t0 = Instant::now();
        let mut seg = Segmenter::new(SegmenterConfig {
            silence_timeout: ms(1000),
            ..SegmenterConfig::default()
        });

        seg.observe(&event("播放音乐", false, t0));
        assert_eq!(seg.deadline(), Some(t0 + ms(1000)));
        assert!(seg.poll_timeout(t0 + ms(999)).is_none());

        let query = seg.poll_timeout(t0 + ms(1000)).unwrap();
        assert_eq!(query.text, "播放音乐");
        assert_eq!(seg.state(), SegmenterState::Idle);
        assert_eq!(seg.deadline(), None);
    }

    #[test]
    fn test_silence_timeout_discards_blank() {
        let t0 = Instant::now();
        let mut seg = Segmenter::new(SegmenterConfig::default());

        seg.observe(&event("   ", false, t0));
        assert!(seg.poll_timeout(t0 + ms(6000)).is_none());
        assert_eq!(seg.state(), SegmenterState::Idle);
    }

    #[test]
    fn test_ids_strictly_increase() {
        let t0 = Instant::now();
        let mut seg = Segmenter::new(SegmenterConfig::default());

        let ids: Vec<u64> = (0..5)
            .filter_map(|i| seg.observe(&event(&format!("q{i}"), true, t0 + ms(i * 1000))))
            .map(|q| q.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_reset_discards_accumulation() {
        let t0 = Instant::now();
        let mut seg = Segmenter::new(SegmenterConfig::default());

        seg.observe(&event("半句", false, t0));
        seg.reset();
        assert!(seg.observe(&event("", true, t0 + ms(10))).is_none());
    }

    #[tokio::test]
    async fn test_task_publishes_gate_before_send() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (query_tx, mut query_rx) = mpsc::channel(8);
        let gate = ActiveQuery::new();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_segmenter(
            Segmenter::new(SegmenterConfig::default()),
            event_rx,
            query_tx,
            gate.clone(),
            cancel.clone(),
        ));

        event_tx
            .send(SourceEvent::Recognition(RecognitionEvent::complete("你好")))
            .await
            .unwrap();

        let query = query_rx.recv().await.unwrap();
        assert_eq!(query.id, 1);
        assert!(gate.is_current(1));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_task_times_out_partial() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (query_tx, mut query_rx) = mpsc::channel(8);

        tokio::spawn(run_segmenter(
            Segmenter::new(SegmenterConfig {
                silence_timeout: ms(30),
                ..SegmenterConfig::default()
            }),
            event_rx,
            query_tx,
            ActiveQuery::new(),
            CancellationToken::new(),
        ));

        event_tx
            .send(SourceEvent::Recognition(RecognitionEvent::partial("关灯")))
            .await
            .unwrap();

        let query = tokio::time::timeout(Duration::from_secs(2), query_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(query.text, "关灯");
    }
}
