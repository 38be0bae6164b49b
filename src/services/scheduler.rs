//! Background refresh scheduler.
//!
//! Event writes only mark topics in a [`RefreshQueue`]. The scheduler thread
//! is the only actor that calls the update engine, once per interval.

use super::SummarizationService;
use crate::models::Event;
use crate::storage::sqlite::acquire_lock;
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Topics marked for the next cycle.
#[derive(Debug, Default)]
pub struct RefreshQueue {
    pending: Mutex<BTreeSet<String>>,
}

impl RefreshQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a topic as needing a refresh.
    pub fn mark(&self, topic_id: impl Into<String>) {
        acquire_lock(&self.pending).insert(topic_id.into());
    }

    /// Takes every marked topic, sorted.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *acquire_lock(&self.pending))
            .into_iter()
            .collect()
    }

    /// Number of marked topics.
    #[must_use]
    pub fn len(&self) -> usize {
        acquire_lock(&self.pending).len()
    }

    /// Returns true when nothing is marked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        acquire_lock(&self.pending).is_empty()
    }
}

/// Outcome counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Topics considered.
    pub topics: usize,
    /// Topics whose summary was updated.
    pub refreshed: usize,
    /// Topics skipped by cooldown or for lack of events.
    pub skipped: usize,
    /// Topics whose update failed.
    pub failed: usize,
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Runs staleness scans and batch refreshes on a fixed interval.
pub struct RefreshScheduler {
    engine: Arc<SummarizationService>,
    queue: Arc<RefreshQueue>,
    interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl RefreshScheduler {
    /// Creates a stopped scheduler using the engine's interval.
    #[must_use]
    pub fn new(engine: Arc<SummarizationService>) -> Self {
        let interval = engine.config().interval();
        Self {
            engine,
            queue: Arc::new(RefreshQueue::new()),
            interval,
            worker: Mutex::new(None),
        }
    }

    /// Overrides the interval between cycles.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The queue fed by [`Self::on_event_created`].
    #[must_use]
    pub fn queue(&self) -> &Arc<RefreshQueue> {
        &self.queue
    }

    /// Returns true while the background thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        acquire_lock(&self.worker)
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Starts the background thread. Starting a running scheduler only logs a
    /// warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        let mut worker = acquire_lock(&self.worker);
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            tracing::warn!("Refresh scheduler already running");
            return Ok(());
        }

        let (stop, stopped) = mpsc::channel();
        let engine = Arc::clone(&self.engine);
        let queue = Arc::clone(&self.queue);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("tutorlog-refresh".to_string())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(err) = run_cycle(&engine, &queue) {
                                tracing::error!(error = %err, "Refresh cycle failed");
                            }
                        },
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("Refresh scheduler thread exiting");
            })
            .map_err(|e| Error::operation("spawn_scheduler", e))?;

        *worker = Some(Worker { stop, handle });
        tracing::info!(interval_ms = interval.as_millis(), "Started refresh scheduler");
        Ok(())
    }

    /// Stops the background thread and waits for it. Stopping a stopped
    /// scheduler only logs a warning.
    pub fn stop(&self) {
        let Some(worker) = acquire_lock(&self.worker).take() else {
            tracing::warn!("Refresh scheduler is not running");
            return;
        };
        shutdown(worker);
        tracing::info!("Stopped refresh scheduler");
    }

    /// Runs one cycle on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the staleness scan fails.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        run_cycle(&self.engine, &self.queue)
    }

    /// Hook for event writes. Marks the event's topics for the next cycle
    /// while the scheduler runs; never refreshes synchronously.
    ///
    /// Returns true when the topics were queued. A stopped scheduler leaves
    /// them for a manual refresh.
    #[must_use]
    pub fn on_event_created(&self, event: &Event) -> bool {
        if !self.engine.config().enabled {
            tracing::debug!(event_id = %event.event_id, "Summarization disabled, ignoring event");
            return false;
        }
        if !self.is_running() {
            tracing::info!(
                event_id = %event.event_id,
                topics = event.topics.len(),
                "Refresh scheduler not running, manual refresh needed"
            );
            return false;
        }
        for topic in &event.topics {
            self.queue.mark(topic.as_str());
        }
        true
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(worker) = acquire_lock(&self.worker).take() {
            shutdown(worker);
        }
    }
}

fn shutdown(worker: Worker) {
    let _ = worker.stop.send(());
    if worker.handle.join().is_err() {
        tracing::warn!("Refresh scheduler thread panicked");
    }
}

fn run_cycle(engine: &SummarizationService, queue: &RefreshQueue) -> Result<CycleReport> {
    let config = engine.config();
    if !config.enabled {
        tracing::debug!("Summarization disabled, skipping refresh cycle");
        return Ok(CycleReport::default());
    }

    let span = tracing::info_span!("tutorlog.scheduler.cycle");
    let _enter = span.enter();
    let start = Instant::now();

    let result: Result<CycleReport> = (|| {
        let mut topics: BTreeSet<String> = queue.drain().into_iter().collect();
        topics.extend(engine.topics_needing_refresh(None)?);
        let topics: Vec<String> = topics.into_iter().collect();

        let mut report = CycleReport {
            topics: topics.len(),
            ..CycleReport::default()
        };
        for batch in topics.chunks(config.max_concurrent_topics.max(1)) {
            let results = engine.refresh_topic_summaries(Some(batch), None, false)?;
            for outcome in results.values() {
                match outcome {
                    (Some(_), Some(_)) => report.refreshed += 1,
                    (Some(_), None) => report.skipped += 1,
                    (None, _) => report.failed += 1,
                }
            }
        }
        Ok(report)
    })();

    let status = if result.is_ok() { "success" } else { "error" };
    metrics::counter!("scheduler_cycles_total", "status" => status).increment(1);
    metrics::histogram!("scheduler_cycle_duration_ms")
        .record(start.elapsed().as_secs_f64() * 1000.0);
    if let Ok(report) = &result {
        tracing::info!(
            topics = report.topics,
            refreshed = report.refreshed,
            skipped = report.skipped,
            failed = report.failed,
            "Refresh cycle complete"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SummarizationConfig;
    use crate::llm::{
        AiClient, ClientSettings, Completion, CompletionRequest, CompletionTransport, FragmentStream,
        ModelRouter, RateLimiter, RetryConfig,
    };
    use crate::models::{Actor, EventType};
    use crate::storage::{MemoryStore, TutorStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl CompletionTransport for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn complete(&self, _request: &CompletionRequest) -> crate::Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Completion::text(r#"{"summary": "ok"}"#))
        }

        fn stream(&self, _request: &CompletionRequest) -> crate::Result<FragmentStream> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    fn scheduler(config: SummarizationConfig) -> (RefreshScheduler, Arc<MemoryStore>, Arc<Counting>) {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(Counting::default());
        let client = AiClient::new(
            Arc::clone(&transport) as Arc<dyn CompletionTransport>,
            Arc::new(ModelRouter::default()),
            Arc::new(RateLimiter::new(1_000.0)),
            ClientSettings {
                retry: RetryConfig::immediate(0),
                ..ClientSettings::default()
            },
        );
        let engine = SummarizationService::new(
            Arc::clone(&store) as Arc<dyn TutorStore>,
            Arc::new(client),
            config,
        );
        (RefreshScheduler::new(Arc::new(engine)), store, transport)
    }

    fn event(topic: &str) -> Event {
        Event::new("note", EventType::Chat, Actor::Student).with_topic(topic)
    }

    #[test]
    fn test_queue_drains_sorted_unique() {
        let queue = RefreshQueue::new();
        queue.mark("b");
        queue.mark("a");
        queue.mark("b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain(), vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let (scheduler, _, _) = scheduler(SummarizationConfig::default());
        assert!(!scheduler.is_running());
        scheduler.stop();

        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert!(scheduler.is_running());

        scheduler.stop();
        assert!(!scheduler.is_running());
        scheduler.stop();
    }

    #[test]
    fn test_hook_does_nothing_when_stopped() {
        let (scheduler, _, transport) = scheduler(SummarizationConfig::default());
        assert!(!scheduler.on_event_created(&event("limits")));
        assert!(scheduler.queue().is_empty());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_hook_marks_topics_while_running() {
        let (scheduler, _, transport) = scheduler(SummarizationConfig::default());
        scheduler.start().unwrap();
        assert!(scheduler.on_event_created(&event("limits")));
        assert_eq!(scheduler.queue().len(), 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        scheduler.stop();
    }

    #[test]
    fn test_cycle_refreshes_stale_topics_in_batches() {
        let config = SummarizationConfig {
            max_concurrent_topics: 2,
            ..SummarizationConfig::default()
        };
        let (scheduler, store, transport) = scheduler(config);
        for topic in ["a", "b", "c"] {
            store.insert_event(&event(topic)).unwrap();
        }

        let report = scheduler.run_cycle().unwrap();
        assert_eq!(report.topics, 3);
        assert_eq!(report.refreshed, 3);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        let again = scheduler.run_cycle().unwrap();
        assert_eq!(again.topics, 0);
    }

    #[test]
    fn test_disabled_cycle_does_nothing() {
        let config = SummarizationConfig {
            enabled: false,
            ..SummarizationConfig::default()
        };
        let (scheduler, store, transport) = scheduler(config);
        store.insert_event(&event("a")).unwrap();
        assert_eq!(scheduler.run_cycle().unwrap(), CycleReport::default());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_background_thread_runs_cycles() {
        let (scheduler, store, transport) = scheduler(SummarizationConfig::default());
        let scheduler = scheduler.with_interval(Duration::from_millis(20));
        store.insert_event(&event("a")).unwrap();
        scheduler.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        scheduler.stop();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
