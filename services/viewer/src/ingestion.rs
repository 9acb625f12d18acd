//! Bounded concurrent ingestion of frames from a [`FrameStore`].
//!
//! Each call to [`IngestionController::load`] starts a new generation. One
//! dispatcher task per generation runs the fetches with bounded concurrency
//! and reports completions, in whatever order they finish, over a channel
//! owned by the controller. The control task drains that channel through
//! [`IngestionController::next_event`], which forwards frames to a
//! [`FrameSink`] and only then updates the counters.
//!
//! ```text
//! load() -> dispatcher task -> buffer_unordered(fetch_with_retry) -> mpsc -> next_event() -> FrameSink
//! ```

use crate::frame::{Frame, ImageId};
use crate::frame_store::{FetchError, FrameStore};
use crate::series::FrameSink;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// Retry behaviour for transient fetch failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per identity, counting the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Settings for the ingestion controller.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Upper bound on fetches in flight
    pub max_concurrent_fetches: usize,
    pub retry: RetryPolicy,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one fetch, as reported by the dispatcher.
#[derive(Debug)]
struct FetchCompletion {
    generation: u64,
    position: usize,
    identity: ImageId,
    result: Result<Frame, FetchError>,
    attempts: u32,
    elapsed: Duration,
}

/// What happened to one identity of the current load.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    /// The frame was absorbed into the hierarchy.
    Loaded {
        identity: ImageId,
        series_index: usize,
    },
    /// The fetch failed; the identity is excluded from the hierarchy.
    Failed { identity: ImageId, error: FetchError },
    /// The dispatcher stopped early; `failed` unsettled identities were
    /// recorded as aborted and the load ended.
    Aborted { failed: usize },
}

/// An identity that could not be ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionFailure {
    pub identity: ImageId,
    pub error: FetchError,
    pub attempts: u32,
}

/// Snapshot of the current load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestProgress {
    pub generation: u64,
    /// Identities passed to `load`
    pub total: usize,
    /// Identities actually dispatched
    pub target: usize,
    /// Positive image limit of the load, if any
    pub limit: Option<usize>,
    pub loaded: usize,
    pub failed: usize,
    pub loading: bool,
}

impl IngestProgress {
    /// Images still to be loaded: the identity count, truncated by the
    /// limit, minus what has loaded.
    pub fn images_remaining(&self) -> usize {
        self.target.saturating_sub(self.loaded)
    }

    /// Images a further load of the same identities could still bring in,
    /// capped by the limit: `min(limit, total - loaded)`.
    pub fn more_available(&self) -> usize {
        let rest = self.total.saturating_sub(self.loaded);
        self.limit.map_or(rest, |limit| rest.min(limit))
    }

    /// Fetches that have not settled yet.
    pub fn pending(&self) -> usize {
        self.target.saturating_sub(self.loaded + self.failed)
    }

    /// Fraction of dispatched fetches that have settled.
    pub fn fraction_settled(&self) -> f64 {
        if self.target == 0 {
            return 1.0;
        }
        (self.loaded + self.failed) as f64 / self.target as f64
    }
}

/// Cumulative ingestion statistics.
#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    pub frames_loaded: u64,
    pub frames_failed: u64,
    pub retries: u64,
    pub stale_completions: u64,
    pub avg_fetch_latency_ms: f64,
}

impl IngestStats {
    fn record_fetch(&mut self, attempts: u32, elapsed: Duration) {
        let settled = (self.frames_loaded + self.frames_failed) as f64;
        let latency = elapsed.as_secs_f64() * 1000.0;
        self.avg_fetch_latency_ms =
            (self.avg_fetch_latency_ms * settled + latency) / (settled + 1.0);
        self.retries += u64::from(attempts.saturating_sub(1));
    }
}

enum Wake {
    Completion(Option<FetchCompletion>),
    DispatcherExited(Result<(), JoinError>),
}

/// Issues fetches for a batch of identities and reports their completion.
pub struct IngestionController<S: FrameStore + 'static> {
    store: Arc<S>,
    settings: IngestSettings,
    generation: u64,
    total: usize,
    limit: Option<usize>,
    batch: Vec<ImageId>,
    settled: Vec<bool>,
    loaded: usize,
    failures: Vec<IngestionFailure>,
    loading: bool,
    stats: IngestStats,
    completions_tx: mpsc::UnboundedSender<FetchCompletion>,
    completions_rx: mpsc::UnboundedReceiver<FetchCompletion>,
    dispatcher: Option<JoinHandle<()>>,
}

impl<S: FrameStore + 'static> IngestionController<S> {
    pub fn new(store: Arc<S>, settings: IngestSettings) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            store,
            settings,
            generation: 0,
            total: 0,
            limit: None,
            batch: Vec::new(),
            settled: Vec::new(),
            loaded: 0,
            failures: Vec::new(),
            loading: false,
            stats: IngestStats::default(),
            completions_tx,
            completions_rx,
            dispatcher: None,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    /// Start loading `identities`, abandoning any load in progress.
    ///
    /// A positive `limit` caps how many identities are fetched; `None` or
    /// zero fetches all of them. Must be called from within a tokio runtime.
    /// Returns the generation of the new load.
    pub fn load(&mut self, identities: Vec<ImageId>, limit: Option<usize>) -> u64 {
        self.reset();
        self.generation += 1;

        self.limit = limit.filter(|limit| *limit > 0);
        let target = self
            .limit
            .map_or(identities.len(), |limit| limit.min(identities.len()));

        self.total = identities.len();
        let mut batch = identities;
        batch.truncate(target);
        self.settled = vec![false; target];
        self.batch = batch;

        info!(
            generation = self.generation,
            total = self.total,
            target,
            concurrency = self.settings.max_concurrent_fetches,
            "Starting load"
        );

        if target == 0 {
            return self.generation;
        }

        self.loading = true;
        self.dispatcher = Some(self.spawn_dispatcher());
        self.generation
    }

    /// Abandon the current load and drop every cached frame.
    pub fn reset(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
            debug!(generation = self.generation, "Dispatcher aborted");
        }
        self.store.clear();
        self.total = 0;
        self.limit = None;
        self.batch.clear();
        self.settled.clear();
        self.loaded = 0;
        self.failures.clear();
        self.loading = false;
    }

    /// Wait for the next completion of the current load and apply it.
    ///
    /// Successful frames are handed to `sink` before any counter moves.
    /// Returns `None` once nothing is loading.
    pub async fn next_event<K: FrameSink>(&mut self, sink: &mut K) -> Option<IngestEvent> {
        loop {
            if !self.loading {
                return None;
            }

            let wake = match self.dispatcher.as_mut() {
                Some(dispatcher) => tokio::select! {
                    biased;
                    completion = self.completions_rx.recv() => Wake::Completion(completion),
                    joined = dispatcher => Wake::DispatcherExited(joined),
                },
                None => Wake::Completion(self.completions_rx.recv().await),
            };

            match wake {
                Wake::Completion(Some(completion)) => {
                    if let Some(event) = self.apply(completion, sink) {
                        return Some(event);
                    }
                }
                Wake::Completion(None) => return None,
                Wake::DispatcherExited(joined) => {
                    self.dispatcher = None;
                    if let Err(e) = joined {
                        error!(generation = self.generation, error = %e, "Dispatcher task failed");
                    }
                    // Every completion is sent before the dispatcher exits,
                    // so a load still open here can never settle.
                    if self.loading {
                        return Some(self.abandon_unsettled());
                    }
                }
            }
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Identities dispatched by the current load, in request order.
    pub fn batch(&self) -> &[ImageId] {
        &self.batch
    }

    pub fn progress(&self) -> IngestProgress {
        IngestProgress {
            generation: self.generation,
            total: self.total,
            target: self.batch.len(),
            limit: self.limit,
            loaded: self.loaded,
            failed: self.failures.len(),
            loading: self.loading,
        }
    }

    /// Identities of the current load that failed.
    pub fn failures(&self) -> &[IngestionFailure] {
        &self.failures
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let generation = self.generation;
        let batch: Vec<(usize, ImageId)> = self.batch.iter().cloned().enumerate().collect();
        let store = self.store.clone();
        let retry = self.settings.retry.clone();
        let concurrency = self.settings.max_concurrent_fetches.max(1);
        let tx = self.completions_tx.clone();

        tokio::spawn(async move {
            stream::iter(batch)
                .map(move |(position, identity)| {
                    let store = store.clone();
                    let retry = retry.clone();
                    async move {
                        let started = Instant::now();
                        let (result, attempts) =
                            fetch_with_retry(store.as_ref(), &identity, &retry).await;
                        FetchCompletion {
                            generation,
                            position,
                            identity,
                            result,
                            attempts,
                            elapsed: started.elapsed(),
                        }
                    }
                })
                .buffer_unordered(concurrency)
                .for_each(move |completion| {
                    // The receiver lives as long as the controller
                    let _ = tx.send(completion);
                    futures::future::ready(())
                })
                .await;
        })
    }

    fn apply<K: FrameSink>(&mut self, completion: FetchCompletion, sink: &mut K) -> Option<IngestEvent> {
        let FetchCompletion {
            generation,
            position,
            identity,
            result,
            attempts,
            elapsed,
        } = completion;

        if generation != self.generation {
            self.stats.stale_completions += 1;
            debug!(
                generation,
                current = self.generation,
                identity = %identity,
                "Discarding stale completion"
            );
            return None;
        }

        match self.settled.get_mut(position) {
            Some(settled) if !*settled => *settled = true,
            _ => return None,
        }
        self.stats.record_fetch(attempts, elapsed);

        let event = match result {
            Ok(frame) => {
                let series_index = sink.absorb(frame);
                self.loaded += 1;
                self.stats.frames_loaded += 1;
                debug!(
                    generation,
                    identity = %identity,
                    series_index,
                    attempts,
                    "Frame absorbed"
                );
                IngestEvent::Loaded {
                    identity,
                    series_index,
                }
            }
            Err(error) => {
                self.store.evict(&identity);
                self.stats.frames_failed += 1;
                warn!(
                    generation,
                    identity = %identity,
                    attempts,
                    error = %error,
                    "Frame fetch failed"
                );
                self.failures.push(IngestionFailure {
                    identity: identity.clone(),
                    error: error.clone(),
                    attempts,
                });
                IngestEvent::Failed { identity, error }
            }
        };

        if self.loaded + self.failures.len() == self.batch.len() {
            self.finish();
        }
        Some(event)
    }

    fn finish(&mut self) {
        self.loading = false;
        self.dispatcher = None;
        info!(
            generation = self.generation,
            loaded = self.loaded,
            failed = self.failures.len(),
            "Load finished"
        );
    }

    fn abandon_unsettled(&mut self) -> IngestEvent {
        let mut failed = 0;
        for (position, settled) in self.settled.iter_mut().enumerate() {
            if *settled {
                continue;
            }
            *settled = true;
            failed += 1;
            let identity = self.batch[position].clone();
            self.store.evict(&identity);
            self.failures.push(IngestionFailure {
                identity,
                error: FetchError::Aborted,
                attempts: 0,
            });
        }
        self.stats.frames_failed += failed as u64;

        warn!(
            generation = self.generation,
            failed,
            "Dispatcher stopped early, unsettled fetches marked as aborted"
        );
        self.finish();
        IngestEvent::Aborted { failed }
    }
}

impl<S: FrameStore + 'static> Drop for IngestionController<S> {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

/// Fetch one identity, retrying transient failures with exponential backoff.
async fn fetch_with_retry<S: FrameStore + ?Sized>(
    store: &S,
    identity: &str,
    policy: &RetryPolicy,
) -> (Result<Frame, FetchError>, u32) {
    let mut backoff = policy.backoff();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match store.fetch(identity).await {
            Ok(frame) => return (Ok(frame), attempts),
            Err(e) if e.is_transient() && attempts < policy.max_attempts => {
                match backoff.next_backoff() {
                    Some(delay) => {
                        debug!(
                            identity = %identity,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient fetch failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return (Err(e), attempts),
                }
            }
            Err(e) => return (Err(e), attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_store::{MemoryFrameStore, MockFrameStore};
    use crate::series::SeriesAggregator;
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn frame(series: &str, number: i32, instance: i32) -> Frame {
        Frame {
            image_identity: format!("{}{}", series, instance),
            study_id: "study".to_string(),
            series_id: series.to_string(),
            series_number: Some(number),
            instance_number: Some(instance),
            sop_instance_uid: format!("sop-{}{}", series, instance),
            study_description: None,
            series_description: None,
        }
    }

    fn ids(values: &[&str]) -> Vec<ImageId> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn fast_settings() -> IngestSettings {
        IngestSettings {
            max_concurrent_fetches: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        }
    }

    /// Store that answers after a per-identity delay, with scripted failures.
    #[derive(Default)]
    struct ScriptedStore {
        frames: HashMap<String, (Frame, u64)>,
        transient_failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<HashMap<String, u32>>,
        evicted: Mutex<Vec<String>>,
        clears: Mutex<u32>,
    }

    impl ScriptedStore {
        fn with(mut self, frame: Frame, delay_ms: u64) -> Self {
            self.frames
                .insert(frame.image_identity.clone(), (frame, delay_ms));
            self
        }

        fn failing_first(self, identity: &str, times: u32) -> Self {
            self.transient_failures
                .lock()
                .insert(identity.to_string(), times);
            self
        }

        fn calls(&self, identity: &str) -> u32 {
            self.calls.lock().get(identity).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl FrameStore for ScriptedStore {
        async fn fetch(&self, identity: &str) -> Result<Frame, FetchError> {
            *self.calls.lock().entry(identity.to_string()).or_default() += 1;

            let Some((frame, delay_ms)) = self.frames.get(identity).cloned() else {
                return Err(FetchError::NotFound(identity.to_string()));
            };
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            let fail = {
                let mut failures = self.transient_failures.lock();
                match failures.get_mut(identity) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if fail {
                return Err(FetchError::Unavailable("busy".to_string()));
            }
            Ok(frame)
        }

        fn evict(&self, identity: &str) {
            self.evicted.lock().push(identity.to_string());
        }

        fn clear(&self) {
            *self.clears.lock() += 1;
        }
    }

    struct PanickingStore;

    #[async_trait]
    impl FrameStore for PanickingStore {
        async fn fetch(&self, identity: &str) -> Result<Frame, FetchError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            panic!("store crashed fetching {}", identity);
        }

        fn evict(&self, _identity: &str) {}

        fn clear(&self) {}
    }

    async fn drain<S: FrameStore + 'static>(
        controller: &mut IngestionController<S>,
        aggregator: &mut SeriesAggregator,
    ) -> Vec<IngestEvent> {
        let mut events = Vec::new();
        while let Some(event) = controller.next_event(aggregator).await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_out_of_order_arrival_builds_sorted_hierarchy() {
        // A2 arrives first, then B1, then A1
        let store = ScriptedStore::default()
            .with(frame("A", 1, 2), 5)
            .with(frame("B", 2, 1), 20)
            .with(frame("A", 1, 1), 40);
        let mut controller = IngestionController::new(Arc::new(store), fast_settings());
        let mut aggregator = SeriesAggregator::new();

        controller.load(ids(&["A1", "A2", "B1"]), None);
        assert!(controller.is_loading());

        let events = drain(&mut controller, &mut aggregator).await;
        let arrival: Vec<_> = events
            .iter()
            .map(|e| match e {
                IngestEvent::Loaded { identity, .. } => identity.as_str(),
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(arrival, vec!["A2", "B1", "A1"]);

        let series = aggregator.series();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].series_id, "A");
        let a: Vec<_> = series[0].images().iter().map(|f| f.image_identity.as_str()).collect();
        assert_eq!(a, vec!["A1", "A2"]);
        assert_eq!(series[1].images()[0].image_identity, "B1");

        let progress = controller.progress();
        assert!(!progress.loading);
        assert_eq!(progress.loaded, 3);
        assert_eq!(progress.images_remaining(), 0);
        assert_eq!(progress.pending(), 0);
    }

    #[tokio::test]
    async fn test_limit_caps_target() {
        let store = MemoryFrameStore::with_frames((1..=5).map(|i| frame("A", 1, i)));
        let mut controller = IngestionController::new(Arc::new(store), fast_settings());
        let mut aggregator = SeriesAggregator::new();

        controller.load(ids(&["A1", "A2", "A3", "A4", "A5"]), Some(2));
        let progress = controller.progress();
        assert_eq!(progress.total, 5);
        assert_eq!(progress.target, 2);
        assert_eq!(progress.images_remaining(), 2);

        let events = drain(&mut controller, &mut aggregator).await;
        assert_eq!(events.len(), 2);
        assert_eq!(aggregator.image_count(), 2);

        let progress = controller.progress();
        assert_eq!(progress.loaded, 2);
        assert!(!progress.loading);
        assert_eq!(progress.images_remaining(), 0);
        assert_eq!(progress.limit, Some(2));
        assert_eq!(progress.more_available(), 2);
    }

    #[tokio::test]
    async fn test_zero_limit_means_unlimited() {
        let store = MemoryFrameStore::with_frames((1..=3).map(|i| frame("A", 1, i)));
        let mut controller = IngestionController::new(Arc::new(store), fast_settings());
        let mut aggregator = SeriesAggregator::new();

        controller.load(ids(&["A1", "A2", "A3"]), Some(0));
        drain(&mut controller, &mut aggregator).await;
        let progress = controller.progress();
        assert_eq!(progress.loaded, 3);
        assert_eq!(progress.limit, None);
        assert_eq!(progress.more_available(), 0);
    }

    #[tokio::test]
    async fn test_empty_load_is_immediately_done() {
        let mut controller =
            IngestionController::new(Arc::new(MemoryFrameStore::new()), fast_settings());
        let mut aggregator = SeriesAggregator::new();

        let generation = controller.load(Vec::new(), None);
        assert_eq!(generation, 1);
        assert!(!controller.is_loading());
        assert!(controller.next_event(&mut aggregator).await.is_none());
    }

    #[tokio::test]
    async fn test_failures_are_reported_and_do_not_block_completion() {
        let store = Arc::new(
            ScriptedStore::default()
                .with(frame("A", 1, 1), 1)
                .with(frame("A", 1, 2), 1),
        );
        let mut controller = IngestionController::new(store.clone(), fast_settings());
        let mut aggregator = SeriesAggregator::new();

        controller.load(ids(&["A1", "missing", "A2"]), None);
        let events = drain(&mut controller, &mut aggregator).await;

        assert_eq!(events.len(), 3);
        assert!(events.contains(&IngestEvent::Failed {
            identity: "missing".to_string(),
            error: FetchError::NotFound("missing".to_string()),
        }));
        assert!(!controller.is_loading());
        assert_eq!(aggregator.image_count(), 2);

        let failures = controller.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].identity, "missing");
        assert_eq!(failures[0].attempts, 1);
        assert_eq!(*store.evicted.lock(), vec!["missing".to_string()]);

        let progress = controller.progress();
        assert_eq!(progress.pending(), 0);
        assert_eq!(progress.images_remaining(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(
            ScriptedStore::default()
                .with(frame("A", 1, 1), 1)
                .failing_first("A1", 2),
        );
        let mut controller = IngestionController::new(store.clone(), fast_settings());
        let mut aggregator = SeriesAggregator::new();

        controller.load(ids(&["A1"]), None);
        let events = drain(&mut controller, &mut aggregator).await;

        assert!(matches!(events[0], IngestEvent::Loaded { .. }));
        assert_eq!(store.calls("A1"), 3);
        assert_eq!(controller.stats().retries, 2);
    }

    #[tokio::test]
    async fn test_retries_give_up_after_max_attempts() {
        let store = Arc::new(
            ScriptedStore::default()
                .with(frame("A", 1, 1), 1)
                .failing_first("A1", 10),
        );
        let mut controller = IngestionController::new(store.clone(), fast_settings());
        let mut aggregator = SeriesAggregator::new();

        controller.load(ids(&["A1"]), None);
        drain(&mut controller, &mut aggregator).await;

        assert_eq!(store.calls("A1"), 3);
        assert_eq!(controller.failures()[0].attempts, 3);
        assert!(aggregator.is_empty());
    }

    #[tokio::test]
    async fn test_new_load_discards_previous_generation() {
        let store = Arc::new(
            ScriptedStore::default()
                .with(frame("A", 1, 1), 0)
                .with(frame("A", 1, 2), 200)
                .with(frame("B", 2, 1), 1),
        );
        let mut controller = IngestionController::new(store.clone(), fast_settings());
        let mut aggregator = SeriesAggregator::new();

        let first = controller.load(ids(&["A1", "A2"]), None);
        let event = controller.next_event(&mut aggregator).await;
        assert!(matches!(event, Some(IngestEvent::Loaded { .. })));

        aggregator.clear();
        let second = controller.load(ids(&["B1"]), None);
        assert!(second > first);

        let events = drain(&mut controller, &mut aggregator).await;
        assert_eq!(
            events,
            vec![IngestEvent::Loaded {
                identity: "B1".to_string(),
                series_index: 0,
            }]
        );
        assert_eq!(aggregator.len(), 1);
        assert_eq!(aggregator.series()[0].series_id, "B");
        assert_eq!(*store.clears.lock(), 2);
    }

    #[tokio::test]
    async fn test_stale_completion_is_counted() {
        let store = MemoryFrameStore::with_frames([frame("A", 1, 1), frame("B", 2, 1)]);
        let mut controller = IngestionController::new(Arc::new(store), fast_settings());
        let mut aggregator = SeriesAggregator::new();

        controller.load(ids(&["A1"]), None);
        // Let the first dispatcher finish and queue its completion
        tokio::time::sleep(Duration::from_millis(20)).await;

        controller.load(ids(&["B1"]), None);
        let events = drain(&mut controller, &mut aggregator).await;

        assert_eq!(events.len(), 1);
        assert_eq!(controller.stats().stale_completions, 1);
        assert_eq!(aggregator.series()[0].series_id, "B");
    }

    #[tokio::test]
    async fn test_dispatcher_panic_marks_unsettled_as_aborted() {
        let mut controller = IngestionController::new(Arc::new(PanickingStore), fast_settings());
        let mut aggregator = SeriesAggregator::new();

        controller.load(ids(&["x", "y"]), None);
        let events = drain(&mut controller, &mut aggregator).await;

        assert_eq!(events, vec![IngestEvent::Aborted { failed: 2 }]);
        assert!(!controller.is_loading());
        assert!(controller
            .failures()
            .iter()
            .all(|f| f.error == FetchError::Aborted));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        struct CountingStore {
            in_flight: Mutex<(usize, usize)>,
        }

        #[async_trait]
        impl FrameStore for CountingStore {
            async fn fetch(&self, identity: &str) -> Result<Frame, FetchError> {
                {
                    let mut counts = self.in_flight.lock();
                    counts.0 += 1;
                    counts.1 = counts.1.max(counts.0);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.in_flight.lock().0 -= 1;
                Ok(frame("A", 1, identity.len() as i32))
            }

            fn evict(&self, _identity: &str) {}

            fn clear(&self) {}
        }

        let store = Arc::new(CountingStore {
            in_flight: Mutex::new((0, 0)),
        });
        let settings = IngestSettings {
            max_concurrent_fetches: 2,
            ..fast_settings()
        };
        let mut controller = IngestionController::new(store.clone(), settings);
        let mut aggregator = SeriesAggregator::new();

        controller.load((0..8).map(|i| "x".repeat(i + 1)).collect(), None);
        drain(&mut controller, &mut aggregator).await;

        assert_eq!(aggregator.image_count(), 8);
        assert_eq!(store.in_flight.lock().1, 2);
    }

    #[tokio::test]
    async fn test_store_cleared_on_load_and_failed_identity_evicted() {
        let mut store = MockFrameStore::new();
        store.expect_clear().times(1).return_const(());
        store
            .expect_fetch()
            .returning(|identity| Err(FetchError::Decode(format!("bad {}", identity))));
        store
            .expect_evict()
            .with(eq("broken"))
            .times(1)
            .return_const(());

        let mut controller = IngestionController::new(Arc::new(store), fast_settings());
        let mut aggregator = SeriesAggregator::new();

        controller.load(ids(&["broken"]), None);
        let events = drain(&mut controller, &mut aggregator).await;

        assert_eq!(
            events,
            vec![IngestEvent::Failed {
                identity: "broken".to_string(),
                error: FetchError::Decode("bad broken".to_string()),
            }]
        );
    }

    #[test]
    fn test_progress_arithmetic() {
        let progress = IngestProgress {
            generation: 1,
            total: 10,
            target: 4,
            limit: Some(4),
            loaded: 1,
            failed: 1,
            loading: true,
        };
        assert_eq!(progress.images_remaining(), 3);
        assert_eq!(progress.more_available(), 4);

        let unlimited = IngestProgress {
            limit: None,
            ..progress
        };
        assert_eq!(unlimited.more_available(), 9);

        let nearly_done = IngestProgress {
            loaded: 8,
            ..progress
        };
        assert_eq!(nearly_done.more_available(), 2);
        assert_eq!(progress.pending(), 2);
        assert!((progress.fraction_settled() - 0.5).abs() < f64::EPSILON);
    }
}
