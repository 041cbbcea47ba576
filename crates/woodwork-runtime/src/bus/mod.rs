//! Asynchronous publish/subscribe message bus.
//!
//! Every subscriber owns a bounded FIFO queue drained by one dispatcher
//! task, so events from a single producer reach each subscriber in order.
//! A failed delivery is retried with exponential backoff until the attempt
//! budget runs out, then recorded once as a dead letter. Two background
//! tasks run beside the dispatchers: the retry processor and the cleanup
//! sweep over streams and stale retries. Stale retries are dead-lettered
//! too. Only the most recent `dead_letter_capacity` letters are kept.
//!
//! ```text
//!  emit ──► topic table ──► queue(sub A) ──► dispatcher A ──► deliver
//!                      └──► queue(sub B) ──► dispatcher B ──► deliver
//!                                                   │ failure
//!                                                   ▼
//!                               retry queue ──(due)──► queue(sub B)
//!                                                   │ out of attempts
//!                                                   ▼
//!                                              dead letters
//! ```

pub mod adapters;
pub mod event;
pub mod retry;
pub mod stream;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use woodwork_common::config::BusConfig;
use woodwork_common::error::{Result, WoodworkError};
use woodwork_common::types::StreamId;

use self::event::{BusStats, DeadLetter, Event};
use self::retry::{FailureOutcome, RetryEntry, RetryQueue};
use self::stream::{StreamReader, StreamRegistry, StreamWriter};

const MIN_TICK: Duration = Duration::from_millis(1);
const SETTLE_POLL: Duration = Duration::from_millis(5);
/// Extra time given to tracked tasks to observe stream truncation.
const TRUNCATION_SETTLE: Duration = Duration::from_millis(100);

/// Receives events from the bus.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handles one event. An error schedules a retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be handled.
    async fn deliver(&self, event: &Event, bus: &BusHandle) -> Result<()>;
}

struct Delivery {
    event: Event,
    attempt: u32,
    first_failure: Option<Instant>,
}

#[derive(Default)]
struct Counters {
    emitted: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BusStats {
        BusStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    config: BusConfig,
    topics: Mutex<HashMap<String, Vec<String>>>,
    queues: Mutex<HashMap<String, mpsc::Sender<Delivery>>>,
    retries: Mutex<RetryQueue>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    streams: StreamRegistry,
    tasks: Mutex<JoinSet<()>>,
    counters: Counters,
    in_flight: AtomicU64,
    closed: AtomicBool,
}

/// Holds one unit of in-flight work until dropped.
struct InFlight(Arc<Shared>);

impl InFlight {
    fn enter(shared: &Arc<Shared>) -> Self {
        let _ = shared.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(shared))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let _ = self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn sender(&self, subscriber: &str) -> Option<mpsc::Sender<Delivery>> {
        lock(&self.queues).get(subscriber).cloned()
    }

    fn on_failure(&self, delivery: Delivery, subscriber: &str, error: &WoodworkError) {
        let outcome = retry::after_failure(
            &self.config,
            delivery.event,
            subscriber,
            delivery.attempt,
            error.to_string(),
            delivery.first_failure,
        );
        match outcome {
            FailureOutcome::Retry(entry) => {
                tracing::warn!(
                    subscriber,
                    topic = %entry.event.topic,
                    attempt = entry.attempts,
                    error = %error,
                    "delivery failed, scheduling retry"
                );
                lock(&self.retries).push(entry);
            }
            FailureOutcome::DeadLetter(letter) => {
                tracing::error!(
                    subscriber,
                    topic = %letter.event.topic,
                    event_id = %letter.event.id,
                    attempts = letter.attempts,
                    error = %letter.error,
                    "delivery gave up, message dead-lettered"
                );
                self.record_dead_letter(letter);
            }
        }
    }

    /// Keeps `letter` among the most recent dead letters.
    fn record_dead_letter(&self, letter: DeadLetter) {
        Counters::bump(&self.counters.dead_lettered);
        let mut letters = lock(&self.dead_letters);
        if letters.len() >= self.config.dead_letter_capacity.max(1) {
            let _ = letters.pop_front();
        }
        letters.push_back(letter);
    }
}

/// Cloneable access to a running bus, handed to subscribers.
#[derive(Clone)]
pub struct BusHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusHandle")
            .field("stats", &self.stats())
            .field("streams", &self.shared.streams)
            .finish_non_exhaustive()
    }
}

impl BusHandle {
    /// Publishes `event` to every subscriber of its topic that it targets.
    ///
    /// Waits for queue space when a subscriber is backed up. Returns the
    /// number of subscribers the event was queued for.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is shut down.
    pub async fn emit(&self, event: Event) -> Result<usize> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(WoodworkError::runtime("message bus is shut down"));
        }
        Counters::bump(&self.shared.counters.emitted);
        let recipients: Vec<String> = lock(&self.shared.topics)
            .get(&event.topic)
            .map(|subs| subs.iter().filter(|s| event.is_for(s)).cloned().collect())
            .unwrap_or_default();
        if recipients.is_empty() {
            tracing::debug!(topic = %event.topic, "event has no subscribers");
            return Ok(0);
        }

        let mut queued = 0;
        for subscriber in recipients {
            let Some(queue) = self.shared.sender(&subscriber) else {
                tracing::debug!(subscriber = %subscriber, topic = %event.topic, "subscriber queue closed");
                continue;
            };
            let delivery = Delivery {
                event: event.clone(),
                attempt: 1,
                first_failure: None,
            };
            let _ = self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
            if queue.send(delivery).await.is_ok() {
                queued += 1;
            } else {
                let _ = self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }
        tracing::trace!(topic = %event.topic, event_id = %event.id, queued, "event emitted");
        Ok(queued)
    }

    /// Opens a stream for chunked output.
    #[must_use]
    pub fn open_stream(&self) -> StreamWriter {
        self.shared.streams.open(self.shared.config.stream_capacity)
    }

    /// Claims the single reader of stream `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is unknown or already claimed.
    pub fn receive_chunks(&self, id: &StreamId) -> Result<StreamReader> {
        self.shared.streams.take_reader(id)
    }

    /// Runs `task` beside the dispatchers. It counts as in-flight work, so
    /// shutdown waits for it within the grace period, and it is aborted if
    /// it outlives the streams.
    pub fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = InFlight::enter(&self.shared);
        let _ = lock(&self.shared.tasks).spawn(async move {
            task.await;
            drop(guard);
        });
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        self.shared.counters.snapshot()
    }

    /// The most recent messages given up on, oldest first. At most
    /// `dead_letter_capacity` are kept; the counter in [`BusHandle::stats`]
    /// counts all of them.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.shared.dead_letters).iter().cloned().collect()
    }

    /// Deliveries waiting for another attempt.
    #[must_use]
    pub fn pending_retries(&self) -> usize {
        lock(&self.shared.retries).len()
    }

    /// Streams currently tracked.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.shared.streams.len()
    }

    /// The bus policy.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }
}

/// What [`MessageBus::shutdown`] found and discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Dispatchers that did not finish within the grace period.
    pub dispatchers_aborted: usize,
    /// Tracked tasks, such as stream readers, aborted after truncation.
    pub tasks_aborted: usize,
    /// Retry entries dropped.
    pub retries_discarded: usize,
    /// Streams truncated.
    pub streams_truncated: usize,
    /// Final counters.
    pub stats: BusStats,
}

/// The bus with its subscriber table and background tasks.
pub struct MessageBus {
    handle: BusHandle,
    pending: Vec<(String, Arc<dyn Subscriber>, mpsc::Receiver<Delivery>)>,
    dispatchers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    stop: CancellationToken,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("handle", &self.handle)
            .field("dispatchers", &self.dispatchers.len())
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            topics: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            retries: Mutex::new(RetryQueue::default()),
            dead_letters: Mutex::new(VecDeque::new()),
            streams: StreamRegistry::default(),
            tasks: Mutex::new(JoinSet::new()),
            counters: Counters::default(),
            in_flight: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        Self {
            handle: BusHandle { shared },
            pending: Vec::new(),
            dispatchers: Vec::new(),
            background: Vec::new(),
            stop: CancellationToken::new(),
        }
    }

    /// Handle for emitting and streaming.
    #[must_use]
    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    /// Registers `subscriber` under `name` for `topics`. The subscriber
    /// receives events once [`MessageBus::start`] runs.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is already subscribed.
    pub fn subscribe(&mut self, name: &str, topics: &[String], subscriber: Arc<dyn Subscriber>) -> Result<()> {
        let shared = &self.handle.shared;
        let mut queues = lock(&shared.queues);
        if queues.contains_key(name) {
            return Err(WoodworkError::Config {
                message: format!("subscriber \"{name}\" registered twice"),
            });
        }
        let (tx, rx) = mpsc::channel(shared.config.queue_capacity.max(1));
        let _ = queues.insert(name.to_string(), tx);
        drop(queues);

        let mut table = lock(&shared.topics);
        for topic in topics {
            let subs = table.entry(topic.clone()).or_default();
            if !subs.iter().any(|s| s == name) {
                subs.push(name.to_string());
            }
        }
        tracing::debug!(subscriber = name, ?topics, "subscribed");
        self.pending.push((name.to_string(), subscriber, rx));
        Ok(())
    }

    /// Names subscribed to `topic`, in registration order.
    #[must_use]
    pub fn subscribers_of(&self, topic: &str) -> Vec<String> {
        lock(&self.handle.shared.topics).get(topic).cloned().unwrap_or_default()
    }

    /// Spawns the dispatchers and the retry and cleanup tasks.
    pub fn start(&mut self) {
        for (name, subscriber, rx) in self.pending.drain(..) {
            let handle = self.handle.clone();
            self.dispatchers
                .push(tokio::spawn(dispatch(name, subscriber, rx, handle)));
        }
        let shared = &self.handle.shared;
        self.background.push(tokio::spawn(retry_loop(
            Arc::clone(shared),
            self.stop.clone(),
        )));
        self.background.push(tokio::spawn(cleanup_loop(
            Arc::clone(shared),
            self.stop.clone(),
        )));
        tracing::info!(subscribers = self.dispatchers.len(), "message bus started");
    }

    /// Stops the bus: background tasks first, then queued and running
    /// deliveries get the grace period to finish (including the events they
    /// emit), then pending retries are discarded and open streams truncated.
    pub async fn shutdown(mut self) -> ShutdownReport {
        let shared = Arc::clone(&self.handle.shared);
        self.stop.cancel();
        for task in self.background.drain(..) {
            let _ = task.await;
        }

        let deadline = tokio::time::Instant::now() + shared.config.shutdown_grace();
        while shared.in_flight.load(Ordering::Acquire) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(SETTLE_POLL).await;
        }

        shared.closed.store(true, Ordering::Release);
        lock(&shared.queues).clear();

        let mut dispatchers_aborted = 0;
        for mut task in self.dispatchers.drain(..) {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                dispatchers_aborted += 1;
            }
        }
        if dispatchers_aborted > 0 {
            tracing::warn!(dispatchers_aborted, grace_ms = shared.config.shutdown_grace_ms, "dispatchers did not settle");
        }

        let retries_discarded = lock(&shared.retries).clear();
        if retries_discarded > 0 {
            tracing::warn!(retries_discarded, "pending retries discarded at shutdown");
        }
        let streams_truncated = shared.streams.truncate_all();
        let tasks_aborted = drain_tracked(&shared, deadline.max(tokio::time::Instant::now() + TRUNCATION_SETTLE)).await;
        if tasks_aborted > 0 {
            tracing::warn!(tasks_aborted, "tracked tasks did not settle");
        }
        let stats = shared.counters.snapshot();
        tracing::info!(
            emitted = stats.emitted,
            delivered = stats.delivered,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            "message bus stopped"
        );
        ShutdownReport {
            dispatchers_aborted,
            tasks_aborted,
            retries_discarded,
            streams_truncated,
            stats,
        }
    }
}

/// Waits for tracked tasks until `deadline`, then aborts the rest. Returns
/// how many were aborted.
async fn drain_tracked(shared: &Shared, deadline: tokio::time::Instant) -> usize {
    let mut tasks = std::mem::take(&mut *lock(&shared.tasks));
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Err(e))) if e.is_panic() => tracing::error!(error = %e, "tracked task panicked"),
            Ok(Some(_)) => {}
            Ok(None) => return 0,
            Err(_) => {
                let aborted = tasks.len();
                tasks.abort_all();
                return aborted;
            }
        }
    }
}

async fn dispatch(
    name: String,
    subscriber: Arc<dyn Subscriber>,
    mut rx: mpsc::Receiver<Delivery>,
    handle: BusHandle,
) {
    while let Some(delivery) = rx.recv().await {
        tracing::trace!(subscriber = %name, topic = %delivery.event.topic, attempt = delivery.attempt, "delivering");
        match subscriber.deliver(&delivery.event, &handle).await {
            Ok(()) => Counters::bump(&handle.shared.counters.delivered),
            Err(e) => handle.shared.on_failure(delivery, &name, &e),
        }
        let _ = handle.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
    tracing::debug!(subscriber = %name, "dispatcher finished");
}

async fn retry_loop(shared: Arc<Shared>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.retry_interval().max(MIN_TICK));
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => requeue_due(&shared),
        }
    }
}

fn requeue_due(shared: &Shared) {
    let due = lock(&shared.retries).take_due(Instant::now());
    for entry in due {
        let Some(queue) = shared.sender(&entry.subscriber) else {
            lock(&shared.retries).push(entry);
            continue;
        };
        let RetryEntry {
            event,
            subscriber,
            attempts,
            created_at,
            ..
        } = entry;
        let delivery = Delivery {
            event,
            attempt: attempts + 1,
            first_failure: Some(created_at),
        };
        let _ = shared.in_flight.fetch_add(1, Ordering::AcqRel);
        match queue.try_send(delivery) {
            Ok(()) => {
                Counters::bump(&shared.counters.retried);
                tracing::debug!(subscriber = %subscriber, attempt = attempts + 1, "retry queued");
            }
            Err(mpsc::error::TrySendError::Full(delivery) | mpsc::error::TrySendError::Closed(delivery)) => {
                let _ = shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                lock(&shared.retries).push(RetryEntry {
                    event: delivery.event,
                    subscriber,
                    attempts,
                    max_attempts: shared.config.max_attempts,
                    next_attempt_at: Instant::now() + shared.config.retry_interval(),
                    created_at,
                    last_error: "subscriber queue full".into(),
                });
            }
        }
    }
}

async fn cleanup_loop(shared: Arc<Shared>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.cleanup_interval().max(MIN_TICK));
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => sweep(&shared, Instant::now()),
        }
    }
}

fn sweep(shared: &Shared, now: Instant) {
    let streams = shared.streams.cleanup(now, shared.config.stream_ttl());
    let live: Vec<String> = lock(&shared.queues).keys().cloned().collect();
    let stale = lock(&shared.retries).purge(now, shared.config.retry_ttl(), |s| {
        live.iter().any(|l| l == s)
    });
    let retries = stale.len();
    for entry in stale {
        let reason = if live.iter().any(|l| *l == entry.subscriber) {
            "retry expired"
        } else {
            "subscriber gone"
        };
        let letter = entry.into_dead_letter(reason);
        tracing::error!(
            subscriber = %letter.subscriber,
            topic = %letter.event.topic,
            event_id = %letter.event.id,
            attempts = letter.attempts,
            reason,
            "stale retry dead-lettered"
        );
        shared.record_dead_letter(letter);
    }
    if streams > 0 || retries > 0 {
        tracing::debug!(streams, retries, "cleanup removed stale entries");
    }
}
