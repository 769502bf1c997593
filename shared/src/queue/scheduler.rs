use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::BackoffPolicy;
use super::dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterStore};
use super::metrics::{Counters, QueueEvent, QueueMetrics};
use super::operation::{
    OperationError, OperationId, OperationOptions, OperationSnapshot, OperationStatus, QueueError,
};
use crate::{
    UnixTimeMs, BASE_RETRY_DELAY_MS, DEFAULT_DEAD_LETTER_CAPACITY, DEFAULT_QUEUE_CONCURRENCY,
    MAX_RETRY_DELAY_MS,
};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on simultaneously running thunks
    pub concurrency: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub dead_letter_capacity: usize,
    pub event_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_QUEUE_CONCURRENCY,
            base_delay_ms: BASE_RETRY_DELAY_MS,
            max_delay_ms: MAX_RETRY_DELAY_MS,
            jitter_ms: 0,
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
            event_buffer: 256,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.concurrency == 0 {
            return Err(QueueError::InvalidConfig("concurrency must be > 0".into()));
        }
        if self.base_delay_ms == 0 {
            return Err(QueueError::InvalidConfig("base_delay_ms must be > 0".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(QueueError::InvalidConfig(
                "max_delay_ms must be >= base_delay_ms".into(),
            ));
        }
        if self.dead_letter_capacity == 0 {
            return Err(QueueError::InvalidConfig(
                "dead_letter_capacity must be > 0".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(QueueError::InvalidConfig("event_buffer must be > 0".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter_ms: self.jitter_ms,
        }
    }
}

// ============================================================================
// Type-erased operations
// ============================================================================

type AttemptFn = Box<dyn FnMut(CancellationToken) -> BoxFuture<'static, Result<(), OperationError>> + Send>;

/// Delivers the final outcome to the submitter once bookkeeping is done.
trait Completion: Send {
    fn resolve(self: Box<Self>);
    fn reject(self: Box<Self>, error: QueueError);
}

struct ResultSlot<T> {
    value: Arc<Mutex<Option<T>>>,
    tx: oneshot::Sender<Result<T, QueueError>>,
}

impl<T: Send> Completion for ResultSlot<T> {
    fn resolve(self: Box<Self>) {
        let outcome = self.value.lock().take().ok_or(QueueError::Dropped);
        let _ = self.tx.send(outcome);
    }

    fn reject(self: Box<Self>, error: QueueError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Future returned by [`OperationQueue::add`].
#[derive(Debug)]
#[must_use = "the handle resolves with the operation's outcome"]
pub struct OperationHandle<T> {
    id: OperationId,
    rx: oneshot::Receiver<Result<T, QueueError>>,
}

impl<T> OperationHandle<T> {
    pub fn id(&self) -> &OperationId {
        &self.id
    }
}

impl<T> Future for OperationHandle<T> {
    type Output = Result<T, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(QueueError::Dropped)))
    }
}

struct QueuedOperation {
    record: OperationSnapshot,
    attempt: Option<AttemptFn>,
    completion: Box<dyn Completion>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    rank: u8,
    seq: u64,
}

enum AttemptFailure {
    Operation(OperationError),
    Timeout(Duration),
    Panicked,
}

impl AttemptFailure {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Operation(err) => err.is_retryable(),
            Self::Timeout(_) => true,
            Self::Panicked => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Operation(err) => err.to_string(),
            Self::Timeout(after) => format!("timed out after {}ms", after.as_millis()),
            Self::Panicked => "operation panicked".to_string(),
        }
    }

    fn into_queue_error(self) -> QueueError {
        match self {
            Self::Operation(err) => QueueError::Operation(err),
            Self::Timeout(after) => QueueError::Timeout {
                timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
            },
            Self::Panicked => QueueError::Panicked,
        }
    }

    fn dead_letter_reason(&self) -> DeadLetterReason {
        match self {
            Self::Panicked => DeadLetterReason::Panicked,
            failure if failure.is_retryable() => DeadLetterReason::RetriesExhausted,
            _ => DeadLetterReason::NonRetryable,
        }
    }
}

struct StartAttempt {
    id: OperationId,
    attempt: AttemptFn,
    timeout: Option<Duration>,
    attempt_number: u32,
}

struct AttemptDone {
    id: OperationId,
    attempt: AttemptFn,
    outcome: Result<(), AttemptFailure>,
    elapsed: Duration,
}

// ============================================================================
// Queue State
// ============================================================================

struct QueueState {
    ready: BTreeMap<ReadyKey, QueuedOperation>,
    backing_off: Vec<(Instant, QueuedOperation)>,
    running: HashMap<OperationId, QueuedOperation>,
    /// Entity key to the operation currently holding its lane
    busy_entities: HashMap<String, OperationId>,
    dead_letters: DeadLetterStore,
    counters: Counters,
    next_seq: u64,
    paused: bool,
    destroyed: bool,
}

impl QueueState {
    fn new(config: &QueueConfig) -> Self {
        Self {
            ready: BTreeMap::new(),
            backing_off: Vec::new(),
            running: HashMap::new(),
            busy_entities: HashMap::new(),
            dead_letters: DeadLetterStore::new(config.dead_letter_capacity),
            counters: Counters::default(),
            next_seq: 0,
            paused: false,
            destroyed: false,
        }
    }

    fn push_ready(&mut self, mut op: QueuedOperation) {
        op.record.status = OperationStatus::Queued;
        let key = ReadyKey {
            rank: op.record.priority.rank(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.ready.insert(key, op);
    }

    fn queue_length(&self) -> usize {
        self.ready.len() + self.backing_off.len()
    }

    fn promote_due(&mut self, now: Instant) {
        if self.backing_off.is_empty() {
            return;
        }
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.backing_off)
            .into_iter()
            .partition(|(ready_at, _)| *ready_at <= now);
        self.backing_off = waiting;
        // Re-enqueue in the order the backoffs expire
        let mut due = due;
        due.sort_by_key(|(ready_at, _)| *ready_at);
        for (_, op) in due {
            self.push_ready(op);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.backing_off.iter().map(|(at, _)| *at).min()
    }

    /// Highest-priority, earliest-enqueued operation whose entity lane is free.
    fn start_next(&mut self) -> Option<StartAttempt> {
        let key = self
            .ready
            .iter()
            .find(|(_, op)| {
                op.record.entity.as_ref().map_or(true, |entity| {
                    self.busy_entities
                        .get(entity)
                        .map_or(true, |holder| holder == &op.record.id)
                })
            })
            .map(|(key, _)| *key)?;
        let mut op = self.ready.remove(&key)?;
        let attempt = op.attempt.take()?;

        if let Some(entity) = &op.record.entity {
            self.busy_entities
                .insert(entity.clone(), op.record.id.clone());
        }
        op.record.status = OperationStatus::Running;

        let start = StartAttempt {
            id: op.record.id.clone(),
            attempt,
            timeout: op.record.timeout_ms.map(Duration::from_millis),
            attempt_number: op.record.retry_count + 1,
        };
        self.running.insert(op.record.id.clone(), op);
        Some(start)
    }

    fn release_entity(&mut self, record: &OperationSnapshot) {
        if let Some(entity) = &record.entity {
            if self.busy_entities.get(entity) == Some(&record.id) {
                self.busy_entities.remove(entity);
            }
        }
    }

    /// Removes every operation that is not currently running.
    fn drain_waiting(&mut self) -> Vec<QueuedOperation> {
        let mut drained: Vec<QueuedOperation> =
            std::mem::take(&mut self.ready).into_values().collect();
        drained.extend(
            std::mem::take(&mut self.backing_off)
                .into_iter()
                .map(|(_, op)| op),
        );
        for op in &drained {
            self.release_entity(&op.record);
        }
        drained
    }

    fn find(&self, id: &OperationId) -> Option<&OperationSnapshot> {
        self.running
            .get(id)
            .or_else(|| self.ready.values().find(|op| &op.record.id == id))
            .or_else(|| {
                self.backing_off
                    .iter()
                    .map(|(_, op)| op)
                    .find(|op| &op.record.id == id)
            })
            .map(|op| &op.record)
    }
}

// ============================================================================
// Operation Queue
// ============================================================================

struct QueueInner {
    config: QueueConfig,
    backoff: BackoffPolicy,
    state: Mutex<QueueState>,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueInner {
    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn cancel_all(&self, drained: Vec<QueuedOperation>) -> usize {
        let count = drained.len();
        for op in drained {
            self.emit(QueueEvent::Cancelled {
                id: op.record.id.clone(),
            });
            op.completion.reject(QueueError::Cancelled);
        }
        count
    }
}

/// Serialized, priority-ordered executor with retry, backoff and dead-lettering.
///
/// The queue owns a dispatcher task, so it must be created inside a Tokio
/// runtime. Dropping the queue destroys it; operations already running still
/// resolve their handles.
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl OperationQueue {
    #[instrument(skip(config))]
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_buffer);
        let inner = Arc::new(QueueInner {
            backoff: config.backoff(),
            state: Mutex::new(QueueState::new(&config)),
            wake: Notify::new(),
            events,
            config,
        });

        tokio::spawn(dispatch_loop(Arc::clone(&inner)));

        info!(
            concurrency = inner.config.concurrency,
            "Operation queue started"
        );
        Ok(Self { inner })
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Enqueue a thunk. The returned handle resolves once the operation
    /// succeeds, is dead-lettered, or is cancelled.
    ///
    /// The thunk is called once per attempt and receives a token that is
    /// cancelled when the attempt times out.
    pub fn add<T, F, Fut>(
        &self,
        thunk: F,
        options: OperationOptions,
    ) -> Result<OperationHandle<T>, QueueError>
    where
        T: Send + 'static,
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        options.validate()?;

        let id = OperationId::generate();
        let (tx, rx) = oneshot::channel();
        let value = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&value);

        let mut thunk = thunk;
        let attempt: AttemptFn = Box::new(move |cancel: CancellationToken| {
            let fut = thunk(cancel);
            let slot = Arc::clone(&slot);
            async move {
                let result = fut.await?;
                *slot.lock() = Some(result);
                Ok::<(), OperationError>(())
            }
            .boxed()
        });

        let priority = options.priority;
        let op = QueuedOperation {
            record: OperationSnapshot::new(id.clone(), options, UnixTimeMs::now()),
            attempt: Some(attempt),
            completion: Box::new(ResultSlot { value, tx }),
        };

        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(QueueError::Destroyed);
            }
            state.counters.total = state.counters.total.saturating_add(1);
            state.push_ready(op);
        }

        debug!(operation_id = %id, %priority, "Operation enqueued");
        self.inner.emit(QueueEvent::Enqueued {
            id: id.clone(),
            priority,
        });
        self.inner.wake.notify_one();

        Ok(OperationHandle { id, rx })
    }

    /// Stop starting new operations. Running operations finish normally.
    pub fn pause(&self) {
        let changed = {
            let mut state = self.inner.state.lock();
            !std::mem::replace(&mut state.paused, true)
        };
        if changed {
            info!("Operation queue paused");
            self.inner.emit(QueueEvent::Paused);
        }
    }

    pub fn resume(&self) {
        let changed = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            std::mem::replace(&mut state.paused, false)
        };
        if changed {
            info!("Operation queue resumed");
            self.inner.emit(QueueEvent::Resumed);
            self.inner.wake.notify_one();
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Reject every operation that is not running with [`QueueError::Cancelled`].
    /// Returns the number of operations removed.
    #[instrument(skip(self))]
    pub fn clear(&self) -> usize {
        let drained = self.inner.state.lock().drain_waiting();
        let count = self.inner.cancel_all(drained);
        if count > 0 {
            info!(cancelled = count, "Cleared queued operations");
        }
        self.inner.wake.notify_one();
        count
    }

    #[must_use]
    pub fn get_metrics(&self) -> QueueMetrics {
        let state = self.inner.state.lock();
        QueueMetrics {
            total_operations: state.counters.total,
            completed_operations: state.counters.completed,
            failed_operations: state.counters.failed,
            avg_processing_time_ms: state.counters.avg_processing_ms,
            queue_length: state.queue_length(),
            is_processing: !state.running.is_empty(),
        }
    }

    #[must_use]
    pub fn get_operation(&self, id: &OperationId) -> Option<OperationSnapshot> {
        self.inner.state.lock().find(id).cloned()
    }

    #[must_use]
    pub fn get_dead_letter_queue(&self) -> Vec<DeadLetterEntry> {
        self.inner.state.lock().dead_letters.snapshot()
    }

    pub fn clear_dead_letter_queue(&self) -> usize {
        let cleared = self.inner.state.lock().dead_letters.clear();
        debug!(cleared, "Dead-letter queue cleared");
        cleared
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Pause, cancel everything waiting and stop the dispatcher once
    /// in-flight work has drained. The queue rejects new work afterwards.
    #[instrument(skip(self))]
    pub fn destroy(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.paused = true;
            state.destroyed = true;
            state.drain_waiting()
        };
        let cancelled = self.inner.cancel_all(drained);
        self.inner.wake.notify_one();
        info!(cancelled, "Operation queue destroyed");
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

async fn dispatch_loop(inner: Arc<QueueInner>) {
    let mut in_flight: JoinSet<AttemptDone> = JoinSet::new();

    loop {
        let (starts, next_due, finished) = {
            let mut state = inner.state.lock();
            state.promote_due(Instant::now());

            let mut starts = Vec::new();
            if !state.paused {
                while state.running.len() < inner.config.concurrency {
                    match state.start_next() {
                        Some(start) => starts.push(start),
                        None => break,
                    }
                }
            }
            (
                starts,
                state.next_due(),
                state.destroyed && state.running.is_empty(),
            )
        };

        if finished {
            let leftover = inner.state.lock().drain_waiting();
            inner.cancel_all(leftover);
            debug!("Dispatcher exiting");
            break;
        }

        for start in starts {
            inner.emit(QueueEvent::Started {
                id: start.id.clone(),
                attempt: start.attempt_number,
            });
            in_flight.spawn(run_attempt(start));
        }

        let sleep = tokio::time::sleep_until(
            next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
        );

        tokio::select! {
            () = inner.wake.notified() => {}
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                match joined {
                    Ok(done) => finish_attempt(&inner, done),
                    Err(err) => error!("Attempt task failed to join: {err}"),
                }
            }
            () = sleep, if next_due.is_some() => {}
        }
    }
}

async fn run_attempt(start: StartAttempt) -> AttemptDone {
    let StartAttempt {
        id,
        mut attempt,
        timeout,
        attempt_number,
    } = start;
    let cancel = CancellationToken::new();
    let started = Instant::now();

    debug!(operation_id = %id, attempt = attempt_number, "Attempt started");

    let outcome = AssertUnwindSafe(async {
        let fut = attempt(cancel.clone());
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(AttemptFailure::Operation),
                Err(_) => {
                    cancel.cancel();
                    Err(AttemptFailure::Timeout(limit))
                }
            },
            None => fut.await.map_err(AttemptFailure::Operation),
        }
    })
    .catch_unwind()
    .await
    .unwrap_or(Err(AttemptFailure::Panicked));

    AttemptDone {
        id,
        attempt,
        outcome,
        elapsed: started.elapsed(),
    }
}

enum Settlement {
    Resolve(Box<dyn Completion>),
    Reject(Box<dyn Completion>, QueueError),
}

fn finish_attempt(inner: &QueueInner, done: AttemptDone) {
    let AttemptDone {
        id,
        attempt,
        outcome,
        elapsed,
    } = done;

    let mut events = Vec::new();
    let settlement = {
        let mut state = inner.state.lock();
        let Some(mut op) = state.running.remove(&id) else {
            warn!(operation_id = %id, "Finished attempt for unknown operation");
            return;
        };

        match outcome {
            Ok(()) => {
                state.counters.record_success(elapsed);
                state.release_entity(&op.record);
                op.record.status = OperationStatus::Succeeded;
                events.push(QueueEvent::Succeeded {
                    id: id.clone(),
                    elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
                Some(Settlement::Resolve(op.completion))
            }
            Err(failure) if state.destroyed => {
                debug!(operation_id = %id, "Queue destroyed, not retrying: {}", failure.describe());
                state.release_entity(&op.record);
                events.push(QueueEvent::Cancelled { id: id.clone() });
                Some(Settlement::Reject(op.completion, QueueError::Cancelled))
            }
            Err(failure) if failure.is_retryable() && op.record.can_retry() => {
                let delay = inner.backoff.delay_for(op.record.retry_count);
                let message = failure.describe();
                op.record.retry_count += 1;
                op.record.status = OperationStatus::FailedRetrying;
                op.record.last_error = Some(message.clone());
                op.attempt = Some(attempt);

                warn!(
                    operation_id = %id,
                    retry_count = op.record.retry_count,
                    max_retries = op.record.max_retries,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying: {message}"
                );
                events.push(QueueEvent::Retrying {
                    id: id.clone(),
                    retry_count: op.record.retry_count,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error: message,
                });
                state.backing_off.push((Instant::now() + delay, op));
                None
            }
            Err(failure) => {
                let message = failure.describe();
                let attempts_made = op.record.retry_count + 1;
                state.counters.record_failure();
                state.release_entity(&op.record);
                op.record.status = OperationStatus::DeadLettered;
                op.record.last_error = Some(message.clone());

                error!(
                    operation_id = %id,
                    attempts_made,
                    "Operation dead-lettered: {message}"
                );
                state.dead_letters.push(DeadLetterEntry {
                    operation: op.record.clone(),
                    final_error: message.clone(),
                    attempts_made,
                    reason: failure.dead_letter_reason(),
                    timestamp: UnixTimeMs::now(),
                });
                events.push(QueueEvent::DeadLettered {
                    id: id.clone(),
                    attempts_made,
                    error: message,
                });
                Some(Settlement::Reject(op.completion, failure.into_queue_error()))
            }
        }
    };

    for event in events {
        inner.emit(event);
    }
    match settlement {
        Some(Settlement::Resolve(completion)) => completion.resolve(),
        Some(Settlement::Reject(completion, error)) => completion.reject(error),
        None => {}
    }
}
