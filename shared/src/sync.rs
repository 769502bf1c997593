use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::ConfigError;
use crate::network::{NetworkStatusMonitor, NetworkSubscription, NetworkTransition};
use crate::offline_store::{MediaId, MediaPayload, MediaStoreError, OfflineMediaStore, SyncReport};
use crate::SYNC_STABILIZATION_DELAY_MS;

const MAX_STABILIZATION_DELAY_MS: u64 = 10 * 60 * 1000;
const EVENT_BUFFER: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Wait after an offline-to-online transition before draining
    pub stabilization_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stabilization_delay_ms: SYNC_STABILIZATION_DELAY_MS,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stabilization_delay_ms > MAX_STABILIZATION_DELAY_MS {
            return Err(ConfigError::Invalid {
                section: "sync",
                reason: format!(
                    "stabilization_delay_ms exceeds {MAX_STABILIZATION_DELAY_MS}"
                ),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Already online when the coordinator started
    Startup,
    NetworkRestored,
    Capture,
    Manual,
    /// Catches captures that arrived while a pass was running
    FollowUp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    WentOffline,
    Superseded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    PassStarted {
        trigger: SyncTrigger,
    },
    PassCompleted {
        trigger: SyncTrigger,
        report: SyncReport,
    },
    PassSkipped {
        trigger: SyncTrigger,
        reason: SkipReason,
    },
}

#[derive(Debug, Default)]
struct PassState {
    running: bool,
    follow_up: bool,
}

/// Ownership of the single running pass. Dropping it mid-pass frees the slot.
struct RunningPass<'a> {
    state: &'a Mutex<PassState>,
    finished: bool,
}

impl RunningPass<'_> {
    /// Decide atomically whether a follow-up pass is owed or the slot is released.
    fn take_follow_up(&mut self) -> bool {
        let mut state = self.state.lock();
        if state.follow_up {
            state.follow_up = false;
            true
        } else {
            state.running = false;
            self.finished = true;
            false
        }
    }
}

impl Drop for RunningPass<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.state.lock();
            state.running = false;
            state.follow_up = false;
        }
    }
}

struct CoordinatorInner {
    store: Arc<OfflineMediaStore>,
    network: NetworkStatusMonitor,
    config: SyncConfig,
    pass: Mutex<PassState>,
    /// Bumped on every transition; a debounced pass only runs if still current
    generation: AtomicU64,
    last_report: Mutex<Option<SyncReport>>,
    events: broadcast::Sender<SyncEvent>,
}

impl CoordinatorInner {
    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    async fn run_pass(&self, trigger: SyncTrigger) -> Option<SyncReport> {
        {
            let mut state = self.pass.lock();
            if state.running {
                if trigger == SyncTrigger::Capture {
                    state.follow_up = true;
                }
                drop(state);
                debug!(?trigger, "Sync pass already running");
                self.emit(SyncEvent::PassSkipped {
                    trigger,
                    reason: SkipReason::AlreadyRunning,
                });
                return None;
            }
            state.running = true;
        }
        let mut slot = RunningPass {
            state: &self.pass,
            finished: false,
        };

        let mut combined: Option<SyncReport> = None;
        let mut attempted: HashSet<MediaId> = HashSet::new();
        let mut current = trigger;
        loop {
            info!(trigger = ?current, "Sync pass started");
            self.emit(SyncEvent::PassStarted { trigger: current });

            let report = if current == SyncTrigger::FollowUp {
                self.store.sync_where(|m| !attempted.contains(&m.id)).await
            } else {
                self.store.sync().await
            };
            attempted.extend(report.attempted_ids.iter().cloned());

            *self.last_report.lock() = Some(report.clone());
            self.emit(SyncEvent::PassCompleted {
                trigger: current,
                report: report.clone(),
            });
            match combined.as_mut() {
                Some(total) => total.absorb(report),
                None => combined = Some(report),
            }

            if !slot.take_follow_up() {
                break;
            }
            current = SyncTrigger::FollowUp;
        }
        combined
    }
}

/// Drains the offline media store whenever connectivity returns, one pass at a time.
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
    shutdown: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// Start watching `network`. Must be called inside a Tokio runtime.
    #[instrument(skip_all)]
    pub fn start(
        store: Arc<OfflineMediaStore>,
        network: NetworkStatusMonitor,
        config: SyncConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let subscription = network.subscribe();
        let initially_online = network.is_online();
        let inner = Arc::new(CoordinatorInner {
            store,
            network,
            config,
            pass: Mutex::new(PassState::default()),
            generation: AtomicU64::new(0),
            last_report: Mutex::new(None),
            events,
        });
        let shutdown = CancellationToken::new();

        if initially_online {
            schedule_debounced(&inner, SyncTrigger::Startup, &shutdown);
        }
        let watcher = tokio::spawn(watch_network(
            Arc::clone(&inner),
            subscription,
            shutdown.clone(),
        ));

        info!(
            stabilization_delay_ms = inner.config.stabilization_delay_ms,
            "Sync coordinator started"
        );
        Ok(Self {
            inner,
            shutdown,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Save a captured item and, when online, upload it right away.
    pub fn capture(
        &self,
        payload: MediaPayload,
        checklist_item_id: &str,
        inspection_id: &str,
    ) -> Result<MediaId, MediaStoreError> {
        let saved = self
            .inner
            .store
            .save(payload, checklist_item_id, inspection_id);

        // A failed write still leaves the item in memory for the next pass
        let worth_syncing = matches!(saved, Ok(_) | Err(MediaStoreError::PersistFailed { .. }));
        if worth_syncing && self.inner.network.is_online() && !self.shutdown.is_cancelled() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.run_pass(SyncTrigger::Capture).await;
            });
        }
        saved
    }

    /// Run a pass now. `None` if a pass is already in progress.
    pub async fn sync_now(&self) -> Option<SyncReport> {
        self.inner.run_pass(SyncTrigger::Manual).await
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.inner.pass.lock().running
    }

    #[must_use]
    pub fn last_report(&self) -> Option<SyncReport> {
        self.inner.last_report.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<OfflineMediaStore> {
        &self.inner.store
    }

    /// Stop reacting to network transitions. Pending debounced passes are dropped;
    /// a pass already running finishes on its own.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        info!("Sync coordinator stopped");
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn schedule_debounced(inner: &Arc<CoordinatorInner>, trigger: SyncTrigger, shutdown: &CancellationToken) {
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let delay = Duration::from_millis(inner.config.stabilization_delay_ms);
    let inner = Arc::clone(inner);
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        if inner.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "Debounced sync superseded by a newer transition");
            inner.emit(SyncEvent::PassSkipped {
                trigger,
                reason: SkipReason::Superseded,
            });
            return;
        }
        if !inner.network.is_online() {
            inner.emit(SyncEvent::PassSkipped {
                trigger,
                reason: SkipReason::WentOffline,
            });
            return;
        }
        inner.run_pass(trigger).await;
    });
}

async fn watch_network(
    inner: Arc<CoordinatorInner>,
    mut subscription: NetworkSubscription,
    shutdown: CancellationToken,
) {
    loop {
        let transition = tokio::select! {
            () = shutdown.cancelled() => break,
            transition = subscription.next_transition() => match transition {
                Some(transition) => transition,
                None => break,
            },
        };

        match transition {
            NetworkTransition::Online => {
                schedule_debounced(&inner, SyncTrigger::NetworkRestored, &shutdown);
            }
            NetworkTransition::Offline => {
                // Invalidate any pass still waiting out its stabilization delay
                inner.generation.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
    debug!("Network watcher exiting");
}
