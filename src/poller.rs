//! State machine `Idle → Running → Stopping → Stopped`. On `start`: spawns
//! the [`Scheduler`] tick loop, `N` workers, and a master loop fanning
//! scheduled repositories into a bounded work channel (capacity `batch_size
//! * 2`; overflow drops-with-warn for the cycle, retried next cycle since
//! the scheduler still holds `next_poll_time` in the past). On `stop`:
//! ceases scheduling, closes the channel, waits for workers to drain under
//! a grace timeout.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::branch_monitor;
use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::event_generator;
use crate::git_client::{self, RetryPolicy};
use crate::rate_limiter::RateLimiterRegistry;
use crate::scheduler::{ScheduleEntry, Scheduler};
use crate::store::Store;
use crate::telemetry::Metrics;
use crate::types::{ChangeType, Event, EventStatus};
use crate::url_parser::parse_repository_url;

const DISPATCH_TASK_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_INTERVAL: Duration = Duration::from_secs(30);
const DRAIN_BATCH: i64 = 100;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl From<u8> for PollerState {
    fn from(v: u8) -> Self {
        match v {
            0 => PollerState::Idle,
            1 => PollerState::Running,
            2 => PollerState::Stopping,
            _ => PollerState::Stopped,
        }
    }
}

/// Shared, cloneable handle to the running poller: orchestrates
/// `GitClient`/`RateLimiter`/`BranchMonitor`/`EventGenerator`/`Dispatcher`/
/// `Scheduler` (C3-C8) behind a worker pool.
#[derive(Clone)]
pub struct PollerCore {
    inner: Arc<Inner>,
}

struct Inner {
    config: watch::Receiver<AppConfig>,
    store: Store,
    scheduler: Arc<Scheduler>,
    rate_limiters: Arc<RateLimiterRegistry>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl PollerCore {
    pub fn new(config: watch::Receiver<AppConfig>, store: Store) -> Result<Self> {
        let cfg = config.borrow().clone();
        let dispatcher = Dispatcher::new(cfg.dispatcher.clone())?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                scheduler: Arc::new(Scheduler::new()),
                rate_limiters: Arc::new(RateLimiterRegistry::new()),
                dispatcher: Arc::new(dispatcher),
                metrics: Arc::new(Metrics::new()),
                state: AtomicU8::new(PollerState::Idle as u8),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn state(&self) -> PollerState {
        PollerState::from(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    pub fn dispatcher_metrics(&self) -> Arc<crate::dispatcher::DispatchMetrics> {
        self.inner.dispatcher.metrics()
    }

    pub fn scheduler_snapshot(&self) -> Vec<ScheduleEntry> {
        self.inner.scheduler.snapshot()
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Starts the scheduler tick loop, `worker_count` workers, and the
    /// periodic pending-event drain. Returns once `Running` has been
    /// reached; the spawned tasks run until `stop()` is called.
    pub async fn start(&self) -> Result<()> {
        let cfg = self.inner.config.borrow().clone();
        for repo in &cfg.repositories {
            self.inner.scheduler.schedule(repo, cfg.polling.interval);
        }

        let (tx, rx) = mpsc::channel::<String>(cfg.polling.batch_size * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..cfg.polling.worker_count {
            let this = self.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                this.worker_loop(worker_id, rx).await;
            });
        }

        {
            let this = self.clone();
            tokio::spawn(async move {
                this.master_loop(tx).await;
            });
        }

        {
            let this = self.clone();
            tokio::spawn(async move {
                this.drain_loop().await;
            });
        }

        self.inner.state.store(PollerState::Running as u8, Ordering::SeqCst);
        info!(workers = cfg.polling.worker_count, "reposentry poller started");
        Ok(())
    }

    /// Stops scheduling, signals cancellation, and waits (best-effort, the
    /// caller decides how long) for in-flight work to observe it.
    pub async fn stop(&self, grace: Duration) {
        self.inner.state.store(PollerState::Stopping as u8, Ordering::SeqCst);
        self.inner.cancel.cancel();
        tokio::time::sleep(grace).await;
        self.inner.state.store(PollerState::Stopped as u8, Ordering::SeqCst);
        info!("reposentry poller stopped");
    }

    async fn master_loop(&self, tx: mpsc::Sender<String>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = tick.tick() => {
                    for repo_name in self.inner.scheduler.due() {
                        match tx.try_send(repo_name.clone()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!(repository = %repo_name, "work queue full, dropping this cycle; will retry next tick");
                                self.inner.scheduler.mark_done(&repo_name);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                }
            }
        }
    }

    async fn worker_loop(&self, worker_id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>) {
        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = self.inner.cancel.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(repo_name) = next else { return };

            debug!(worker_id, repository = %repo_name, "picked up repository for polling");
            if let Err(e) = self.poll_repository(&repo_name).await {
                error!(repository = %repo_name, error = %e, "poll failed");
            }
            self.inner.scheduler.mark_done(&repo_name);
        }
    }

    /// Executes one `PollRepository` cycle under a per-poll timeout: fetch
    /// live branches, diff against the baseline, persist generated events,
    /// upsert baselines for changed branches, and spawn a detached dispatch
    /// task per event.
    async fn poll_repository(&self, repo_name: &str) -> Result<()> {
        let cfg = self.inner.config.borrow().clone();
        let Some(repository) = cfg.repositories.iter().find(|r| r.name == repo_name) else {
            return Ok(());
        };
        self.inner.metrics.record_poll();

        let poll_cancel = self.inner.cancel.child_token();

        let repo_url = parse_repository_url(&repository.url)?;
        let retry = RetryPolicy {
            attempts: cfg.polling.retry_attempts.max(1),
            backoff: cfg.polling.retry_backoff,
        };
        let client = git_client::build_client(repository, &repo_url, &self.inner.rate_limiters, retry, true)?;

        let poll_future = branch_monitor::poll_repository(repository, client.as_ref(), &self.inner.store, &poll_cancel);
        let changes = match tokio::time::timeout(cfg.polling.per_poll_timeout, poll_future).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(repository = %repo_name, "poll timed out");
                poll_cancel.cancel();
                return Ok(());
            }
        };

        if self.inner.cancel.is_cancelled() {
            return Ok(());
        }

        if changes.is_empty() {
            return Ok(());
        }

        let events = event_generator::generate_events(repository, &changes);
        self.inner.metrics.record_events_emitted(events.len() as u64);

        // Persist events before mutating baselines: a `save_event` failure
        // must leave the baseline untouched so the next poll re-detects the
        // change instead of silently losing it (the deterministic event id
        // dedupes anything that had actually landed).
        let mut saved_events = Vec::with_capacity(events.len());
        for event in events {
            match self.inner.store.save_event(&event).await {
                Ok(()) => saved_events.push(event),
                Err(crate::error::Error::DuplicateEvent(id)) => {
                    debug!(event_id = %id, "duplicate event id, skipping (idempotency safeguard)");
                }
                Err(e) => return Err(e),
            }
        }

        for change in &changes {
            if change.change_type == ChangeType::Deleted {
                self.inner.store.delete_repo_state(&repository.name, &change.branch).await?;
            } else if let Some(new_sha) = &change.new_sha {
                self.inner
                    .store
                    .upsert_repo_state(&repository.name, &change.branch, new_sha, Utc::now())
                    .await?;
            }
        }

        for event in saved_events {
            self.spawn_dispatch(event);
        }

        Ok(())
    }

    /// Fire-and-forget dispatch: the poll path never blocks on HTTPS to the
    /// EventListener. The spawned task gets its own `DISPATCH_TASK_TIMEOUT`
    /// budget; the Store's event journal is the synchronization point.
    fn spawn_dispatch(&self, event: Event) {
        let this = self.clone();
        tokio::spawn(async move {
            this.inner.metrics.record_dispatch_attempt();
            let outcome = tokio::time::timeout(DISPATCH_TASK_TIMEOUT, this.inner.dispatcher.send(&event)).await;
            this.record_dispatch_outcome(&event.id, outcome).await;
        });
    }

    async fn record_dispatch_outcome(
        &self,
        event_id: &str,
        outcome: std::result::Result<Result<()>, tokio::time::error::Elapsed>,
    ) {
        match outcome {
            Ok(Ok(())) => {
                self.inner.metrics.record_event_processed();
                if let Err(e) = self
                    .inner
                    .store
                    .update_event_status(event_id, EventStatus::Processed, None)
                    .await
                {
                    error!(event_id, error = %e, "failed to record processed status");
                }
            }
            Ok(Err(e)) if e.is_retryable() => {
                debug!(event_id, error = %e, "dispatch retryable failure, leaving for drain");
                if let Err(store_err) = self
                    .inner
                    .store
                    .update_event_status(event_id, EventStatus::Retrying, Some(&e.to_string()))
                    .await
                {
                    error!(event_id, error = %store_err, "failed to record retrying status");
                }
            }
            Ok(Err(e)) => {
                self.inner.metrics.record_event_failed();
                if let Err(store_err) = self
                    .inner
                    .store
                    .update_event_status(event_id, EventStatus::Failed, Some(&e.to_string()))
                    .await
                {
                    error!(event_id, error = %store_err, "failed to record failed status");
                }
            }
            Err(_) => {
                debug!(event_id, "dispatch task timed out, leaving for drain");
                if let Err(store_err) = self
                    .inner
                    .store
                    .update_event_status(event_id, EventStatus::Retrying, Some("dispatch task timed out"))
                    .await
                {
                    error!(event_id, error = %store_err, "failed to record retrying status after timeout");
                }
            }
        }
    }

    /// Periodically re-sends the oldest pending/retrying events, providing
    /// at-least-once delivery across process restarts and exhausted
    /// in-poll retries.
    async fn drain_loop(&self) {
        let mut tick = tokio::time::interval(DRAIN_INTERVAL);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = tick.tick() => {
                    if let Err(e) = self.drain_once().await {
                        error!(error = %e, "pending event drain failed");
                    }
                }
            }
        }
    }

    async fn drain_once(&self) -> Result<()> {
        let pending = self.inner.store.get_pending_events(DRAIN_BATCH).await?;
        for event in pending {
            self.spawn_dispatch(event);
        }
        Ok(())
    }
}
