// Plugin Execution Guard
//
// Per-plugin-key concurrency limiting with a FIFO wait queue, queue and
// execution timeouts, and a failure-streak circuit breaker. State is
// created lazily per key and garbage-collected once idle.

use chrono::{DateTime, Utc};
use common::GuardConfig;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Snapshot attached to every guard error.
#[derive(Debug, Clone, Serialize)]
pub struct GuardErrorMeta {
    pub queue_wait_ms: u64,
    pub execution_ms: u64,
    pub execution_timeout_ms: u64,
    pub queue_timeout_ms: u64,
    pub max_concurrency: u32,
    pub failure_streak: u32,
    pub cooldown_deadline: Option<DateTime<Utc>>,
    pub cooldown_remaining_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("plugin cooldown active ({}ms remaining)", .meta.cooldown_remaining_ms.unwrap_or(0))]
    CooldownActive { meta: GuardErrorMeta },

    #[error("queue timeout: no execution slot freed within {}ms", .meta.queue_timeout_ms)]
    QueueTimeout { meta: GuardErrorMeta },

    #[error("execution timeout after {}ms", .meta.execution_timeout_ms)]
    ExecutionTimeout { meta: GuardErrorMeta },

    #[error("tool execution failed: {source}")]
    ExecutionFailed {
        #[source]
        source: anyhow::Error,
        meta: GuardErrorMeta,
    },
}

impl GuardError {
    pub fn meta(&self) -> &GuardErrorMeta {
        match self {
            Self::CooldownActive { meta }
            | Self::QueueTimeout { meta }
            | Self::ExecutionTimeout { meta }
            | Self::ExecutionFailed { meta, .. } => meta,
        }
    }

    /// Stable machine-readable code for structured tool results.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CooldownActive { .. } => "plugin_cooldown_active",
            Self::QueueTimeout { .. } => "plugin_queue_timeout",
            Self::ExecutionTimeout { .. } => "plugin_execution_timeout",
            Self::ExecutionFailed { .. } => "plugin_execution_failed",
        }
    }
}

struct Waiter {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<(), GuardError>>,
}

#[derive(Default)]
struct PluginExecutionState {
    running: u32,
    queue: VecDeque<Waiter>,
    failure_streak: u32,
    cooldown_until: Option<Instant>,
}

impl PluginExecutionState {
    fn cooldown_active(&self, now: Instant) -> bool {
        self.cooldown_until.map(|t| t > now).unwrap_or(false)
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|t| *t > now)
            .map(|t| t - now)
    }

    /// Count one failure against the streak. An already-armed cooldown is
    /// never extended; otherwise reaching the threshold arms it.
    fn note_counted_failure(&mut self, now: Instant, config: &GuardConfig) {
        self.failure_streak += 1;
        if self.failure_streak >= config.failure_threshold && !self.cooldown_active(now) {
            self.cooldown_until =
                Some(now + Duration::from_millis(config.failure_cooldown_ms));
            warn!(
                streak = self.failure_streak,
                "circuit opened for {}ms", config.failure_cooldown_ms
            );
        }
    }

    fn idle(&self, now: Instant) -> bool {
        self.running == 0
            && self.queue.is_empty()
            && self.failure_streak == 0
            && !self.cooldown_active(now)
    }
}

/// Point-in-time view of one plugin key's guard state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardStats {
    pub running: u32,
    pub queued: usize,
    pub failure_streak: u32,
    pub cooldown_active: bool,
}

enum ExecOutcome {
    Success,
    CountedFailure,
    /// Release without touching the streak (caller future dropped).
    Abandoned,
}

/// A held concurrency slot. Released exactly once: either explicitly via
/// `finish`, or by the drop backstop when the owning future is cancelled.
struct Lease<'g> {
    guard: &'g ExecutionGuard,
    key: String,
    queue_wait: Duration,
    released: bool,
}

impl<'g> Lease<'g> {
    fn finish(mut self, outcome: ExecOutcome, execution: Duration) -> GuardErrorMeta {
        self.released = true;
        self.guard
            .complete(&self.key, outcome, self.queue_wait, execution)
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.guard
                .complete(&self.key, ExecOutcome::Abandoned, self.queue_wait, Duration::ZERO);
        }
    }
}

/// Concurrency/circuit-breaker primitive keyed by installed-plugin
/// identity. One instance per process, shared by handle.
pub struct ExecutionGuard {
    config: GuardConfig,
    states: Mutex<HashMap<String, PluginExecutionState>>,
    next_waiter_id: AtomicU64,
}

impl ExecutionGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            next_waiter_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Run `execute` under this plugin's concurrency limit, queue
    /// timeout, execution timeout and circuit breaker.
    pub async fn run<T, F, Fut>(&self, plugin_key: &str, execute: F) -> Result<T, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let lease = self.acquire(plugin_key).await?;
        let execution_timeout = Duration::from_millis(self.config.execution_timeout_ms);
        let started = Instant::now();

        // The timeout cannot interrupt work already running inside the
        // future; on expiry the future is dropped and any side effects it
        // later produces are discarded.
        match tokio::time::timeout(execution_timeout, execute()).await {
            Ok(Ok(value)) => {
                lease.finish(ExecOutcome::Success, started.elapsed());
                Ok(value)
            }
            Ok(Err(source)) => {
                let meta = lease.finish(ExecOutcome::CountedFailure, started.elapsed());
                Err(GuardError::ExecutionFailed { source, meta })
            }
            Err(_) => {
                let meta = lease.finish(ExecOutcome::CountedFailure, started.elapsed());
                Err(GuardError::ExecutionTimeout { meta })
            }
        }
    }

    /// Current stats for a key; `None` once the key's state was GC'd.
    pub fn stats(&self, plugin_key: &str) -> Option<GuardStats> {
        let states = self.lock_states();
        let now = Instant::now();
        states.get(plugin_key).map(|state| GuardStats {
            running: state.running,
            queued: state.queue.len(),
            failure_streak: state.failure_streak,
            cooldown_active: state.cooldown_active(now),
        })
    }

    async fn acquire(&self, key: &str) -> Result<Lease<'_>, GuardError> {
        let (mut rx, waiter_id, enqueued_at) = {
            let mut states = self.lock_states();
            let state = states.entry(key.to_string()).or_default();
            let now = Instant::now();

            if state.cooldown_active(now) {
                // Rejected before queuing; counts against the streak but
                // never extends the active cooldown.
                state.note_counted_failure(now, &self.config);
                let meta = self.snapshot(state, Duration::ZERO, Duration::ZERO, now);
                return Err(GuardError::CooldownActive { meta });
            }
            if state.running < self.config.max_concurrency_per_plugin {
                state.running += 1;
                return Ok(Lease {
                    guard: self,
                    key: key.to_string(),
                    queue_wait: Duration::ZERO,
                    released: false,
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            state.queue.push_back(Waiter {
                id,
                enqueued_at: now,
                tx,
            });
            debug!(key, queued = state.queue.len(), "queued for execution slot");
            (rx, id, now)
        };

        let queue_timeout = Duration::from_millis(self.config.queue_timeout_ms);
        match tokio::time::timeout(queue_timeout, &mut rx).await {
            Ok(Ok(Ok(()))) => Ok(Lease {
                guard: self,
                key: key.to_string(),
                queue_wait: enqueued_at.elapsed(),
                released: false,
            }),
            Ok(Ok(Err(rejection))) => Err(rejection),
            Ok(Err(_closed)) => {
                // The sender only disappears if guard state was torn down
                // underneath us; report as a queue timeout.
                Err(GuardError::QueueTimeout {
                    meta: self.snapshot_for_key(key, enqueued_at.elapsed(), Duration::ZERO),
                })
            }
            Err(_elapsed) => self.handle_queue_timeout(key, waiter_id, enqueued_at, rx),
        }
    }

    /// The timer fired. Either we are still queued (remove ourselves and
    /// fail) or a slot was granted concurrently with the expiry (use it).
    fn handle_queue_timeout(
        &self,
        key: &str,
        waiter_id: u64,
        enqueued_at: Instant,
        mut rx: oneshot::Receiver<Result<(), GuardError>>,
    ) -> Result<Lease<'_>, GuardError> {
        {
            let mut states = self.lock_states();
            if let Some(state) = states.get_mut(key) {
                if let Some(pos) = state.queue.iter().position(|w| w.id == waiter_id) {
                    state.queue.remove(pos);
                    let now = Instant::now();
                    // A pure queue timeout does not count against the streak.
                    let meta = self.snapshot(state, enqueued_at.elapsed(), Duration::ZERO, now);
                    return Err(GuardError::QueueTimeout { meta });
                }
            }
        }
        match rx.try_recv() {
            Ok(Ok(())) => Ok(Lease {
                guard: self,
                key: key.to_string(),
                queue_wait: enqueued_at.elapsed(),
                released: false,
            }),
            Ok(Err(rejection)) => Err(rejection),
            Err(_) => Err(GuardError::QueueTimeout {
                meta: self.snapshot_for_key(key, enqueued_at.elapsed(), Duration::ZERO),
            }),
        }
    }

    /// Release one slot, record the outcome, serve waiters FIFO and GC
    /// the state once idle. Runs exactly once per lease.
    fn complete(
        &self,
        key: &str,
        outcome: ExecOutcome,
        queue_wait: Duration,
        execution: Duration,
    ) -> GuardErrorMeta {
        let mut states = self.lock_states();
        let now = Instant::now();
        let Some(state) = states.get_mut(key) else {
            return self.empty_snapshot(queue_wait, execution);
        };

        match outcome {
            ExecOutcome::Success => {
                state.failure_streak = 0;
                state.cooldown_until = None;
            }
            ExecOutcome::CountedFailure => state.note_counted_failure(now, &self.config),
            ExecOutcome::Abandoned => {}
        }
        state.running = state.running.saturating_sub(1);
        let meta = self.snapshot(state, queue_wait, execution, now);

        self.drain_locked(state, now);
        if state.idle(now) {
            states.remove(key);
        }
        meta
    }

    /// Serve queued waiters while capacity allows, rechecking cooldown
    /// before each: a cooldown that began while a request was queued
    /// rejects it at the moment it would otherwise be served.
    fn drain_locked(&self, state: &mut PluginExecutionState, now: Instant) {
        while state.running < self.config.max_concurrency_per_plugin {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            if state.cooldown_active(now) {
                let wait = now.saturating_duration_since(waiter.enqueued_at);
                let meta = self.snapshot(state, wait, Duration::ZERO, now);
                let _ = waiter.tx.send(Err(GuardError::CooldownActive { meta }));
                continue;
            }
            state.running += 1;
            if waiter.tx.send(Ok(())).is_err() {
                // Receiver already timed out and left; take the slot back.
                state.running -= 1;
            }
        }
    }

    fn snapshot(
        &self,
        state: &PluginExecutionState,
        queue_wait: Duration,
        execution: Duration,
        now: Instant,
    ) -> GuardErrorMeta {
        let remaining = state.cooldown_remaining(now);
        GuardErrorMeta {
            queue_wait_ms: queue_wait.as_millis() as u64,
            execution_ms: execution.as_millis() as u64,
            execution_timeout_ms: self.config.execution_timeout_ms,
            queue_timeout_ms: self.config.queue_timeout_ms,
            max_concurrency: self.config.max_concurrency_per_plugin,
            failure_streak: state.failure_streak,
            cooldown_deadline: remaining.map(|r| {
                Utc::now() + chrono::Duration::from_std(r).unwrap_or_else(|_| chrono::Duration::zero())
            }),
            cooldown_remaining_ms: remaining.map(|r| r.as_millis() as u64),
        }
    }

    fn snapshot_for_key(&self, key: &str, queue_wait: Duration, execution: Duration) -> GuardErrorMeta {
        let states = self.lock_states();
        let now = Instant::now();
        match states.get(key) {
            Some(state) => self.snapshot(state, queue_wait, execution, now),
            None => self.empty_snapshot(queue_wait, execution),
        }
    }

    fn empty_snapshot(&self, queue_wait: Duration, execution: Duration) -> GuardErrorMeta {
        GuardErrorMeta {
            queue_wait_ms: queue_wait.as_millis() as u64,
            execution_ms: execution.as_millis() as u64,
            execution_timeout_ms: self.config.execution_timeout_ms,
            queue_timeout_ms: self.config.queue_timeout_ms,
            max_concurrency: self.config.max_concurrency_per_plugin,
            failure_streak: 0,
            cooldown_deadline: None,
            cooldown_remaining_ms: None,
        }
    }

    fn lock_states(&self) -> MutexGuard<'_, HashMap<String, PluginExecutionState>> {
        // Recover from poisoning; guard state stays consistent because
        // every mutation is a single locked block.
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
