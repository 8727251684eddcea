//! Core admission limiter implementation.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::counter::{CounterStore, ShardedCounterStore};
use super::decay::{self, DecayExit, DecayLoop};
use super::options::{LimiterOption, Settings};
use super::token::{self, Token};
use crate::config::LimiterConfig;
use crate::error::{LimiterError, Result};
use crate::logging::Logger;

/// Observable lifecycle of a [`Limiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, never started
    Idle,
    /// Decay task active, admissions evaluated
    Running,
    /// Decay task ended; admissions fail until restarted
    Stopped,
}

/// Handle to one running decay task.
struct Epoch {
    stop: oneshot::Sender<()>,
    task: JoinHandle<DecayExit>,
}

/// Clears the published epoch when its decay task ends.
///
/// Only its own epoch is cleared; a later start may already own the slot.
struct EpochGuard {
    active_epoch: Arc<AtomicU64>,
    epoch_id: u64,
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        let _ = self.active_epoch.compare_exchange(
            self.epoch_id,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

enum Lifecycle {
    Idle,
    Running(Epoch),
    Stopped,
}

/// Per-key admission limiter with background decay.
///
/// Each key may hold at most `capacity` admissions; a background task
/// lowers every key's count by one per `refill_interval`. Admission is
/// synchronous and never waits on the decay task.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct Limiter<S: CounterStore = ShardedCounterStore> {
    /// Per-key counts, shared with the decay task
    store: Arc<S>,
    /// Admissions allowed per key before denial
    capacity: u64,
    /// Decay cadence
    refill_interval: Duration,
    /// Diagnostic sink scoped to this limiter
    logger: Arc<dyn Logger>,
    /// Id of the running epoch, 0 when admissions are refused
    active_epoch: Arc<AtomicU64>,
    /// Last epoch id handed out
    epochs: AtomicU64,
    /// Owner of the current decay task, if any
    lifecycle: Mutex<Lifecycle>,
}

impl Limiter<ShardedCounterStore> {
    /// Create a limiter backed by a [`ShardedCounterStore`].
    ///
    /// Options are applied in order on top of the defaults (capacity 10,
    /// refill interval 1s, `tracing` logger); the first invalid option is
    /// returned as the error.
    pub fn new<I>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = LimiterOption>,
    {
        Self::with_store(ShardedCounterStore::new(), options)
    }

    /// Create a limiter from loaded configuration.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        Self::new(config.options())
    }
}

impl<S: CounterStore> Limiter<S> {
    /// Create a limiter on top of a caller-supplied store.
    pub fn with_store<I>(store: S, options: I) -> Result<Self>
    where
        I: IntoIterator<Item = LimiterOption>,
    {
        let settings = Settings::resolve(options)?;

        Ok(Self {
            store: Arc::new(store),
            capacity: settings.capacity,
            refill_interval: settings.refill_interval,
            logger: settings.logger.with(&[("service", &"limiter")]),
            active_epoch: Arc::new(AtomicU64::new(0)),
            epochs: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Start the decay routine with no parent shutdown signal.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.start_with_shutdown(std::future::pending());
    }

    /// Start the decay routine; it also ends when `shutdown` resolves.
    ///
    /// Starting a running limiter is logged and ignored. A stopped limiter
    /// may be started again, which begins a fresh decay task.
    pub fn start_with_shutdown<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut lifecycle = self.lifecycle.lock();

        if let Lifecycle::Running(epoch) = &*lifecycle {
            if !epoch.task.is_finished() {
                self.logger.error("service was already started", &[]);
                return;
            }
            self.logger
                .debug("previous decay routine already ended, restarting", &[]);
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                self.logger
                    .error("no tokio runtime to run the decay routine on", &[("error", &err)]);
                return;
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let routine = DecayLoop::new(Arc::clone(&self.store), self.logger.as_ref());
        let period = self.refill_interval;
        let epoch_id = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;

        // Published before spawning so an immediately finishing task can
        // retract it.
        self.active_epoch.store(epoch_id, Ordering::Release);
        let retract = EpochGuard {
            active_epoch: Arc::clone(&self.active_epoch),
            epoch_id,
        };

        let task = runtime.spawn(async move {
            // Dropped with the task however it ends, panics included.
            let _retract = retract;
            routine
                .run(decay::ticks(period), stop_rx, Box::pin(shutdown))
                .await
        });

        *lifecycle = Lifecycle::Running(Epoch {
            stop: stop_tx,
            task,
        });

        self.logger.debug(
            "service was started",
            &[
                ("epoch", &epoch_id),
                ("capacity", &self.capacity),
                ("refill_interval_ms", &period.as_millis()),
            ],
        );
    }

    /// Stop the decay routine and wait for it to exit.
    ///
    /// Once this returns the decay task no longer touches the store.
    /// Stopping a limiter that is not running is logged and ignored.
    pub async fn stop(&self) {
        let epoch = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(epoch) => {
                    self.active_epoch.store(0, Ordering::Release);
                    epoch
                }
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Idle;
                    self.logger.error("service was not started", &[]);
                    return;
                }
                Lifecycle::Stopped => {
                    self.logger.error("service was already stopped", &[]);
                    return;
                }
            }
        };

        // The routine may already have exited on parent shutdown.
        let _ = epoch.stop.send(());

        match epoch.task.await {
            Ok(exit) => {
                self.logger.debug("service was stopped", &[("reason", &exit)]);
            }
            Err(err) => {
                self.logger
                    .error("decay routine terminated abnormally", &[("error", &err)]);
            }
        }
    }

    /// Request an admission token for `key`.
    ///
    /// Fails with [`LimiterError::NotStarted`] unless running, and with
    /// [`LimiterError::TooManyRequests`] once `key` holds `capacity`
    /// admissions; the caller should back off until the next decay tick.
    pub fn request_token(&self, key: &str) -> Result<Token> {
        if !self.is_running() {
            return Err(LimiterError::NotStarted);
        }

        self.logger
            .debug("trying to get token for object", &[("key", &key)]);

        let admission = self.store.try_increment(key, self.capacity);
        if !admission.admitted {
            self.logger.debug(
                "too many requests for object",
                &[("key", &key), ("count", &admission.count)],
            );
            return Err(LimiterError::TooManyRequests {
                key: key.to_string(),
            });
        }

        let token = token::issue_now(key);
        self.logger.debug(
            "token generated for object",
            &[
                ("key", &key),
                ("count", &admission.count),
                ("token", &token.short()),
            ],
        );

        Ok(token)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        match &*self.lifecycle.lock() {
            Lifecycle::Idle => LifecycleState::Idle,
            Lifecycle::Running(_) if self.is_running() => LifecycleState::Running,
            Lifecycle::Running(_) | Lifecycle::Stopped => LifecycleState::Stopped,
        }
    }

    /// Whether admissions are currently evaluated.
    pub fn is_running(&self) -> bool {
        self.active_epoch.load(Ordering::Acquire) != 0
    }

    /// Admissions allowed per key before denial.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Decay cadence.
    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Current count for `key`.
    pub fn count(&self, key: &str) -> u64 {
        self.store.get(key)
    }

    /// Admissions `key` may still make before the next decay tick.
    pub fn remaining(&self, key: &str) -> u64 {
        self.capacity.saturating_sub(self.store.get(key))
    }

    /// Number of distinct keys seen so far.
    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }
}

impl<S: CounterStore> fmt::Debug for Limiter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("capacity", &self.capacity)
            .field("refill_interval", &self.refill_interval)
            .field("state", &self.state())
            .field("tracked_keys", &self.store.len())
            .finish()
    }
}
