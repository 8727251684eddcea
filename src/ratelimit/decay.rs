//! Background decay of per-key counters.
//!
//! Once per refill interval every positive count is lowered by one. The
//! loop runs as a single tokio task per running epoch and exits when its
//! stop channel fires (or its sender is dropped), when the parent shutdown
//! signal resolves, or when the tick stream ends.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::{Stream, StreamExt};

use super::counter::{CounterStore, Decay};
use crate::logging::Logger;

/// Parent cancellation scope handed to the decay task.
pub type ShutdownSignal = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Why the decay loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayExit {
    /// The limiter was stopped or dropped.
    Stopped,
    /// The parent shutdown signal resolved.
    ParentShutdown,
    /// The tick stream ended on its own.
    TickerClosed,
}

impl fmt::Display for DecayExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecayExit::Stopped => "stopped",
            DecayExit::ParentShutdown => "parent shutdown",
            DecayExit::TickerClosed => "ticker closed",
        })
    }
}

/// Totals for a single decay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecayStats {
    /// Entries lowered by one
    pub decreased: usize,
    /// Entries skipped because they were already zero
    pub already_zero: usize,
}

/// Longest decay period honoured as-is, roughly thirty years.
pub(crate) const MAX_PERIOD: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Tick stream firing every `period`, starting one period from now.
///
/// Missed ticks are delivered in a burst so each elapsed period frees
/// exactly one slot.
///
/// Periods beyond [`MAX_PERIOD`] are capped so deadline arithmetic cannot
/// overflow; such a loop simply never ticks in practice.
pub(crate) fn ticks(period: Duration) -> IntervalStream {
    let period = period.min(MAX_PERIOD);
    let now = Instant::now();
    let start = now
        .checked_add(period)
        .or_else(|| now.checked_add(MAX_PERIOD / 2))
        .unwrap_or(now);
    let mut interval = interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
    IntervalStream::new(interval)
}

/// The decay routine for one store.
pub(crate) struct DecayLoop<S: CounterStore> {
    store: Arc<S>,
    logger: Arc<dyn Logger>,
}

impl<S: CounterStore> DecayLoop<S> {
    pub(crate) fn new(store: Arc<S>, logger: &dyn Logger) -> Self {
        Self {
            store,
            logger: logger.with(&[("routine", &"decay")]),
        }
    }

    /// Run one decay pass over every known key.
    pub(crate) fn tick(&self) -> DecayStats {
        let mut stats = DecayStats::default();
        let logger = &self.logger;

        self.store.decay(&mut |key, outcome| match outcome {
            Decay::Decreased(count) => {
                stats.decreased += 1;
                logger.debug(
                    "number of requests decreased",
                    &[("key", &key), ("count", &count)],
                );
            }
            Decay::AlreadyZero => {
                stats.already_zero += 1;
                logger.debug("number of requests is zero", &[("key", &key)]);
            }
        });

        stats
    }

    /// Drive decay passes from `ticks` until stopped.
    ///
    /// The tick stream is owned by this future and released on every exit
    /// path.
    pub(crate) async fn run<T>(
        self,
        mut ticks: T,
        mut stop: oneshot::Receiver<()>,
        mut parent: ShutdownSignal,
    ) -> DecayExit
    where
        T: Stream + Unpin,
    {
        self.logger.info("routine started", &[]);

        let exit = loop {
            tokio::select! {
                biased;

                // A dropped sender means the limiter itself went away.
                _ = &mut stop => break DecayExit::Stopped,
                _ = &mut parent => break DecayExit::ParentShutdown,
                tick = ticks.next() => {
                    if tick.is_none() {
                        self.logger.error("ticker refill routine was closed unexpectedly", &[]);
                        break DecayExit::TickerClosed;
                    }
                    self.tick();
                }
            }
        };

        drop(ticks);
        self.logger.info("decay routine stopped", &[("reason", &exit)]);
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::capture::{CaptureLogger, Level};
    use crate::logging::Fields;
    use crate::ratelimit::counter::ShardedCounterStore;

    fn loaded_store() -> Arc<ShardedCounterStore> {
        let store = Arc::new(ShardedCounterStore::new());
        for _ in 0..3 {
            store.try_increment("busy", 10);
        }
        store.try_increment("quiet", 10);
        store
    }

    fn never() -> ShutdownSignal {
        Box::pin(std::future::pending())
    }

    #[test]
    fn test_tick_reports_stats() {
        let store = loaded_store();
        let logger = CaptureLogger::new();
        let decay = DecayLoop::new(Arc::clone(&store), &logger);

        assert_eq!(
            decay.tick(),
            DecayStats {
                decreased: 2,
                already_zero: 0
            }
        );
        assert_eq!(
            decay.tick(),
            DecayStats {
                decreased: 1,
                already_zero: 1
            }
        );
        assert_eq!(store.get("busy"), 1);
        assert_eq!(store.get("quiet"), 0);
        assert_eq!(logger.count(Level::Debug, "number of requests is zero"), 1);
    }

    /// Logger whose debug lines are expensive to write.
    struct SlowLogger;

    impl Logger for SlowLogger {
        fn with(&self, _fields: Fields<'_>) -> Arc<dyn Logger> {
            Arc::new(SlowLogger)
        }

        fn debug(&self, _msg: &str, _fields: Fields<'_>) {
            std::thread::sleep(Duration::from_millis(5));
        }

        fn info(&self, _msg: &str, _fields: Fields<'_>) {}

        fn error(&self, _msg: &str, _fields: Fields<'_>) {}
    }

    #[test]
    fn test_slow_logging_during_tick_leaves_admission_free() {
        let store = Arc::new(ShardedCounterStore::new());
        for i in 0..200 {
            store.try_increment(&format!("key{i}"), 10);
        }
        let decay = DecayLoop::new(Arc::clone(&store), &SlowLogger);

        let worst = std::thread::scope(|scope| {
            let pass = scope.spawn(|| decay.tick());

            std::thread::sleep(Duration::from_millis(50));
            let worst = (0..50)
                .map(|i| {
                    let started = std::time::Instant::now();
                    assert!(store.try_increment(&format!("new{i}"), 10).admitted);
                    started.elapsed()
                })
                .max()
                .unwrap();

            assert_eq!(pass.join().unwrap().decreased, 200);
            worst
        });

        assert!(worst < Duration::from_millis(100), "admission took {worst:?}");
    }

    #[tokio::test]
    async fn test_closed_ticker_ends_loop_cleanly() {
        let store = loaded_store();
        let logger = CaptureLogger::new();
        let decay = DecayLoop::new(Arc::clone(&store), &logger);
        let (_stop_tx, stop_rx) = oneshot::channel();

        let exit = decay
            .run(tokio_stream::iter(vec![(), ()]), stop_rx, never())
            .await;

        assert_eq!(exit, DecayExit::TickerClosed);
        assert_eq!(store.get("busy"), 1);
        assert_eq!(store.get("quiet"), 0);
        assert_eq!(
            logger.count(Level::Error, "ticker refill routine was closed unexpectedly"),
            1
        );
        assert_eq!(logger.count(Level::Info, "decay routine stopped"), 1);
    }

    #[tokio::test]
    async fn test_stop_signal_ends_loop() {
        let store = loaded_store();
        let logger = CaptureLogger::new();
        let decay = DecayLoop::new(Arc::clone(&store), &logger);
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(decay.run(ticks(Duration::from_secs(60)), stop_rx, never()));
        stop_tx.send(()).unwrap();

        assert_eq!(task.await.unwrap(), DecayExit::Stopped);
        assert_eq!(store.get("busy"), 3);
    }

    #[tokio::test]
    async fn test_dropped_sender_ends_loop() {
        let store = loaded_store();
        let logger = CaptureLogger::new();
        let decay = DecayLoop::new(store, &logger);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(decay.run(ticks(Duration::from_secs(60)), stop_rx, never()));
        drop(stop_tx);

        assert_eq!(task.await.unwrap(), DecayExit::Stopped);
    }

    #[tokio::test]
    async fn test_parent_shutdown_ends_loop() {
        let store = loaded_store();
        let logger = CaptureLogger::new();
        let decay = DecayLoop::new(store, &logger);
        let (_stop_tx, stop_rx) = oneshot::channel();
        let (parent_tx, parent_rx) = oneshot::channel::<()>();
        let parent: ShutdownSignal = Box::pin(async move {
            let _ = parent_rx.await;
        });

        let task = tokio::spawn(decay.run(ticks(Duration::from_secs(60)), stop_rx, parent));
        parent_tx.send(()).unwrap();

        assert_eq!(task.await.unwrap(), DecayExit::ParentShutdown);
    }

    #[tokio::test]
    async fn test_longest_period_never_ticks() {
        let mut ticks = ticks(Duration::MAX);

        let first = tokio::time::timeout(Duration::from_millis(50), ticks.next()).await;
        assert!(first.is_err());
    }

    #[tokio::test]
    async fn test_ticks_decay_over_time() {
        let store = loaded_store();
        let logger = CaptureLogger::new();
        let decay = DecayLoop::new(Arc::clone(&store), &logger);
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(decay.run(ticks(Duration::from_millis(50)), stop_rx, never()));

        // No tick fires before the first full period
        assert_eq!(store.get("busy"), 3);

        tokio::time::sleep(Duration::from_millis(400)).await;
        stop_tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(store.get("busy"), 0);
        assert_eq!(store.get("quiet"), 0);
    }
}
