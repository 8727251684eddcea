//! Constructor options for [`Limiter`](super::Limiter).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LimiterError, Result};
use crate::logging::{Logger, TracingLogger};

/// Default number of requests a key may make before denial.
pub const DEFAULT_CAPACITY: u64 = 10;
/// Default cadence at which every count is lowered by one.
pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_secs(1);

/// A single constructor option, applied in the order given.
#[derive(Clone)]
pub enum LimiterOption {
    /// Requests allowed per key before denial; must be at least 1.
    Capacity(u64),
    /// Decay cadence; must be non-zero.
    RefillInterval(Duration),
    /// Diagnostic sink replacing the default `tracing` logger.
    Logger(Arc<dyn Logger>),
}

impl fmt::Debug for LimiterOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterOption::Capacity(capacity) => f.debug_tuple("Capacity").field(capacity).finish(),
            LimiterOption::RefillInterval(interval) => {
                f.debug_tuple("RefillInterval").field(interval).finish()
            }
            LimiterOption::Logger(_) => f.write_str("Logger(..)"),
        }
    }
}

/// Resolved settings after all options were applied.
#[derive(Clone)]
pub(crate) struct Settings {
    pub capacity: u64,
    pub refill_interval: Duration,
    pub logger: Arc<dyn Logger>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_interval: DEFAULT_REFILL_INTERVAL,
            logger: Arc::new(TracingLogger::new()),
        }
    }
}

impl Settings {
    /// Apply `options` on top of the defaults, stopping at the first
    /// invalid one.
    pub(crate) fn resolve<I>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = LimiterOption>,
    {
        let mut settings = Settings::default();

        for option in options {
            settings.apply(option)?;
        }

        Ok(settings)
    }

    fn apply(&mut self, option: LimiterOption) -> Result<()> {
        match option {
            LimiterOption::Capacity(capacity) => {
                if capacity < 1 {
                    return Err(LimiterError::CapacityTooSmall);
                }
                self.capacity = capacity;
            }
            LimiterOption::RefillInterval(interval) => {
                if interval.is_zero() {
                    return Err(LimiterError::RefillIntervalTooSmall);
                }
                self.refill_interval = interval;
            }
            LimiterOption::Logger(logger) => self.logger = logger,
        }
        Ok(())
    }
}
