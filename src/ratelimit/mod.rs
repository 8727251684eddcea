//! Admission control logic and counter state management.

mod counter;
mod decay;
mod limiter;
mod options;
mod token;

pub use counter::{Admission, CounterStore, Decay, ShardedCounterStore};
pub use limiter::{LifecycleState, Limiter};
pub use options::{LimiterOption, DEFAULT_CAPACITY, DEFAULT_REFILL_INTERVAL};
pub use token::{issue, issue_now, ShortToken, Token};
