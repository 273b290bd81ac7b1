//! Per-session game-state containers.
//!
//! Counters, limits and generators all follow the same shape: a
//! process-global manager holds immutable config definitions keyed by
//! id, a per-session container holds live instances, and every
//! mutation marks both the instance and its container dirty so the
//! session save path knows what to persist.

pub mod counters;
pub mod generators;
pub mod limits;

pub use counters::{Counter, CounterConfig, CounterContainer, CounterManager};
pub use generators::{Generator, GeneratorConfig, GeneratorContainer, GeneratorManager};
pub use limits::{Limit, LimitConfig, LimitContainer, LimitManager, LimitType};

/// Entity identifier within a manager.
pub type Id = String;

/// Unix timestamp in seconds; `0` means unset.
pub type Timestamp = i64;

/// A timestamp that never arrives.
pub const ETERNITY: Timestamp = i64::MAX;

/// Current wall-clock time as a unix timestamp.
pub fn now_ts() -> Timestamp {
    chrono::Local::now().timestamp()
}
