//! Schedule Engine
//!
//! Time-zone-aware recurring/one-off schedules with at-most-once firing
//! per due period. Parsing lives in `parse`, entry ownership and
//! due-checking in `engine`.

pub mod engine;
pub mod parse;

pub use engine::{format_schedule, ScheduleEngine, MAX_ENTRIES};
pub use parse::{parse_schedule, MIN_INTERVAL_MINUTES};
