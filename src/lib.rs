//! Claw -- Autonomous Agent Runtime Core
//!
//! A single-process agent runtime: time-zone-aware schedules, a
//! respond/route decision brain with bounded context and bot-chain
//! suppression, a delimited action grammar over reasoning output,
//! sliding-window rate limits, and a durable human-approval queue
//! gating irreversible external actions.

pub mod types;
pub mod error;
pub mod config;
pub mod storage;
pub mod actions;
pub mod schedule;
pub mod usage;
pub mod approval;
pub mod brain;
pub mod reasoning;
