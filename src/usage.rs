//! Usage Tracking and Rate Limiting
//!
//! Sliding-window call quotas for the reasoning capability: per-minute,
//! per-hour and per-day caps, a minimum inter-call cooldown, and a manual
//! pause flag. Counts are computed from a retained timestamp log pruned to
//! 24 hours on every recorded call.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::AgentError;
use crate::storage;
use crate::types::{UsageLimits, UsageStatus};

const RETENTION_HOURS: i64 = 24;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageState {
    calls: Vec<DateTime<Utc>>,
    total_calls: u64,
}

struct Inner {
    limits: UsageLimits,
    state: UsageState,
}

/// Tracks reasoning-call usage and enforces the configured limits.
/// Single-writer: all mutation happens under the internal lock.
pub struct RateLimiter {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    /// Create a limiter persisting to `<storage_dir>/usage.json`. Existing
    /// state is loaded; a corrupt file degrades to an empty log.
    pub fn open(limits: UsageLimits, storage_dir: &Path) -> Self {
        let path = storage_dir.join("usage.json");
        let state: UsageState = storage::load_json_or_default(&path);
        Self {
            path,
            inner: Mutex::new(Inner { limits, state }),
        }
    }

    /// Check every limit before a call. First violation wins, in order:
    /// pause flag, cooldown, per-minute, per-hour, per-day.
    pub fn check_limits(&self) -> Result<(), AgentError> {
        self.check_limits_at(Utc::now())
    }

    pub fn check_limits_at(&self, now: DateTime<Utc>) -> Result<(), AgentError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let limits = &inner.limits;

        if limits.paused {
            return Err(AgentError::QuotaExceeded(
                "usage is paused by configuration".to_string(),
            ));
        }

        if let Some(last) = inner.state.calls.last() {
            let elapsed = (now - *last).num_seconds();
            let min_interval = limits.min_call_interval_secs as i64;
            if elapsed < min_interval {
                return Err(AgentError::QuotaExceeded(format!(
                    "cooldown: {}s remaining (min interval: {}s)",
                    min_interval - elapsed,
                    min_interval
                )));
            }
        }

        let per_minute = calls_since(&inner.state, now, 60);
        if per_minute >= limits.max_calls_per_minute {
            return Err(AgentError::QuotaExceeded(format!(
                "per-minute limit reached: {}/{}",
                per_minute, limits.max_calls_per_minute
            )));
        }

        let per_hour = calls_since(&inner.state, now, 3600);
        if per_hour >= limits.max_calls_per_hour {
            return Err(AgentError::QuotaExceeded(format!(
                "per-hour limit reached: {}/{}",
                per_hour, limits.max_calls_per_hour
            )));
        }

        let per_day = calls_since(&inner.state, now, 86400);
        if per_day >= limits.max_calls_per_day {
            return Err(AgentError::QuotaExceeded(format!(
                "daily limit reached: {}/{}",
                per_day, limits.max_calls_per_day
            )));
        }

        Ok(())
    }

    /// Record a successful call: prune stale timestamps, append, persist.
    pub fn record_call(&self) {
        self.record_call_at(Utc::now());
    }

    pub fn record_call_at(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now - Duration::hours(RETENTION_HOURS);
        inner.state.calls.retain(|ts| *ts > cutoff);
        inner.state.calls.push(now);
        inner.state.total_calls += 1;
        if let Err(e) = storage::save_json(&self.path, &inner.state) {
            error!("usage save failed: {:#}", e);
        }
    }

    /// A non-blocking warning once daily usage crosses the configured
    /// percentage of the daily cap.
    pub fn get_warning(&self) -> Option<String> {
        self.get_warning_at(Utc::now())
    }

    pub fn get_warning_at(&self, now: DateTime<Utc>) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let per_day = calls_since(&inner.state, now, 86400);
        let threshold =
            inner.limits.max_calls_per_day * inner.limits.warning_threshold_pct / 100;
        if per_day >= threshold {
            Some(format!(
                "usage warning: {}/{} daily calls used ({}%)",
                per_day,
                inner.limits.max_calls_per_day,
                per_day * 100 / inner.limits.max_calls_per_day.max(1)
            ))
        } else {
            None
        }
    }

    /// Current usage counters, for the status command.
    pub fn status(&self) -> UsageStatus {
        let now = Utc::now();
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        UsageStatus {
            calls_this_minute: calls_since(&inner.state, now, 60),
            calls_this_hour: calls_since(&inner.state, now, 3600),
            calls_today: calls_since(&inner.state, now, 86400),
            limits: inner.limits.clone(),
            total_calls_all_time: inner.state.total_calls,
        }
    }

    /// Toggle the manual pause flag.
    pub fn set_paused(&self, paused: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.limits.paused = paused;
    }
}

fn calls_since(state: &UsageState, now: DateTime<Utc>, seconds: i64) -> u32 {
    let cutoff = now - Duration::seconds(seconds);
    state.calls.iter().filter(|ts| **ts > cutoff).count() as u32
}
