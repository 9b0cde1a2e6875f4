//! Schedule Engine
//!
//! Owns the schedule entries for one agent: creation, removal, due-checking
//! against an instant, and at-most-once run stamping. Every mutation
//! rewrites the full entry set to disk atomically; a corrupt or missing
//! store loads as an empty set so startup never fails on bad state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::AgentError;
use crate::storage;
use crate::types::{ScheduleEntry, ScheduleSpec};

use super::parse::parse_schedule;

/// Maximum number of entries one engine will hold.
pub const MAX_ENTRIES: usize = 20;

pub struct ScheduleEngine {
    agent_name: String,
    path: PathBuf,
    entries: BTreeMap<String, ScheduleEntry>,
}

impl ScheduleEngine {
    /// Open the engine for `agent_name`, loading any persisted entries
    /// from `<storage_dir>/schedules_<agent_name>.json`.
    pub fn open(agent_name: &str, storage_dir: &Path) -> Self {
        let path = storage_dir.join(format!("schedules_{agent_name}.json"));
        let loaded: Vec<ScheduleEntry> = storage::load_json_or_default(&path);
        let entries = loaded.into_iter().map(|e| (e.id.clone(), e)).collect();
        Self {
            agent_name: agent_name.to_string(),
            path,
            entries,
        }
    }

    /// Parse `expr`, validate the time zone, create and persist an entry.
    pub fn add(
        &mut self,
        expr: &str,
        prompt: &str,
        channel_id: u64,
        created_by: &str,
        tz: &str,
    ) -> Result<ScheduleEntry, AgentError> {
        if self.entries.len() >= MAX_ENTRIES {
            return Err(AgentError::Validation(format!(
                "schedule limit reached (max {MAX_ENTRIES})"
            )));
        }

        let spec = parse_schedule(expr)?;
        tz.parse::<Tz>()
            .map_err(|_| AgentError::Validation(format!("unknown time zone: {tz:?}")))?;

        let now = Utc::now();
        let fire_at = match spec {
            ScheduleSpec::Once { interval_minutes } => {
                Some(now + Duration::minutes(interval_minutes as i64))
            }
            _ => None,
        };

        let entry = ScheduleEntry {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            spec,
            tz: tz.to_string(),
            prompt: prompt.to_string(),
            channel_id,
            created_by: created_by.to_string(),
            created_at: now,
            last_run: None,
            fire_at,
            enabled: true,
        };

        self.entries.insert(entry.id.clone(), entry.clone());
        self.save();
        Ok(entry)
    }

    /// Remove an entry by id. Returns whether it existed.
    pub fn remove(&mut self, id: &str) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            self.save();
        }
        removed
    }

    /// Remove every entry. Returns the count removed.
    pub fn remove_all(&mut self) -> usize {
        let count = self.entries.len();
        if count > 0 {
            self.entries.clear();
            self.save();
        }
        count
    }

    pub fn list(&self) -> Vec<ScheduleEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries due at `now`. Disabled entries are never due.
    pub fn due_entries(&self, now: DateTime<Utc>) -> Vec<ScheduleEntry> {
        self.entries
            .values()
            .filter(|e| e.enabled && is_due(e, now))
            .cloned()
            .collect()
    }

    /// Stamp an entry's last run. Callers must do this before the
    /// side-effecting work runs, so a slow or failing execution cannot
    /// cause a second fire within the same due window.
    pub fn mark_run(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_run = Some(now);
            self.save();
        }
    }

    fn save(&self) {
        let list: Vec<&ScheduleEntry> = self.entries.values().collect();
        if let Err(e) = storage::save_json(&self.path, &list) {
            error!("[{}] schedule save failed: {:#}", self.agent_name, e);
        }
    }
}

/// Evaluate one entry against a UTC instant, in the entry's own zone.
fn is_due(entry: &ScheduleEntry, now_utc: DateTime<Utc>) -> bool {
    let tz: Tz = match entry.tz.parse() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("schedule {}: bad tz {:?}", entry.id, entry.tz);
            return false;
        }
    };
    let now_local = now_utc.with_timezone(&tz);

    match entry.spec {
        ScheduleSpec::Daily { hour, minute } | ScheduleSpec::Weekday { hour, minute } => {
            if matches!(entry.spec, ScheduleSpec::Weekday { .. })
                && now_local.weekday().num_days_from_monday() >= 5
            {
                return false;
            }

            let scheduled = match NaiveTime::from_hms_opt(hour, minute, 0) {
                Some(t) => t,
                None => return false,
            };
            if now_local.time() < scheduled {
                return false;
            }

            // Must not have already run today (in the entry's zone).
            match entry.last_run {
                Some(last) => last.with_timezone(&tz).date_naive() != now_local.date_naive(),
                None => true,
            }
        }
        ScheduleSpec::Interval { interval_minutes } => match entry.last_run {
            None => true,
            Some(last) => now_utc - last >= Duration::minutes(interval_minutes as i64),
        },
        ScheduleSpec::Once { .. } => {
            if entry.last_run.is_some() {
                return false;
            }
            match entry.fire_at {
                Some(fire_at) => {
                    debug!("schedule {}: once fire_at={}", entry.id, fire_at);
                    now_utc >= fire_at
                }
                None => false,
            }
        }
    }
}

/// Format an entry's schedule for display.
pub fn format_schedule(entry: &ScheduleEntry) -> String {
    match entry.spec {
        ScheduleSpec::Daily { hour, minute } => format!("daily {hour:02}:{minute:02}"),
        ScheduleSpec::Weekday { hour, minute } => format!("weekdays {hour:02}:{minute:02}"),
        ScheduleSpec::Interval { interval_minutes } => {
            if interval_minutes >= 60 && interval_minutes % 60 == 0 {
                format!("every {}h", interval_minutes / 60)
            } else {
                format!("every {interval_minutes}m")
            }
        }
        ScheduleSpec::Once { interval_minutes } => {
            if interval_minutes >= 60 && interval_minutes % 60 == 0 {
                format!("once in {}h", interval_minutes / 60)
            } else {
                format!("once in {interval_minutes}m")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn engine(dir: &tempfile::TempDir) -> ScheduleEngine {
        ScheduleEngine::open("testbot", dir.path())
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_add_rejects_unknown_timezone() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(&dir);
        let err = eng
            .add("daily 09:00", "report", 1, "alice", "Mars/Olympus")
            .unwrap_err();
        assert!(err.to_string().contains("unknown time zone"));
        assert!(eng.is_empty());
    }

    #[test]
    fn test_add_enforces_entry_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(&dir);
        for _ in 0..MAX_ENTRIES {
            eng.add("every 30m", "tick", 1, "alice", "UTC").unwrap();
        }
        let err = eng.add("every 30m", "tick", 1, "alice", "UTC").unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_daily_due_cycle() {
        // The walkthrough: daily 09:00 UTC, evaluated at 09:01 with no
        // prior run -> due; right after mark_run -> not due; next day
        // at 09:01 -> due again.
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(&dir);
        let entry = eng.add("daily 09:00", "report", 1, "alice", "UTC").unwrap();

        let first = utc(2025, 6, 2, 9, 1);
        assert_eq!(eng.due_entries(first).len(), 1);

        eng.mark_run(&entry.id, first);
        assert!(eng.due_entries(first).is_empty());

        let next_day = utc(2025, 6, 3, 9, 1);
        assert_eq!(eng.due_entries(next_day).len(), 1);
    }

    #[test]
    fn test_daily_not_due_before_scheduled_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(&dir);
        eng.add("daily 09:00", "report", 1, "alice", "UTC").unwrap();
        assert!(eng.due_entries(utc(2025, 6, 2, 8, 59)).is_empty());
    }

    #[test]
    fn test_daily_respects_entry_timezone() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(&dir);
        // 09:00 in Seoul is 00:00 UTC.
        eng.add("daily 09:00", "report", 1, "alice", "Asia/Seoul")
            .unwrap();
        assert!(eng.due_entries(utc(2025, 6, 2, 23, 30)).is_empty());
        assert_eq!(eng.due_entries(utc(2025, 6, 3, 0, 30)).len(), 1);
    }

    #[test]
    fn test_weekday_skips_weekends() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(&dir);
        eng.add("weekday 09:00", "standup", 1, "alice", "UTC")
            .unwrap();
        // 2025-06-07 is a Saturday, 2025-06-09 a Monday.
        assert!(eng.due_entries(utc(2025, 6, 7, 9, 1)).is_empty());
        assert!(eng.due_entries(utc(2025, 6, 8, 9, 1)).is_empty());
        assert_eq!(eng.due_entries(utc(2025, 6, 9, 9, 1)).len(), 1);
    }

    #[test]
    fn test_interval_due_on_first_evaluation_then_after_elapse() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(&dir);
        let entry = eng.add("every 30m", "tick", 1, "alice", "UTC").unwrap();

        let t0 = utc(2025, 6, 2, 12, 0);
        assert_eq!(eng.due_entries(t0).len(), 1, "never-run interval is due");

        eng.mark_run(&entry.id, t0);
        assert!(eng.due_entries(utc(2025, 6, 2, 12, 29)).is_empty());
        assert_eq!(eng.due_entries(utc(2025, 6, 2, 12, 30)).len(), 1);
    }

    #[test]
    fn test_once_fires_at_offset_and_never_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(&dir);
        let entry = eng.add("once 30m", "reminder", 1, "alice", "UTC").unwrap();
        let fire_at = entry.fire_at.expect("once entries carry fire_at");

        assert!(eng
            .due_entries(fire_at - Duration::minutes(1))
            .is_empty());
        assert_eq!(eng.due_entries(fire_at).len(), 1);

        eng.mark_run(&entry.id, fire_at);
        assert!(
            eng.due_entries(fire_at + Duration::days(365)).is_empty(),
            "once entries never fire twice"
        );
    }

    #[test]
    fn test_persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut eng = engine(&dir);
            eng.add("daily 07:30", "coffee", 42, "bob", "UTC")
                .unwrap()
                .id
        };
        let eng = engine(&dir);
        let entries = eng.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].channel_id, 42);
        assert_eq!(
            entries[0].spec,
            ScheduleSpec::Daily { hour: 7, minute: 30 }
        );
    }

    #[test]
    fn test_corrupt_store_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("schedules_testbot.json"), "not json").unwrap();
        let eng = engine(&dir);
        assert!(eng.is_empty());
    }

    #[test]
    fn test_remove_and_remove_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(&dir);
        let entry = eng.add("every 1h", "a", 1, "alice", "UTC").unwrap();
        eng.add("every 2h", "b", 1, "alice", "UTC").unwrap();

        assert!(eng.remove(&entry.id));
        assert!(!eng.remove(&entry.id));
        assert_eq!(eng.remove_all(), 1);
        assert!(eng.is_empty());
    }

    #[test]
    fn test_format_schedule_display() {
        let dir = tempfile::tempdir().unwrap();
        let mut eng = engine(&dir);
        let daily = eng.add("daily 09:05", "a", 1, "u", "UTC").unwrap();
        let every = eng.add("every 2h", "b", 1, "u", "UTC").unwrap();
        let once = eng.add("once 45m", "c", 1, "u", "UTC").unwrap();
        assert_eq!(format_schedule(&daily), "daily 09:05");
        assert_eq!(format_schedule(&every), "every 2h");
        assert_eq!(format_schedule(&once), "once in 45m");
    }
}
