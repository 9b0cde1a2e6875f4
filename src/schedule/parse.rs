//! Schedule Expression Parsing
//!
//! Turns human-authored schedule strings into typed `ScheduleSpec` values.
//! Supported forms (case-insensitive): `daily HH:MM`, `weekday HH:MM`,
//! `every Nh`, `every Nm`, `once Nh`, `once Nm`. Anything else fails with
//! an error naming the supported forms; durations below the minimum are
//! rejected rather than clamped.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::AgentError;
use crate::types::ScheduleSpec;

/// Minimum interval/once duration, to prevent quota exhaustion.
pub const MIN_INTERVAL_MINUTES: u32 = 10;

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(daily|weekday)\s+(\d{1,2}):(\d{2})$").expect("time regex is valid")
    })
}

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(every|once)\s+(\d+)(h|m)$").expect("duration regex is valid")
    })
}

/// Parse a schedule expression into its canonical typed form.
pub fn parse_schedule(expr: &str) -> Result<ScheduleSpec, AgentError> {
    let s = expr.trim();

    if let Some(cap) = time_re().captures(s) {
        let hour: u32 = cap[2]
            .parse()
            .map_err(|_| AgentError::Validation(format!("invalid time in schedule: {s}")))?;
        let minute: u32 = cap[3]
            .parse()
            .map_err(|_| AgentError::Validation(format!("invalid time in schedule: {s}")))?;
        if hour > 23 || minute > 59 {
            return Err(AgentError::Validation(format!(
                "invalid time in schedule: {s}"
            )));
        }
        return Ok(if cap[1].eq_ignore_ascii_case("daily") {
            ScheduleSpec::Daily { hour, minute }
        } else {
            ScheduleSpec::Weekday { hour, minute }
        });
    }

    if let Some(cap) = duration_re().captures(s) {
        let amount: u32 = cap[2]
            .parse()
            .map_err(|_| AgentError::Validation(format!("invalid duration in schedule: {s}")))?;
        let minutes = if cap[3].eq_ignore_ascii_case("h") {
            amount.saturating_mul(60)
        } else {
            amount
        };
        if minutes < MIN_INTERVAL_MINUTES {
            return Err(AgentError::Validation(format!(
                "minimum interval is {MIN_INTERVAL_MINUTES} minutes (requested: {minutes})"
            )));
        }
        return Ok(if cap[1].eq_ignore_ascii_case("every") {
            ScheduleSpec::Interval {
                interval_minutes: minutes,
            }
        } else {
            ScheduleSpec::Once {
                interval_minutes: minutes,
            }
        });
    }

    Err(AgentError::Validation(format!(
        "unsupported schedule format: {s:?}. supported: daily HH:MM, weekday HH:MM, \
         every Nh, every Nm, once Nh, once Nm"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daily() {
        assert_eq!(
            parse_schedule("daily 09:00").unwrap(),
            ScheduleSpec::Daily { hour: 9, minute: 0 }
        );
        assert_eq!(
            parse_schedule("DAILY 23:59").unwrap(),
            ScheduleSpec::Daily {
                hour: 23,
                minute: 59
            }
        );
    }

    #[test]
    fn test_parse_weekday() {
        assert_eq!(
            parse_schedule("weekday 8:30").unwrap(),
            ScheduleSpec::Weekday { hour: 8, minute: 30 }
        );
    }

    #[test]
    fn test_parse_intervals() {
        assert_eq!(
            parse_schedule("every 2h").unwrap(),
            ScheduleSpec::Interval {
                interval_minutes: 120
            }
        );
        assert_eq!(
            parse_schedule("every 45m").unwrap(),
            ScheduleSpec::Interval {
                interval_minutes: 45
            }
        );
        assert_eq!(
            parse_schedule("once 1h").unwrap(),
            ScheduleSpec::Once {
                interval_minutes: 60
            }
        );
        assert_eq!(
            parse_schedule("once 30m").unwrap(),
            ScheduleSpec::Once {
                interval_minutes: 30
            }
        );
    }

    #[test]
    fn test_out_of_range_time_rejected() {
        assert!(parse_schedule("daily 24:00").is_err());
        assert!(parse_schedule("daily 09:60").is_err());
    }

    #[test]
    fn test_below_minimum_duration_rejected() {
        let err = parse_schedule("every 5m").unwrap_err();
        assert!(err.to_string().contains("minimum interval"));
        assert!(parse_schedule("once 9m").is_err());
        // Exactly at the threshold is fine.
        assert!(parse_schedule("every 10m").is_ok());
    }

    #[test]
    fn test_unsupported_form_names_supported_grammar() {
        let err = parse_schedule("monthly 09:00").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unsupported schedule format"));
        assert!(msg.contains("daily HH:MM"));
        assert!(parse_schedule("").is_err());
        assert!(parse_schedule("every 2d").is_err());
    }
}
