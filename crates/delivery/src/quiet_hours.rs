//! Quiet hours: suppresses journey sends during a configured time-of-day window.
//!
//! The window is configured in the journey's local time and converted to UTC
//! with the stored offset; containment is checked at minute resolution and
//! wraps around midnight when `start_time > end_time`.

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use courier_core::types::{QuietHoursConfig, QuietHoursFallback};
use serde::{Deserialize, Serialize};
use tracing::warn;

const MINUTES_PER_DAY: i32 = 24 * 60;

/// What quiet hours require of a send attempted at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum QuietHoursVerdict {
    /// Outside the window, or quiet hours disabled.
    Clear,
    Requeue { at: DateTime<Utc> },
    Abort,
}

/// Decides whether `now` falls inside the configured quiet window.
pub fn evaluate(config: &QuietHoursConfig, now: DateTime<Utc>) -> QuietHoursVerdict {
    if !config.enabled {
        return QuietHoursVerdict::Clear;
    }

    let start = to_utc_minute(config.start_time, config.timezone_offset_minutes);
    let end = to_utc_minute(config.end_time, config.timezone_offset_minutes);
    let current = now.hour() * 60 + now.minute();

    if !window_contains(start, end, current) {
        return QuietHoursVerdict::Clear;
    }

    match config.fallback {
        Some(QuietHoursFallback::Abort) => QuietHoursVerdict::Abort,
        Some(QuietHoursFallback::RequeueAtNextAvailableTime) => QuietHoursVerdict::Requeue {
            at: window_end_after(now, end),
        },
        None => {
            warn!("Quiet hours fallback not configured, requeueing at window end");
            QuietHoursVerdict::Requeue {
                at: window_end_after(now, end),
            }
        }
    }
}

/// Minute-of-day containment for `[start, end)`; an empty window when equal.
pub fn window_contains(start: u32, end: u32, minute: u32) -> bool {
    if start == end {
        false
    } else if start < end {
        minute >= start && minute < end
    } else {
        minute >= start || minute < end
    }
}

fn to_utc_minute(local: NaiveTime, offset_minutes: i32) -> u32 {
    let local_minute = (local.hour() * 60 + local.minute()) as i32;
    (local_minute - offset_minutes).rem_euclid(MINUTES_PER_DAY) as u32
}

/// The window end on the current UTC date, pushed a day later unless strictly after `now`.
fn window_end_after(now: DateTime<Utc>, end_minute: u32) -> DateTime<Utc> {
    let end_time = NaiveTime::from_hms_opt(end_minute / 60, end_minute % 60, 0).unwrap_or_default();
    let candidate =
        DateTime::<Utc>::from_naive_utc_and_offset(now.date_naive().and_time(end_time), Utc);
    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(start: (u32, u32), end: (u32, u32)) -> QuietHoursConfig {
        QuietHoursConfig {
            enabled: true,
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            timezone_offset_minutes: 0,
            fallback: Some(QuietHoursFallback::RequeueAtNextAvailableTime),
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, h, m, 0).unwrap()
    }

    #[test]
    fn test_wraparound_requeues_to_next_day() {
        let verdict = evaluate(&config((22, 0), (6, 0)), at(23, 30));
        assert_eq!(
            verdict,
            QuietHoursVerdict::Requeue {
                at: Utc.with_ymd_and_hms(2024, 3, 15, 6, 0, 0).unwrap()
            }
        );
    }

    #[test]
    fn test_wraparound_early_morning_requeues_same_day() {
        let verdict = evaluate(&config((22, 0), (6, 0)), at(3, 0));
        assert_eq!(
            verdict,
            QuietHoursVerdict::Requeue {
                at: Utc.with_ymd_and_hms(2024, 3, 14, 6, 0, 0).unwrap()
            }
        );
    }

    #[test]
    fn test_outside_window_is_clear() {
        assert_eq!(
            evaluate(&config((22, 0), (6, 0)), at(12, 0)),
            QuietHoursVerdict::Clear
        );
        // End is exclusive.
        assert_eq!(
            evaluate(&config((22, 0), (6, 0)), at(6, 0)),
            QuietHoursVerdict::Clear
        );
        assert_ne!(
            evaluate(&config((22, 0), (6, 0)), at(22, 0)),
            QuietHoursVerdict::Clear
        );
    }

    #[test]
    fn test_abort_fallback() {
        let mut cfg = config((9, 0), (17, 0));
        cfg.fallback = Some(QuietHoursFallback::Abort);
        assert_eq!(evaluate(&cfg, at(10, 15)), QuietHoursVerdict::Abort);
    }

    #[test]
    fn test_missing_fallback_requeues() {
        let mut cfg = config((9, 0), (17, 0));
        cfg.fallback = None;
        assert_eq!(
            evaluate(&cfg, at(10, 15)),
            QuietHoursVerdict::Requeue { at: at(17, 0) }
        );
    }

    #[test]
    fn test_timezone_offset_shifts_window() {
        // 22:00-06:00 at UTC+02:00 is 20:00-04:00 UTC.
        let mut cfg = config((22, 0), (6, 0));
        cfg.timezone_offset_minutes = 120;
        assert_eq!(
            evaluate(&cfg, at(21, 0)),
            QuietHoursVerdict::Requeue {
                at: Utc.with_ymd_and_hms(2024, 3, 15, 4, 0, 0).unwrap()
            }
        );
        assert_eq!(evaluate(&cfg, at(5, 0)), QuietHoursVerdict::Clear);
    }

    #[test]
    fn test_disabled_and_empty_windows() {
        let mut cfg = config((0, 0), (23, 59));
        cfg.enabled = false;
        assert_eq!(evaluate(&cfg, at(12, 0)), QuietHoursVerdict::Clear);
        assert_eq!(
            evaluate(&config((8, 0), (8, 0)), at(8, 0)),
            QuietHoursVerdict::Clear
        );
    }
}
