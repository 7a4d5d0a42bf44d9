//! Rate-limit detection in agent output.
//!
//! Providers announce limits in prose; the reset time comes in three
//! stable formats ("resets 3pm", "resets Feb 22 at 9:30am", "resets
//! tomorrow at 3pm"), each optionally followed by an IANA timezone in
//! parentheses. Anything else falls back to a conservative one hour,
//! six for weekly-limit phrasing.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::constants::{RATE_LIMIT_FALLBACK_SECS, RATE_LIMIT_WEEKLY_FALLBACK_SECS};

fn limit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\b(rate|usage|weekly)\s+limit\b").unwrap())
}

fn reset_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?ix)
            resets\s+
            (?:(tomorrow)\s+at\s+)?
            (?:([A-Za-z]{3,9})\s+(\d{1,2})\s+at\s+)?
            (\d{1,2})(?::(\d{2}))?\s*(am|pm)
            (?:\s*\(([A-Za-z_]+(?:/[A-Za-z0-9_+\-]+)+)\))?",
        )
        .unwrap()
    })
}

/// A detected rate-limit message.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitNotice {
    pub reset_at: DateTime<Utc>,
    /// Weekly-limit phrasing (longer fallback).
    pub weekly: bool,
    /// False when the reset time could not be parsed and the fallback
    /// window was applied.
    pub parsed: bool,
}

/// Scan a chunk of agent output for a rate-limit message.
pub fn detect(text: &str, now: DateTime<Utc>) -> Option<RateLimitNotice> {
    let captures = limit_pattern().captures(text)?;
    let weekly = captures
        .get(1)
        .map(|m| m.as_str().eq_ignore_ascii_case("weekly"))
        .unwrap_or(false);

    match parse_reset_time(text, now) {
        Some(reset_at) => {
            debug!(%reset_at, weekly, "rate-limit reset parsed");
            Some(RateLimitNotice {
                reset_at,
                weekly,
                parsed: true,
            })
        }
        None => {
            let fallback = if weekly {
                RATE_LIMIT_WEEKLY_FALLBACK_SECS
            } else {
                RATE_LIMIT_FALLBACK_SECS
            };
            warn!(weekly, fallback_secs = fallback, "rate-limit reset unparseable, using fallback");
            Some(RateLimitNotice {
                reset_at: now + Duration::seconds(fallback),
                weekly,
                parsed: false,
            })
        }
    }
}

/// Parse a "resets ..." phrase into an instant. The time is interpreted
/// in the trailing IANA timezone when present, UTC otherwise, and
/// always resolves to the next future occurrence.
pub fn parse_reset_time(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = reset_pattern().captures(text)?;

    let tomorrow = caps.get(1).is_some();
    let month = caps.get(2).and_then(|m| month_number(m.as_str()));
    let day: Option<u32> = caps.get(3).and_then(|m| m.as_str().parse().ok());
    let hour_raw: u32 = caps.get(4)?.as_str().parse().ok()?;
    let minute: u32 = caps
        .get(5)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    let pm = caps.get(6)?.as_str().eq_ignore_ascii_case("pm");
    let tz: Tz = match caps.get(7) {
        Some(name) => name.as_str().parse().ok()?,
        None => Tz::UTC,
    };

    if hour_raw == 0 || hour_raw > 12 || minute > 59 {
        return None;
    }
    let hour = match (hour_raw, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    };

    let local_now = now.with_timezone(&tz);

    let date = if tomorrow {
        local_now.date_naive().succ_opt()?
    } else if let (Some(month), Some(day)) = (month, day) {
        let mut date = NaiveDate::from_ymd_opt(local_now.year(), month, day)?;
        let candidate = resolve_local(&tz, date, hour, minute)?;
        if candidate <= now {
            date = NaiveDate::from_ymd_opt(local_now.year() + 1, month, day)?;
        }
        date
    } else {
        let today = local_now.date_naive();
        let candidate = resolve_local(&tz, today, hour, minute)?;
        if candidate <= now {
            today.succ_opt()?
        } else {
            today
        }
    };

    resolve_local(&tz, date, hour, minute)
}

fn resolve_local(tz: &Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    tz.from_local_datetime(&naive)
        .single()
        .or_else(|| tz.from_local_datetime(&naive).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

fn month_number(name: &str) -> Option<u32> {
    let prefix = name.get(..3)?.to_ascii_lowercase();
    match prefix.as_str() {
        "jan" => Some(1),
        "feb" => Some(2),
        "mar" => Some(3),
        "apr" => Some(4),
        "may" => Some(5),
        "jun" => Some(6),
        "jul" => Some(7),
        "aug" => Some(8),
        "sep" => Some(9),
        "oct" => Some(10),
        "nov" => Some(11),
        "dec" => Some(12),
        _ => None,
    }
}
