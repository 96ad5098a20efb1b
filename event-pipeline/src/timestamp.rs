use std::borrow::Cow;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

const FUTURE_EVENT_HOURS_CUTOFF_MILLIS: i64 = 23 * 3600 * 1000; // 23 hours

static SHORT_TIMEZONE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?[+-]\d{2}$")
        .expect("timezone regex is valid")
});

/// Work out when an event happened, in server time.
///
/// Clients send their own `timestamp` and the time the batch left the device
/// (`sent_at`). The difference between the two is applied to the server
/// arrival time `now`, which removes any skew in the client clock. An
/// explicit `offset` (milliseconds before `now`) wins over both.
///
/// Timestamps more than 23 hours in the future are clamped to `now`, and
/// anything outside years 0..=9999 falls back to the epoch.
pub fn parse_event_timestamp(
    timestamp: Option<&str>,
    offset: Option<i64>,
    sent_at: Option<DateTime<Utc>>,
    ignore_sent_at: bool,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let effective_sent_at = if ignore_sent_at { None } else { sent_at };

    let mut parsed_ts = handle_timestamp(timestamp, offset, effective_sent_at, now);

    let now_diff = parsed_ts.signed_duration_since(now).num_milliseconds();
    if now_diff > FUTURE_EVENT_HOURS_CUTOFF_MILLIS {
        parsed_ts = now;
    }

    if parsed_ts.year() < 0 || parsed_ts.year() > 9999 {
        parsed_ts = DateTime::UNIX_EPOCH;
    }

    parsed_ts
}

fn handle_timestamp(
    timestamp: Option<&str>,
    offset: Option<i64>,
    sent_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let mut parsed_ts = now;

    if let Some(timestamp_parsed) = timestamp.and_then(parse_date) {
        parsed_ts = match sent_at {
            // x = now + (timestamp - sent_at)
            Some(sent_at) => now
                .checked_add_signed(timestamp_parsed.signed_duration_since(sent_at))
                .unwrap_or(DateTime::UNIX_EPOCH),
            None => timestamp_parsed,
        };
    }

    // Offsets come straight from the client, anything past chrono's range
    // is treated like any other out-of-range timestamp
    if let Some(offset_ms) = offset {
        parsed_ts = Duration::try_milliseconds(offset_ms)
            .and_then(|offset| now.checked_sub_signed(offset))
            .unwrap_or(DateTime::UNIX_EPOCH);
    }

    parsed_ts
}

/// Parse an ISO 8601 style date. Strings without a zone are taken as UTC.
pub fn parse_date(supposed_iso_string: &str) -> Option<DateTime<Utc>> {
    let normalized = normalize_timezone_format(supposed_iso_string);

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// "2025-09-17T14:05:04.805+03" -> "2025-09-17T14:05:04.805+03:00"
fn normalize_timezone_format(input: &str) -> Cow<'_, str> {
    let Some(last_3_chars) = input.len().checked_sub(3).and_then(|i| input.get(i..)) else {
        return Cow::Borrowed(input);
    };

    if !(last_3_chars.starts_with('+') || last_3_chars.starts_with('-'))
        || !last_3_chars[1..].chars().all(|c| c.is_ascii_digit())
    {
        return Cow::Borrowed(input);
    }

    if SHORT_TIMEZONE_REGEX.is_match(input) {
        Cow::Owned(format!("{input}:00"))
    } else {
        Cow::Borrowed(input)
    }
}
