use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use rand::Rng;

use super::DispatchPolicy;

/// Today at `hour:minute` UTC, or the same time tomorrow if it already passed.
/// `None` when `hour:minute` is not a time of day.
pub fn next_send_time(now: DateTime<Utc>, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let start = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(start));

    if today < now {
        Some(today + Duration::days(1))
    } else {
        Some(today)
    }
}

/// `[base_time, base_time + 24h)`: every email scheduled off `base_time`,
/// including the ones spilling past midnight, and nothing of the next send day.
pub fn send_day(base_time: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (base_time, base_time + Duration::days(1))
}

/// Offset from the base send time for the `slot`-th email of the day:
/// `slot * spacing` plus a jitter drawn uniformly from the policy's range.
pub fn email_delay(slot: usize, policy: &DispatchPolicy) -> Duration {
    let min = policy.min_jitter_minutes.min(policy.max_jitter_minutes);
    let max = policy.min_jitter_minutes.max(policy.max_jitter_minutes);
    let jitter = rand::thread_rng().gen_range(min..=max);

    policy.spacing * slot as i32 + Duration::minutes(jitter)
}

/// Plain-text rendition of an HTML body: angle brackets are dropped.
pub fn strip_html(html: &str) -> String {
    html.replace(|c: char| matches!(c, '<' | '>'), "")
}
