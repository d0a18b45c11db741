//! Throttle guard — quiet hours and randomized pacing between sends.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Whether the local clock in `timezone` sits inside the allowed send window.
///
/// Hours outside 0..=23 are clamped. `start == end` means the window never
/// closes. A window that wraps midnight (e.g. 20..6) is honored on both
/// sides of it. Unknown timezone names fall back to UTC.
pub fn within_allowed_hours(
    start_hour: u8,
    end_hour: u8,
    timezone: &str,
    now: DateTime<Utc>,
) -> bool {
    let start = start_hour.min(23) as u32;
    let end = end_hour.min(23) as u32;
    if start == end {
        return true;
    }

    let tz: Tz = match timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone, "Unknown timezone, falling back to UTC");
            chrono_tz::UTC
        }
    };
    let hour = now.with_timezone(&tz).hour();

    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Clamp a reply-delay pair into sane bounds: at least 5s, at most 300s for
/// the minimum; the maximum at least the minimum and at most 600s.
pub fn clamp_reply_delays(min_seconds: u32, max_seconds: u32) -> (u32, u32) {
    let min = min_seconds.clamp(5, 300);
    let max = max_seconds.clamp(min, 600);
    (min, max)
}

/// Clamp an outreach-delay pair, with an optional anti-spam floor. Cold
/// audiences get a 180s floor so fresh prospects are never machine-gunned.
pub fn clamp_outreach_delays(min_seconds: u32, max_seconds: u32, floor: u32) -> (u32, u32) {
    let min = min_seconds.max(floor).clamp(5, 600);
    let max = max_seconds.clamp(min, 900);
    (min, max)
}

/// Uniform random delay in `[min, max]` seconds.
pub fn jittered_delay(min_seconds: u32, max_seconds: u32) -> Duration {
    let (min, max) = if min_seconds <= max_seconds {
        (min_seconds, max_seconds)
    } else {
        (max_seconds, min_seconds)
    };
    let secs = rand::thread_rng().gen_range(min..=max);
    Duration::from_secs(secs as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_utc_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, hour, 30, 0).unwrap()
    }

    #[test]
    fn plain_window_honors_bounds() {
        assert!(within_allowed_hours(8, 22, "UTC", at_utc_hour(8)));
        assert!(within_allowed_hours(8, 22, "UTC", at_utc_hour(21)));
        assert!(!within_allowed_hours(8, 22, "UTC", at_utc_hour(22)));
        assert!(!within_allowed_hours(8, 22, "UTC", at_utc_hour(3)));
    }

    #[test]
    fn wrapped_window_spans_midnight() {
        assert!(within_allowed_hours(20, 6, "UTC", at_utc_hour(23)));
        assert!(within_allowed_hours(20, 6, "UTC", at_utc_hour(2)));
        assert!(!within_allowed_hours(20, 6, "UTC", at_utc_hour(12)));
    }

    #[test]
    fn equal_bounds_never_close() {
        for hour in 0..24 {
            assert!(within_allowed_hours(9, 9, "UTC", at_utc_hour(hour)));
        }
    }

    #[test]
    fn window_is_evaluated_in_local_time() {
        // 07:30 UTC is 08:30 in Berlin (winter) — inside an 8..22 window.
        assert!(within_allowed_hours(8, 22, "Europe/Berlin", at_utc_hour(7)));
        assert!(!within_allowed_hours(8, 22, "UTC", at_utc_hour(7)));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert!(within_allowed_hours(8, 22, "Mars/Olympus", at_utc_hour(12)));
        assert!(!within_allowed_hours(8, 22, "Mars/Olympus", at_utc_hour(3)));
    }

    #[test]
    fn out_of_range_hours_are_clamped() {
        // 25 clamps to 23: window 8..23.
        assert!(within_allowed_hours(8, 25, "UTC", at_utc_hour(22)));
        assert!(!within_allowed_hours(8, 25, "UTC", at_utc_hour(23)));
    }

    #[test]
    fn reply_delays_clamp() {
        assert_eq!(clamp_reply_delays(0, 0), (5, 5));
        assert_eq!(clamp_reply_delays(15, 45), (15, 45));
        assert_eq!(clamp_reply_delays(400, 10_000), (300, 600));
        assert_eq!(clamp_reply_delays(60, 10), (60, 60));
    }

    #[test]
    fn outreach_delays_respect_floor() {
        assert_eq!(clamp_outreach_delays(45, 75, 0), (45, 75));
        assert_eq!(clamp_outreach_delays(45, 75, 180), (180, 180));
        assert_eq!(clamp_outreach_delays(45, 400, 180), (180, 400));
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..50 {
            let d = jittered_delay(5, 10).as_secs();
            assert!((5..=10).contains(&d));
        }
        assert_eq!(jittered_delay(7, 7).as_secs(), 7);
        // Swapped bounds are tolerated.
        let d = jittered_delay(10, 5).as_secs();
        assert!((5..=10).contains(&d));
    }
}
