use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};

/// Capability abstracting "current time in a timezone" and a speedup
/// factor dividing every scheduled delay. Injected into a job activity at
/// construction time; never a global/static.
pub trait TimeScale: Send + Sync {
    /// The scheduler's notion of "now", expressed in `tz`.
    fn now(&self, tz: Tz) -> DateTime<Tz>;

    /// Positive divisor applied to every real delay the activity waits.
    /// Should not change across calls within a single activity's lifetime
    /// (the engine is free to cache it after the first read).
    fn speedup(&self) -> f64;
}

/// The identity scale: real UTC/local time, speedup 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealTimeScale;

impl TimeScale for RealTimeScale {
    fn now(&self, tz: Tz) -> DateTime<Tz> {
        Utc::now().with_timezone(&tz)
    }

    fn speedup(&self) -> f64 {
        1.0
    }
}

/// Virtual-time scale for tests.
///
/// `now()` tracks wall-clock time elapsed since construction, scaled by
/// `speedup`, and added on top of a fixed `start_time` — so a speedup of
/// 86_400 makes one real second look like one logical day to every
/// `next_fire` call. Because it is built on `tokio::time::Instant` rather
/// than its own independent clock, it composes with `tokio::time::pause`
/// and `tokio::time::advance`: pausing the runtime's virtual clock pauses
/// this scale too, and advancing it advances both in lockstep — there is
/// only one clock to keep in sync, not two.
pub struct TestTimeScale {
    start_time: DateTime<Utc>,
    started_at: tokio::time::Instant,
    speedup: f64,
}

impl TestTimeScale {
    /// Create a test scale pinned to `start_time`, dividing every real
    /// delay by `speedup`. Returns an error if `speedup` is not finite
    /// and positive.
    pub fn new(start_time: DateTime<Utc>, speedup: f64) -> Result<Self> {
        if !(speedup.is_finite() && speedup > 0.0) {
            return Err(SchedulerError::InvalidRepeatValue(format!(
                "speedup must be a finite positive number, got {speedup}"
            )));
        }
        Ok(Self {
            start_time,
            started_at: tokio::time::Instant::now(),
            speedup,
        })
    }

    /// Convenience constructor: pinned to the real current instant.
    pub fn starting_now(speedup: f64) -> Result<Self> {
        Self::new(Utc::now(), speedup)
    }
}

impl TimeScale for TestTimeScale {
    fn now(&self, tz: Tz) -> DateTime<Tz> {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.started_at);
        let scaled_nanos = (elapsed.as_nanos() as f64) * self.speedup;
        let logical_now = self.start_time + chrono::Duration::nanoseconds(scaled_nanos as i64);
        logical_now.with_timezone(&tz)
    }

    fn speedup(&self) -> f64 {
        self.speedup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use chrono_tz::America::New_York;

    #[test]
    fn real_time_scale_speedup_is_one() {
        let scale = RealTimeScale;
        assert_eq!(scale.speedup(), 1.0);
    }

    #[test]
    fn real_time_scale_now_is_recent() {
        let scale = RealTimeScale;
        let now = scale.now(Tz::UTC);
        let diff = (Utc::now() - now.with_timezone(&Utc)).num_seconds().abs();
        assert!(diff < 2, "expected now() to be approximately real time");
    }

    #[test]
    fn test_time_scale_rejects_non_positive_speedup() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(TestTimeScale::new(start, 0.0).is_err());
        assert!(TestTimeScale::new(start, -1.0).is_err());
        assert!(TestTimeScale::new(start, f64::NAN).is_err());
        assert!(TestTimeScale::new(start, f64::INFINITY).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_scale_now_starts_at_pinned_instant() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let scale = TestTimeScale::new(start, 1.0).unwrap();
        assert_eq!(scale.now(Tz::UTC).naive_utc(), start.naive_utc());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_scale_advances_with_virtual_clock() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let scale = TestTimeScale::new(start, 1.0).unwrap();

        tokio::time::advance(std::time::Duration::from_secs(3600)).await;

        let expected = start + chrono::Duration::hours(1);
        assert_eq!(scale.now(Tz::UTC).naive_utc(), expected.naive_utc());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_scale_speedup_compresses_elapsed_time() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        // 1 real second looks like 1 logical day.
        let scale = TestTimeScale::new(start, 86_400.0).unwrap();

        tokio::time::advance(std::time::Duration::from_secs(1)).await;

        let expected = start + chrono::Duration::days(1);
        assert_eq!(scale.now(Tz::UTC).naive_utc(), expected.naive_utc());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_scale_reports_in_requested_timezone() {
        let start = Utc.with_ymd_and_hms(2025, 6, 15, 14, 0, 0).unwrap(); // 10:00 EDT
        let scale = TestTimeScale::new(start, 1.0).unwrap();
        let local = scale.now(New_York);
        assert_eq!(local.hour(), 10);
    }
}
