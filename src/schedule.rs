use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, LocalResult, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use croner::Cron;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// A unit of relative time, as accepted by a `Schedule::Delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl Unit {
    /// Length of one unit, in milliseconds.
    pub fn as_millis(self) -> u64 {
        match self {
            Unit::Milliseconds => 1,
            Unit::Seconds => 1_000,
            Unit::Minutes => 60 * Unit::Seconds.as_millis(),
            Unit::Hours => 60 * Unit::Minutes.as_millis(),
            Unit::Days => 24 * Unit::Hours.as_millis(),
            Unit::Weeks => 7 * Unit::Days.as_millis(),
        }
    }
}

impl FromStr for Unit {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ms" | "milliseconds" => Ok(Unit::Milliseconds),
            "s" | "sec" | "seconds" => Ok(Unit::Seconds),
            "m" | "min" | "minutes" => Ok(Unit::Minutes),
            "h" | "hours" => Ok(Unit::Hours),
            "d" | "days" => Ok(Unit::Days),
            "w" | "weeks" => Ok(Unit::Weeks),
            other => Err(SchedulerError::InvalidUnit(other.to_string())),
        }
    }
}

/// How to resolve a cron schedule that would otherwise land on a
/// nonexistent local instant (a spring-forward DST gap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NonexistentTimeStrategy {
    /// Probe forward past the gap and recurse for the *next* occurrence,
    /// but charge the delay from the original reference instant.
    #[default]
    Skip,
    /// Synthesize the UTC instant directly from the gap boundary's fixed
    /// offset, without a local-to-UTC lookup.
    Adjust,
}

/// The year field of a 7-field extended cron expression (spec.md §3.1,
/// §6.4): `*` (any year), a single year, or a comma-separated list of
/// years/year-ranges (`"1999"`, `"2025,2027"`, `"2030-2040"`).
#[derive(Debug, Clone, PartialEq, Eq)]
enum YearFilter {
    Any,
    Ranges(Vec<(i32, i32)>),
}

impl YearFilter {
    fn parse(spec: &str, source: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec == "*" {
            return Ok(YearFilter::Any);
        }
        let mut ranges = Vec::new();
        for token in spec.split(',') {
            let token = token.trim();
            let invalid = || {
                SchedulerError::InvalidCron(
                    source.to_string(),
                    format!("invalid year field token '{token}'"),
                )
            };
            if token.is_empty() {
                return Err(invalid());
            }
            if let Some((start, end)) = token.split_once('-') {
                let start: i32 = start.trim().parse().map_err(|_| invalid())?;
                let end: i32 = end.trim().parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                ranges.push((start, end));
            } else {
                let year: i32 = token.parse().map_err(|_| invalid())?;
                ranges.push((year, year));
            }
        }
        Ok(YearFilter::Ranges(ranges))
    }

    fn matches(&self, year: i32) -> bool {
        match self {
            YearFilter::Any => true,
            YearFilter::Ranges(ranges) => ranges.iter().any(|(start, end)| year >= *start && year <= *end),
        }
    }

    /// The smallest year `>= from` this filter allows, if any.
    fn next_matching_year_from(&self, from: i32) -> Option<i32> {
        match self {
            YearFilter::Any => Some(from),
            YearFilter::Ranges(ranges) => ranges
                .iter()
                .filter_map(|(start, end)| if from <= *end { Some(from.max(*start)) } else { None })
                .min(),
        }
    }
}

/// A single cron expression plus enough metadata to report it back to a
/// caller. `croner` auto-detects the 5-field and 6-field (leading
/// seconds) forms directly; a 7th, trailing year field (spec.md's
/// "extended crontab") is split off before reaching `croner` and applied
/// as a post-filter in `resolve_cron_after` instead, since `croner`
/// itself has no year concept.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    source: String,
    cron: Arc<Cron>,
    field_count: usize,
    year_filter: Option<YearFilter>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let field_count = fields.len();
        let (cron_source, year_filter) = if field_count == 7 {
            let (prefix, year_field) = fields.split_at(6);
            (prefix.join(" "), Some(YearFilter::parse(year_field[0], expression)?))
        } else {
            (expression.to_string(), None)
        };
        let cron = Cron::from_str(&cron_source)
            .map_err(|e| SchedulerError::InvalidCron(expression.to_string(), e.to_string()))?;
        Ok(Self {
            source: expression.to_string(),
            cron: Arc::new(cron),
            field_count,
            year_filter,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn field_count(&self) -> usize {
        self.field_count
    }
}

/// The three schedule kinds a job can carry. `Millis` is sugar the façade
/// normalizes into `Delay(n, Milliseconds)` before it ever reaches the
/// activity; it is kept here only as the construction entry point.
///
/// `Cron` accepts the standard 5-field expression, `croner`'s 6-field
/// extension with a leading seconds field, and a 7-field extension
/// (leading seconds plus a trailing year field, spec.md §6.4).
#[derive(Debug, Clone)]
pub enum Schedule {
    Delay { value: u64, unit: Unit },
    Cron(CronSchedule),
}

impl Schedule {
    pub fn delay(value: u64, unit: Unit) -> Result<Self> {
        if value == 0 {
            return Err(SchedulerError::InvalidRepeatValue(
                "delay value must be a positive integer".to_string(),
            ));
        }
        Ok(Schedule::Delay { value, unit })
    }

    pub fn millis(value: u64) -> Result<Self> {
        Self::delay(value, Unit::Milliseconds)
    }

    pub fn cron(expression: &str) -> Result<Self> {
        Ok(Schedule::Cron(CronSchedule::parse(expression)?))
    }

    fn raw_delay_ms(value: u64, unit: Unit) -> u64 {
        value.saturating_mul(unit.as_millis())
    }
}

/// The result of evaluating a schedule for its next firing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NextFire {
    /// The logical instant the activity is considered scheduled for.
    pub next_instant: DateTime<Utc>,
    /// The real (wall-clock) delay to arm a timer for, after dividing the
    /// raw logical delay by the time scale's speedup and rounding.
    pub real_delay_ms: u64,
    /// The unrounded delay `real_delay_ms` was rounded from, in
    /// milliseconds — the difference between the two is the
    /// quantization error introduced by a millisecond-granular timer.
    pub exact_real_delay_ms: f64,
}

/// Returns `(rounded_ms, exact_ms)`: the integer millisecond duration a
/// real timer is armed for, and the unrounded value it was computed
/// from. The gap between the two is the quantization error a caller may
/// want to track.
fn round_div(raw_ms: i64, speedup: f64) -> (u64, f64) {
    let exact = (raw_ms.max(0) as f64) / speedup;
    (exact.round().max(0.0) as u64, exact)
}

/// Evaluate `schedule` for its next firing.
///
/// `from_instant` is the reference used by `Delay` schedules — next =
/// from + raw_ms, so repeated delays chain off the last logical instant
/// with no drift regardless of speedup. Cron schedules ignore
/// `from_instant` and instead search forward from `now`, the scheduler's
/// live notion of current time: cron describes absolute wall-clock slots,
/// not offsets, so a schedule should always find the next slot after
/// *now*, self-correcting for any overrun of the previous firing rather
/// than drifting forward from where the last slot happened to land.
pub fn next_fire(
    from_instant: DateTime<Utc>,
    now: DateTime<Utc>,
    schedule: &Schedule,
    timezone: Tz,
    nonexistent_time_strategy: NonexistentTimeStrategy,
    speedup: f64,
) -> Result<NextFire> {
    match schedule {
        Schedule::Delay { value, unit } => {
            let raw_ms = Schedule::raw_delay_ms(*value, *unit);
            let next_instant = from_instant + ChronoDuration::milliseconds(raw_ms as i64);
            let (real_delay_ms, exact_real_delay_ms) = round_div(raw_ms as i64, speedup);
            Ok(NextFire {
                next_instant,
                real_delay_ms,
                exact_real_delay_ms,
            })
        }
        Schedule::Cron(cron) => next_cron_fire(cron, now, timezone, nonexistent_time_strategy, speedup),
    }
}

fn next_cron_fire(
    cron: &CronSchedule,
    now: DateTime<Utc>,
    timezone: Tz,
    nonexistent_time_strategy: NonexistentTimeStrategy,
    speedup: f64,
) -> Result<NextFire> {
    let local_now = now.with_timezone(&timezone);
    let next_instant = resolve_cron_after(cron, local_now.naive_local(), timezone, nonexistent_time_strategy)?;
    let raw_ms = (next_instant - now).num_milliseconds().max(0);
    let (real_delay_ms, exact_real_delay_ms) = round_div(raw_ms, speedup);
    Ok(NextFire {
        next_instant,
        real_delay_ms,
        exact_real_delay_ms,
    })
}

/// Find the next UTC instant matching `cron` strictly after `after_local`
/// (a naive local datetime in `timezone`), resolving DST gaps/ambiguity
/// per `strategy`.
fn resolve_cron_after(
    cron: &CronSchedule,
    after_local: chrono::NaiveDateTime,
    timezone: Tz,
    strategy: NonexistentTimeStrategy,
) -> Result<DateTime<Utc>> {
    // croner operates on `DateTime<Tz>` for any `TimeZone` impl; we feed it
    // naive-local-wrapped-as-Utc so its internal calendar arithmetic never
    // has to reason about a real offset, then re-localize the naive result
    // ourselves so we can apply §4.2's DST policy explicitly rather than
    // delegate it to whatever the cron crate's own default does.
    let mut probe = Utc.from_utc_datetime(&after_local);
    let naive_next = loop {
        let candidate = cron
            .cron
            .find_next_occurrence(&probe, false)
            .map_err(|e| SchedulerError::ScheduleExhausted(e.to_string()))?
            .naive_utc();

        let Some(year_filter) = cron.year_filter.as_ref() else {
            break candidate;
        };
        if year_filter.matches(candidate.year()) {
            break candidate;
        }
        // Candidate's year doesn't match; skip straight to the filter's
        // next allowed year rather than re-probing occurrence by
        // occurrence (a daily/hourly cron could otherwise need hundreds
        // of candidates to cross one excluded year).
        let next_year = year_filter.next_matching_year_from(candidate.year() + 1).ok_or_else(|| {
            SchedulerError::ScheduleExhausted(format!(
                "cron '{}' has no future occurrence matching its year field",
                cron.source
            ))
        })?;
        probe = Utc.with_ymd_and_hms(next_year, 1, 1, 0, 0, 0).single().expect("valid new year's instant")
            - ChronoDuration::seconds(1);
    };

    match timezone.from_local_datetime(&naive_next) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, latest) => {
            // Fall-back ambiguity: two UTC instants map to the same local
            // wall-clock reading. Pick the later-UTC occurrence, i.e. the
            // one after the repeated hour has already elapsed once.
            let _ = earliest;
            Ok(latest.with_timezone(&Utc))
        }
        LocalResult::None => resolve_dst_gap(cron, naive_next, timezone, strategy),
    }
}

/// `naive_next` fell inside a spring-forward gap and has no valid local
/// mapping. `skip` probes forward in one-minute steps to find the first
/// local instant that *is* valid, then recurses the cron search from
/// there. `adjust` instead reconstructs the UTC instant directly from the
/// gap boundary's fixed offset, trusting that a cron match that lands
/// inside a gap was "meant" to fire at the boundary's offset rather than
/// be skipped to a whole new occurrence.
fn resolve_dst_gap(
    cron: &CronSchedule,
    naive_next: chrono::NaiveDateTime,
    timezone: Tz,
    strategy: NonexistentTimeStrategy,
) -> Result<DateTime<Utc>> {
    match strategy {
        NonexistentTimeStrategy::Skip => {
            let mut probe = naive_next;
            let first_valid_after_gap = loop {
                probe += ChronoDuration::minutes(1);
                if let LocalResult::Single(dt) = timezone.from_local_datetime(&probe) {
                    break dt.with_timezone(&Utc);
                }
                // Gaps are at most a couple of hours; guard against an
                // unreasonable tz database entry looping forever.
                if probe - naive_next > ChronoDuration::hours(6) {
                    return Err(SchedulerError::ScheduleExhausted(format!(
                        "no valid local time found after DST gap near {naive_next}"
                    )));
                }
            };
            resolve_cron_after(cron, first_valid_after_gap.naive_local(), timezone, strategy)
        }
        NonexistentTimeStrategy::Adjust => {
            // The instant just before the gap carries the pre-transition
            // offset; apply it directly to the naive gap-time to get the
            // UTC instant the wall clock "would have" reached had the
            // clock not jumped.
            let just_before = naive_next - ChronoDuration::minutes(1);
            let offset_seconds = match timezone.from_local_datetime(&just_before) {
                LocalResult::Single(dt) => dt.offset().fix().local_minus_utc(),
                _ => {
                    return Err(SchedulerError::ScheduleExhausted(format!(
                        "could not resolve offset preceding DST gap near {naive_next}"
                    )))
                }
            };
            Ok(Utc.from_utc_datetime(&(naive_next - ChronoDuration::seconds(offset_seconds as i64))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Chicago;
    use chrono_tz::America::New_York;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn unit_conversions_match_canonical_table() {
        assert_eq!(Unit::Milliseconds.as_millis(), 1);
        assert_eq!(Unit::Seconds.as_millis(), 1_000);
        assert_eq!(Unit::Minutes.as_millis(), 60_000);
        assert_eq!(Unit::Hours.as_millis(), 3_600_000);
        assert_eq!(Unit::Days.as_millis(), 86_400_000);
        assert_eq!(Unit::Weeks.as_millis(), 604_800_000);
    }

    #[test]
    fn unit_aliases_parse() {
        for alias in ["ms", "milliseconds"] {
            assert_eq!(alias.parse::<Unit>().unwrap(), Unit::Milliseconds);
        }
        for alias in ["s", "sec", "seconds"] {
            assert_eq!(alias.parse::<Unit>().unwrap(), Unit::Seconds);
        }
        for alias in ["m", "min", "minutes"] {
            assert_eq!(alias.parse::<Unit>().unwrap(), Unit::Minutes);
        }
        for alias in ["h", "hours"] {
            assert_eq!(alias.parse::<Unit>().unwrap(), Unit::Hours);
        }
        for alias in ["d", "days"] {
            assert_eq!(alias.parse::<Unit>().unwrap(), Unit::Days);
        }
        for alias in ["w", "weeks"] {
            assert_eq!(alias.parse::<Unit>().unwrap(), Unit::Weeks);
        }
        assert!("fortnights".parse::<Unit>().is_err());
    }

    #[test]
    fn delay_schedule_rejects_zero_value() {
        assert!(Schedule::delay(0, Unit::Seconds).is_err());
    }

    #[test]
    fn delay_next_fire_chains_off_from_instant_not_now() {
        let from = utc(2025, 1, 1, 0, 0, 0);
        let now = utc(2025, 1, 1, 0, 5, 0); // pretend "now" has drifted
        let schedule = Schedule::delay(10, Unit::Seconds).unwrap();
        let result = next_fire(
            from,
            now,
            &schedule,
            Tz::UTC,
            NonexistentTimeStrategy::Skip,
            1.0,
        )
        .unwrap();
        assert_eq!(result.next_instant, from + ChronoDuration::seconds(10));
    }

    #[test]
    fn delay_real_delay_divided_by_speedup() {
        let from = utc(2025, 1, 1, 0, 0, 0);
        let schedule = Schedule::delay(10_000, Unit::Milliseconds).unwrap();
        let result = next_fire(
            from,
            from,
            &schedule,
            Tz::UTC,
            NonexistentTimeStrategy::Skip,
            100.0,
        )
        .unwrap();
        assert_eq!(result.real_delay_ms, 100);
    }

    #[test]
    fn cron_next_fire_searches_from_now_not_from_instant() {
        // "from_instant" is stale/in the past; cron should still land on
        // the next slot strictly after `now`.
        let from = utc(2020, 1, 1, 0, 0, 0);
        let now = utc(2025, 6, 1, 11, 59, 0);
        let schedule = Schedule::cron("0 12 * * *").unwrap();
        let result = next_fire(
            from,
            now,
            &schedule,
            Tz::UTC,
            NonexistentTimeStrategy::Skip,
            1.0,
        )
        .unwrap();
        assert_eq!(result.next_instant, utc(2025, 6, 1, 12, 0, 0));
    }

    #[test]
    fn cron_rejects_invalid_expression() {
        assert!(Schedule::cron("not a cron").is_err());
    }

    #[test]
    fn cron_dst_spring_forward_adjust_matches_worked_example() {
        // America/Chicago, 2019-03-10: clocks jump 02:00 -> 03:00 CDT.
        // "30 2 * * *" would land at the nonexistent 02:30 local.
        let schedule = Schedule::cron("30 2 * * *").unwrap();
        let now = Chicago
            .with_ymd_and_hms(2019, 3, 9, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let result = next_fire(
            now,
            now,
            &schedule,
            Chicago,
            NonexistentTimeStrategy::Adjust,
            1.0,
        )
        .unwrap();
        let local = result.next_instant.with_timezone(&Chicago);
        assert_eq!(local.to_string(), "2019-03-10 03:30:00 CDT");
    }

    #[test]
    fn cron_dst_spring_forward_skip_lands_after_gap() {
        let schedule = Schedule::cron("30 2 * * *").unwrap();
        let now = Chicago
            .with_ymd_and_hms(2019, 3, 9, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let result = next_fire(
            now,
            now,
            &schedule,
            Chicago,
            NonexistentTimeStrategy::Skip,
            1.0,
        )
        .unwrap();
        let local = result.next_instant.with_timezone(&Chicago);
        // Skip recurses to the *next* valid occurrence of "30 2 * * *",
        // i.e. the following day, rather than the gap boundary itself.
        assert_eq!(local.date_naive().to_string(), "2019-03-11");
        assert_eq!(local.format("%H:%M").to_string(), "02:30");
    }

    #[test]
    fn cron_dst_fall_back_picks_later_utc_occurrence() {
        // America/Chicago, 2019-11-03: clocks fall back 02:00 CDT ->
        // 01:00 CST, so 01:30 local occurs twice.
        let schedule = Schedule::cron("30 1 * * *").unwrap();
        let now = Chicago
            .with_ymd_and_hms(2019, 11, 2, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let result = next_fire(
            now,
            now,
            &schedule,
            Chicago,
            NonexistentTimeStrategy::Skip,
            1.0,
        )
        .unwrap();
        let local = result.next_instant.with_timezone(&Chicago);
        assert_eq!(local.to_string(), "2019-11-03 01:30:00 CST");
    }

    #[test]
    fn cron_field_count_is_informational() {
        let cron = CronSchedule::parse("*/5 * * * *").unwrap();
        assert_eq!(cron.field_count(), 5);
        assert_eq!(cron.source(), "*/5 * * * *");
    }

    #[test]
    fn cron_accepts_extended_six_field_expression_with_seconds() {
        // seconds, minute, hour, day-of-month, month, day-of-week
        let schedule = Schedule::cron("*/30 * * * * *");
        assert!(schedule.is_ok());
    }

    #[test]
    fn cron_seven_field_worked_example_fires_once_then_exhausts() {
        // spec.md §8.3 scenario 6: fires once at 1999-12-31T23:59:50Z,
        // then terminates because no later year ever matches 1999 again.
        let schedule = Schedule::cron("50 59 23 31 12 * 1999").unwrap();
        let now = utc(1999, 1, 1, 0, 0, 0);

        let first = next_fire(now, now, &schedule, Tz::UTC, NonexistentTimeStrategy::Skip, 1.0).unwrap();
        assert_eq!(first.next_instant, utc(1999, 12, 31, 23, 59, 50));

        let second = next_fire(
            first.next_instant,
            first.next_instant,
            &schedule,
            Tz::UTC,
            NonexistentTimeStrategy::Skip,
            1.0,
        );
        assert!(matches!(second, Err(SchedulerError::ScheduleExhausted(_))));
    }

    #[test]
    fn cron_seven_field_year_range_and_list() {
        // sec min hour dom month dow year: Jan 1st at midnight.
        let range = Schedule::cron("0 0 0 1 1 * 2030-2032").unwrap();
        let now = utc(2025, 1, 1, 0, 0, 0);
        let result = next_fire(now, now, &range, Tz::UTC, NonexistentTimeStrategy::Skip, 1.0).unwrap();
        assert_eq!(result.next_instant, utc(2030, 1, 1, 0, 0, 0));

        let list = Schedule::cron("0 0 0 1 1 * 2026,2028").unwrap();
        let result = next_fire(now, now, &list, Tz::UTC, NonexistentTimeStrategy::Skip, 1.0).unwrap();
        assert_eq!(result.next_instant, utc(2026, 1, 1, 0, 0, 0));
    }

    #[test]
    fn cron_seven_field_star_year_matches_any_year() {
        let schedule = Schedule::cron("0 0 * * * * *").unwrap();
        let now = utc(2025, 6, 1, 0, 0, 1);
        let result = next_fire(now, now, &schedule, Tz::UTC, NonexistentTimeStrategy::Skip, 1.0).unwrap();
        assert_eq!(result.next_instant, utc(2025, 6, 1, 1, 0, 0));
    }

    #[test]
    fn cron_seven_field_rejects_invalid_year_token() {
        assert!(Schedule::cron("0 0 1 1 * * not-a-year").is_err());
    }

    #[test]
    fn new_york_dst_spring_forward_adjust() {
        // 2023-03-12: 02:00 -> 03:00 EDT.
        let schedule = Schedule::cron("30 2 * * *").unwrap();
        let now = New_York
            .with_ymd_and_hms(2023, 3, 11, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let result = next_fire(
            now,
            now,
            &schedule,
            New_York,
            NonexistentTimeStrategy::Adjust,
            1.0,
        )
        .unwrap();
        let local = result.next_instant.with_timezone(&New_York);
        assert_eq!(local.to_string(), "2023-03-12 03:30:00 EDT");
    }
}
