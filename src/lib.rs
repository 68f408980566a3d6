//! A library-embedded job scheduler: one actor task per registered job,
//! cron and fixed-delay schedules with DST-aware evaluation, and a
//! virtual-time clock abstraction for deterministic tests.

pub mod activity;
pub mod config;
pub mod error;
pub mod facade;
pub mod job;
pub mod schedule;
pub mod stats;
pub mod time_scale;

pub use config::SchedulerDefaults;
pub use error::{Result, SchedulerError};
pub use facade::{JobBody, Scheduler, SCHED_SENTINEL, SCHED_SENTINEL_ALIAS};
pub use job::{JobDescriptor, JobOptions, RepeatSpec, RepeatValue, Task};
pub use schedule::{CronSchedule, NonexistentTimeStrategy, Schedule, Unit};
pub use stats::{MetricSummary, Stats};
pub use time_scale::{RealTimeScale, TestTimeScale, TimeScale};
