use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::schedule::{NonexistentTimeStrategy, Schedule};

/// How many times a job may fire before terminating on its own.
///
/// Mirrors the three-way `repeat` option from spec.md: `Never` fires
/// once and terminates, `Forever` never exhausts, `Times(n)` caps the
/// activity at `n` firings (the run_once bootstrap firing, if any,
/// counts against the budget like any other fire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatSpec {
    Never,
    Forever,
    Times(u32),
}

impl Default for RepeatSpec {
    fn default() -> Self {
        RepeatSpec::Forever
    }
}

impl RepeatSpec {
    /// `false`/`true`/`n` from the façade's `repeat` option.
    pub fn from_bool_or_count(repeat: RepeatValue) -> Self {
        match repeat {
            RepeatValue::Bool(false) => RepeatSpec::Never,
            RepeatValue::Bool(true) => RepeatSpec::Forever,
            RepeatValue::Count(n) => RepeatSpec::Times(n),
        }
    }
}

/// The raw shape of the `repeat` option as accepted at the façade
/// boundary, before being normalized into a [`RepeatSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatValue {
    Bool(bool),
    Count(u32),
}

/// The task body a job activity invokes on every fire.
///
/// There is no m/f/a triple in Rust; instead the façade captures
/// whatever closure the caller supplied into one of these four shapes
/// before constructing the job. Arity 1 receives the scheduled instant
/// (the `__scheduled_time__` sentinel substitution target, §6.2) as its
/// single argument; arity 0 receives nothing.
pub enum Task {
    Sync0(Box<dyn FnMut() + Send>),
    Sync1(Box<dyn FnMut(chrono::DateTime<chrono::Utc>) + Send>),
    Async0(Box<dyn FnMut() -> BoxFuture<'static, ()> + Send>),
    Async1(Box<dyn FnMut(chrono::DateTime<chrono::Utc>) -> BoxFuture<'static, ()> + Send>),
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Task::Sync0(_) => "Sync0",
            Task::Sync1(_) => "Sync1",
            Task::Async0(_) => "Async0",
            Task::Async1(_) => "Async1",
        };
        f.debug_tuple("Task").field(&kind).finish()
    }
}

/// Options recognized at job construction, matching spec.md §6.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// IANA timezone name; `"Etc/UTC"` by default. `"utc"` is accepted
    /// as a deprecated alias and normalized to `"Etc/UTC"` at parse time.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Whether a fire may overlap with a still-running previous fire.
    #[serde(default)]
    pub overlap: bool,
    #[serde(default)]
    pub repeat: RepeatSpec,
    /// If true, the activity fires once immediately on construction in
    /// addition to its regular schedule.
    #[serde(default)]
    pub run_once: bool,
    #[serde(default)]
    pub nonexistent_time_strategy: NonexistentTimeStrategy,
}

fn default_timezone() -> String {
    "Etc/UTC".to_string()
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            overlap: false,
            repeat: RepeatSpec::default(),
            run_once: false,
            nonexistent_time_strategy: NonexistentTimeStrategy::default(),
        }
    }
}

impl JobOptions {
    /// Resolve the configured timezone string to a `chrono_tz::Tz`,
    /// accepting the deprecated `"utc"` alias.
    pub fn resolve_timezone(&self) -> crate::error::Result<chrono_tz::Tz> {
        let normalized = if self.timezone.eq_ignore_ascii_case("utc") {
            "Etc/UTC"
        } else {
            self.timezone.as_str()
        };
        normalized
            .parse::<chrono_tz::Tz>()
            .map_err(|_| crate::error::SchedulerError::InvalidTimezone(
                self.timezone.clone(),
                "not a recognized IANA timezone name".to_string(),
            ))
    }
}

/// A job as submitted to the façade: the schedule it follows, the task
/// body to invoke, and the options governing its lifecycle.
pub struct JobDescriptor {
    pub name: String,
    pub schedule: Schedule,
    pub task: Task,
    pub options: JobOptions,
    pub context: serde_json::Value,
}

impl JobDescriptor {
    pub fn new(name: impl Into<String>, schedule: Schedule, task: Task) -> Self {
        Self {
            name: name.into(),
            schedule,
            task,
            options: JobOptions::default(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}
