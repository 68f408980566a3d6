use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::RwLock;

use crate::activity::{spawn_activity, ActivityHandle};
use crate::config::SchedulerDefaults;
use crate::error::{Result, SchedulerError};
use crate::job::{JobDescriptor, JobOptions, RepeatSpec, Task};
use crate::schedule::{Schedule, Unit};
use crate::stats::Stats;
use crate::time_scale::{RealTimeScale, TimeScale};

/// Sentinel substituted, by equality only, for any argument in a
/// `run_job` args list that should receive the job's scheduled-fire
/// instant at call time. Never matched by substring — an argument must
/// equal this string exactly.
pub const SCHED_SENTINEL: &str = "__scheduled_time__";

/// A second accepted spelling of [`SCHED_SENTINEL`], kept for callers
/// migrating from the dollar-prefixed convention.
pub const SCHED_SENTINEL_ALIAS: &str = "$scheduled_time";

fn is_sentinel(value: &serde_json::Value) -> bool {
    matches!(value, serde_json::Value::String(s) if s == SCHED_SENTINEL || s == SCHED_SENTINEL_ALIAS)
}

fn substitute_sentinel(args: &[serde_json::Value], scheduled_at: DateTime<Utc>) -> Vec<serde_json::Value> {
    let resolved = serde_json::Value::String(scheduled_at.to_rfc3339());
    args.iter()
        .map(|arg| if is_sentinel(arg) { resolved.clone() } else { arg.clone() })
        .collect()
}

/// The body of a job submitted through [`Scheduler::run_job`]: a
/// function taking the (sentinel-substituted) argument list, in either
/// sync or async form.
pub enum JobBody {
    Sync(Box<dyn FnMut(Vec<serde_json::Value>) + Send>),
    Async(Box<dyn FnMut(Vec<serde_json::Value>) -> BoxFuture<'static, ()> + Send>),
}

/// The scheduling façade: the crate's only call surface for a host
/// embedding it. Owns nothing about job semantics itself — it normalizes
/// callers' requests into [`JobDescriptor`]s, spawns one activity per
/// job (§4.4, `activity.rs`), and keeps a name-indexed registry of the
/// resulting handles so `update_job`/`cancel`/introspection can look a
/// job back up by the name it was registered under.
pub struct Scheduler {
    time_scale: Arc<dyn TimeScale>,
    activities: RwLock<HashMap<String, ActivityHandle>>,
    defaults: SchedulerDefaults,
}

impl Scheduler {
    pub fn new(time_scale: Arc<dyn TimeScale>, defaults: SchedulerDefaults) -> Self {
        Self {
            time_scale,
            activities: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    /// Convenience constructor for production use: the real system clock
    /// at speedup 1, with default configuration.
    pub fn with_real_time() -> Self {
        Self::new(Arc::new(RealTimeScale), SchedulerDefaults::default())
    }

    fn default_options(&self) -> JobOptions {
        JobOptions {
            timezone: self.defaults.default_timezone.clone(),
            nonexistent_time_strategy: self.defaults.default_nonexistent_time_strategy,
            ..JobOptions::default()
        }
    }

    async fn register(&self, name: String, descriptor: JobDescriptor) -> Result<ActivityHandle> {
        let mut activities = self.activities.write().await;
        if activities.contains_key(&name) {
            return Err(SchedulerError::AlreadyExists(name));
        }
        let (handle, _join) = spawn_activity(descriptor, Arc::clone(&self.time_scale), self.defaults.mailbox_capacity);
        activities.insert(name, handle.clone());
        Ok(handle)
    }

    /// Fire `task` exactly once at `instant`. If `instant` has already
    /// passed, the activity fires as soon as its timer can be armed.
    /// Equivalent to `run_in` with `delay = instant - now()` ms and
    /// `repeat = 1` (§6.1).
    pub async fn run_at(
        &self,
        name: impl Into<String>,
        instant: DateTime<Utc>,
        task: Task,
        options: Option<JobOptions>,
    ) -> Result<ActivityHandle> {
        let name = name.into();
        let mut options = options.unwrap_or_else(|| self.default_options());
        options.repeat = RepeatSpec::Times(1);
        options.run_once = false;
        let tz = options.resolve_timezone()?;
        let now = self.time_scale.now(tz).with_timezone(&Utc);
        let raw_ms = (instant - now).num_milliseconds().max(1) as u64;
        let schedule = Schedule::delay(raw_ms, Unit::Milliseconds)?;
        let descriptor = JobDescriptor::new(name.clone(), schedule, task).with_options(options);
        self.register(name, descriptor).await
    }

    /// Fire `task` once after `value` `unit`s. `repeat` defaults to `1`
    /// (§6.1) when the caller doesn't pass `options`; pass `options`
    /// explicitly with a different `repeat` to recur on the same
    /// interval instead.
    pub async fn run_in(
        &self,
        name: impl Into<String>,
        value: u64,
        unit: Unit,
        task: Task,
        options: Option<JobOptions>,
    ) -> Result<ActivityHandle> {
        let name = name.into();
        let options = options.unwrap_or_else(|| JobOptions {
            repeat: RepeatSpec::Times(1),
            ..self.default_options()
        });
        let schedule = Schedule::delay(value, unit)?;
        let descriptor = JobDescriptor::new(name.clone(), schedule, task).with_options(options);
        self.register(name, descriptor).await
    }

    /// Register a recurring job, either by cron expression or by a
    /// `Schedule` built directly (e.g. from [`Schedule::delay`]).
    pub async fn run_every(
        &self,
        name: impl Into<String>,
        schedule: Schedule,
        task: Task,
        options: Option<JobOptions>,
    ) -> Result<ActivityHandle> {
        let name = name.into();
        let options = options.unwrap_or_else(|| self.default_options());
        let descriptor = JobDescriptor::new(name.clone(), schedule, task).with_options(options);
        self.register(name, descriptor).await
    }

    /// Register a job whose body is a plain argument-list function
    /// rather than a typed closure, normalizing the m/f/a convention
    /// (§6.2): `args` is substituted, entry-by-entry and by equality
    /// only, against [`SCHED_SENTINEL`]/[`SCHED_SENTINEL_ALIAS`] before
    /// every call.
    pub async fn run_job(
        &self,
        name: impl Into<String>,
        schedule: Schedule,
        args: Vec<serde_json::Value>,
        body: JobBody,
        options: Option<JobOptions>,
    ) -> Result<ActivityHandle> {
        let name = name.into();
        let options = options.unwrap_or_else(|| self.default_options());
        let task = match body {
            JobBody::Sync(mut f) => Task::Sync1(Box::new(move |scheduled_at| {
                let substituted = substitute_sentinel(&args, scheduled_at);
                f(substituted);
            })),
            JobBody::Async(mut f) => Task::Async1(Box::new(move |scheduled_at| {
                let substituted = substitute_sentinel(&args, scheduled_at);
                f(substituted)
            })),
        };
        let descriptor = JobDescriptor::new(name.clone(), schedule, task).with_options(options);
        self.register(name, descriptor).await
    }

    /// Replace a registered job's schedule, task, options and/or context
    /// in place (§4.4.2). Fields left `None` keep their current value.
    pub async fn update_job(
        &self,
        name: &str,
        schedule: Option<Schedule>,
        options: Option<JobOptions>,
        task: Option<Task>,
        context: Option<serde_json::Value>,
    ) -> Result<()> {
        let handle = self.lookup(name).await?;
        handle.reconfigure(schedule, options, task, context).await
    }

    /// Cancel a registered job. Unconditional, eventual, and idempotent:
    /// cancelling a name that is not (or no longer) registered is not an
    /// error, since the end state — no activity running under that name
    /// — is already what was asked for.
    pub async fn cancel(&self, name: &str) -> Result<()> {
        let mut activities = self.activities.write().await;
        if let Some(handle) = activities.remove(name) {
            handle.cancel().await?;
        }
        Ok(())
    }

    /// The next instant a registered job is due to fire, if any.
    pub async fn next_schedule(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lookup(name).await?.next_schedule())
    }

    /// The running measurement summary for a registered job.
    pub async fn stats(&self, name: &str) -> Result<Stats> {
        Ok(self.lookup(name).await?.stats())
    }

    async fn lookup(&self, name: &str) -> Result<ActivityHandle> {
        self.activities
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }
}
