use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::job::{JobDescriptor, JobOptions, RepeatSpec, Task};
use crate::schedule::{next_fire, Schedule};
use crate::stats::Stats;
use crate::time_scale::TimeScale;

/// Coarse lifecycle state, reported through [`ActivityHandle`] for
/// introspection. The activity's internal loop distinguishes finer
/// detail (e.g. which signal woke it) but these four are what a caller
/// can observe from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityState {
    #[default]
    Created,
    Scheduling,
    Armed,
    Firing,
    Terminated,
}

/// Latest known next-fire instant and running stats for an activity,
/// published over a `watch` channel so introspection never blocks the
/// activity's own mailbox loop.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub state: ActivityState,
    pub next_schedule: Option<DateTime<Utc>>,
    pub stats: Stats,
    /// Opaque caller-supplied payload, carried through unexamined; never
    /// read by the engine itself (§3.1).
    pub context: serde_json::Value,
}

/// Messages the façade (or anything holding an [`ActivityHandle`]) may
/// send into a running activity's mailbox. The timer itself is not a
/// mailbox message — it is the other arm of the activity's `select!`,
/// which is how invariant I1 ("at most one outstanding timer") holds
/// without this module needing to track a timer token.
enum Signal {
    Reconfig {
        schedule: Option<Schedule>,
        options: Option<JobOptions>,
        task: Option<Task>,
        context: Option<serde_json::Value>,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel,
}

/// A cheaply cloneable reference to a running job activity.
#[derive(Clone)]
pub struct ActivityHandle {
    id: Uuid,
    name: String,
    mailbox: mpsc::Sender<Signal>,
    snapshot: watch::Receiver<Snapshot>,
}

impl ActivityHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The activity's most recently published next-fire instant, if it
    /// has one (an exhausted repeat budget or a terminated activity both
    /// report `None`).
    pub fn next_schedule(&self) -> Option<DateTime<Utc>> {
        self.snapshot.borrow().next_schedule
    }

    /// The activity's stats as of its last completed fire.
    pub fn stats(&self) -> Stats {
        self.snapshot.borrow().stats
    }

    pub fn state(&self) -> ActivityState {
        self.snapshot.borrow().state
    }

    /// The activity's current opaque context payload.
    pub fn context(&self) -> serde_json::Value {
        self.snapshot.borrow().context.clone()
    }

    /// Replace this activity's schedule, task, options and/or context.
    /// Any argument left `None` keeps its current value. Per §4.4.2 this
    /// is an atomic descriptor swap followed by Bootstrap re-entry: any
    /// timer already armed is torn down and the activity recomputes its
    /// next fire from the new schedule as though freshly constructed.
    pub async fn reconfigure(
        &self,
        schedule: Option<Schedule>,
        options: Option<JobOptions>,
        task: Option<Task>,
        context: Option<serde_json::Value>,
    ) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.mailbox
            .send(Signal::Reconfig {
                schedule,
                options,
                task,
                context,
                reply,
            })
            .await
            .map_err(|_| SchedulerError::Terminated)?;
        reply_rx.await.map_err(|_| SchedulerError::Terminated)?
    }

    /// Request cancellation. Unconditional, eventual, and idempotent: if
    /// the activity has already terminated, sending simply fails silently
    /// and this still returns `Ok(())` — cancellation is already achieved.
    pub async fn cancel(&self) -> Result<()> {
        let _ = self.mailbox.send(Signal::Cancel).await;
        Ok(())
    }
}

fn publish(
    tx: &watch::Sender<Snapshot>,
    state: ActivityState,
    next_schedule: Option<DateTime<Utc>>,
    stats: Stats,
    context: serde_json::Value,
) {
    let _ = tx.send(Snapshot {
        state,
        next_schedule,
        stats,
        context,
    });
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked with a non-string payload".to_string()
    }
}

/// Outcome of running one fire of the task body.
struct FireMeasurement {
    execution_time_us: f64,
    outcome: std::result::Result<(), String>,
}

fn measure<F: FnOnce() -> std::result::Result<(), String>>(
    start: tokio::time::Instant,
    body: F,
) -> FireMeasurement {
    let outcome = body();
    let execution_time_us = start.elapsed().as_secs_f64() * 1_000_000.0;
    FireMeasurement {
        execution_time_us,
        outcome,
    }
}

enum FireOutcome {
    Done(FireMeasurement),
    Spawned(JoinHandle<FireMeasurement>),
}

/// Invoke the task body once. Panics (sync) or panicking futures (async)
/// are caught and surfaced as `Err(message)` in the measurement instead
/// of unwinding through this function — unwinding across a `tokio::spawn`
/// boundary is not something a caller could otherwise observe or
/// supervise, so the activity translates it into a captured error value
/// instead.
///
/// When `overlap` is true and the task is async, the obtained future is
/// detached onto its own `tokio::spawn`ed task so a slow-running body
/// does not block the next scheduled fire — the boxed `FnMut` itself
/// only needs to be touched briefly, to produce the future, and the
/// future afterward owns everything it needs to run to completion on its
/// own. Sync task bodies have no such detachment point: a boxed `FnMut`
/// cannot be soundly invoked on a separate task without `Clone`/`'static`
/// ownership of the closure itself, so sync bodies always run to
/// completion inline regardless of `overlap`.
async fn fire_once(task: &mut Task, scheduled_at: DateTime<Utc>, overlap: bool) -> FireOutcome {
    let start = tokio::time::Instant::now();
    match task {
        Task::Sync0(f) => {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| f()));
            FireOutcome::Done(measure(start, || result.map_err(panic_message)))
        }
        Task::Sync1(f) => {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| f(scheduled_at)));
            FireOutcome::Done(measure(start, || result.map_err(panic_message)))
        }
        Task::Async0(f) => {
            let fut = f();
            if overlap {
                let handle = tokio::spawn(async move {
                    let result = AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_message);
                    measure(start, || result)
                });
                FireOutcome::Spawned(handle)
            } else {
                let result = AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_message);
                FireOutcome::Done(measure(start, || result))
            }
        }
        Task::Async1(f) => {
            let fut = f(scheduled_at);
            if overlap {
                let handle = tokio::spawn(async move {
                    let result = AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_message);
                    measure(start, || result)
                });
                FireOutcome::Spawned(handle)
            } else {
                let result = AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_message);
                FireOutcome::Done(measure(start, || result))
            }
        }
    }
}

/// Spawn a new job activity, returning a handle to it and the `JoinHandle`
/// of its driving task. The driving task's `Result` resolves `Err` only
/// when the task body panicked (§4.5); cron/timezone evaluation errors
/// terminate the activity normally (`Ok(())`), matching the failure model
/// table.
pub fn spawn_activity(
    descriptor: JobDescriptor,
    time_scale: Arc<dyn TimeScale>,
    mailbox_capacity: usize,
) -> (ActivityHandle, JoinHandle<Result<()>>) {
    let id = Uuid::now_v7();
    let name = descriptor.name.clone();
    let initial_context = descriptor.context.clone();
    let (mailbox_tx, mailbox_rx) = mpsc::channel(mailbox_capacity.max(1));
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
        state: ActivityState::Created,
        next_schedule: None,
        stats: Stats::new(),
        context: initial_context,
    });

    let handle = ActivityHandle {
        id,
        name: name.clone(),
        mailbox: mailbox_tx,
        snapshot: snapshot_rx,
    };

    let join = tokio::spawn(run_activity(
        id,
        name,
        descriptor,
        time_scale,
        mailbox_rx,
        snapshot_tx,
    ));

    (handle, join)
}

async fn run_activity(
    id: Uuid,
    name: String,
    descriptor: JobDescriptor,
    time_scale: Arc<dyn TimeScale>,
    mut mailbox: mpsc::Receiver<Signal>,
    snapshot_tx: watch::Sender<Snapshot>,
) -> Result<()> {
    let JobDescriptor {
        mut schedule,
        mut task,
        mut options,
        mut context,
        ..
    } = descriptor;

    let mut stats = Stats::new();
    let mut pending_run_once = options.run_once;
    let mut in_flight: FuturesUnordered<JoinHandle<FireMeasurement>> = FuturesUnordered::new();

    let mut tz = match options.resolve_timezone() {
        Ok(tz) => tz,
        Err(e) => {
            tracing::error!(job_id = %id, job_name = %name, error = %e, "invalid timezone at bootstrap");
            publish(&snapshot_tx, ActivityState::Terminated, None, stats, context);
            return Ok(());
        }
    };

    let mut scheduled_at = time_scale.now(tz).with_timezone(&Utc);

    'lifecycle: loop {
        publish(&snapshot_tx, ActivityState::Scheduling, None, stats, context.clone());
        tracing::debug!(job_id = %id, job_name = %name, "scheduling next fire");

        // §4.4.1: "if repeat is false or a non-positive integer ->
        // Terminated(normal)" — unless the Bootstrap run_once fire is
        // still pending, which happens regardless of the repeat budget.
        let repeat_exhausted = match options.repeat {
            RepeatSpec::Never => true,
            RepeatSpec::Times(remaining) => remaining == 0,
            RepeatSpec::Forever => false,
        };
        if repeat_exhausted && !pending_run_once {
            tracing::debug!(job_id = %id, job_name = %name, "repeat budget exhausted");
            break 'lifecycle;
        }

        let (next_instant, real_delay_ms, exact_real_delay_ms) = if pending_run_once {
            pending_run_once = false;
            (scheduled_at, 0u64, 0.0)
        } else {
            let now = time_scale.now(tz).with_timezone(&Utc);
            match next_fire(
                scheduled_at,
                now,
                &schedule,
                tz,
                options.nonexistent_time_strategy,
                time_scale.speedup(),
            ) {
                Ok(nf) => {
                    // Budget is spent the moment a fire is scheduled, not
                    // once it has run, so a mid-sequence schedule failure
                    // never "owes" the caller a fire it never committed to.
                    // The run_once bootstrap fire is additional to the
                    // budget and never charged against it (P3).
                    if let RepeatSpec::Times(remaining) = &mut options.repeat {
                        *remaining = remaining.saturating_sub(1);
                    }
                    (nf.next_instant, nf.real_delay_ms, nf.exact_real_delay_ms)
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, job_name = %name, error = %e, "schedule evaluation failed, terminating");
                    break 'lifecycle;
                }
            }
        };

        scheduled_at = next_instant;

        publish(
            &snapshot_tx,
            ActivityState::Armed,
            Some(scheduled_at),
            stats,
            context.clone(),
        );

        let arm_instant = tokio::time::Instant::now();
        let target = arm_instant + std::time::Duration::from_millis(real_delay_ms);

        let signal = tokio::select! {
            biased;
            Some(finished) = in_flight.next(), if !in_flight.is_empty() => {
                fold_measurement(&mut stats, finished);
                continue 'lifecycle;
            }
            _ = tokio::time::sleep_until(target) => None,
            maybe_signal = mailbox.recv() => Some(maybe_signal),
        };

        let signal = match signal {
            None => None, // timer fired
            Some(maybe_signal) => match maybe_signal {
                None => {
                    tracing::debug!(job_id = %id, job_name = %name, "mailbox closed, terminating");
                    break 'lifecycle;
                }
                Some(Signal::Cancel) => {
                    tracing::debug!(job_id = %id, job_name = %name, "cancelled while armed");
                    break 'lifecycle;
                }
                Some(reconfig @ Signal::Reconfig { .. }) => Some(reconfig),
            },
        };

        if let Some(Signal::Reconfig {
            schedule: new_schedule,
            options: new_options,
            task: new_task,
            context: new_context,
            reply,
        }) = signal
        {
            if let Some(s) = new_schedule {
                schedule = s;
            }
            if let Some(t) = new_task {
                task = t;
            }
            if let Some(o) = new_options {
                options = o;
            }
            if let Some(c) = new_context {
                context = c;
            }
            tz = match options.resolve_timezone() {
                Ok(tz) => tz,
                Err(e) => {
                    let _ = reply.send(Err(e));
                    break 'lifecycle;
                }
            };
            pending_run_once = options.run_once;
            scheduled_at = time_scale.now(tz).with_timezone(&Utc);
            let _ = reply.send(Ok(()));
            tracing::debug!(job_id = %id, job_name = %name, "reconfigured, re-entering bootstrap");
            continue 'lifecycle;
        }

        // Timer fired: Firing state. Both metrics below are recorded only
        // once a fire is actually committed to — a Cancel/Reconfig that
        // intercepts the timer (handled above) must leave stats untouched,
        // so quantization_error_us is deferred this far rather than
        // recorded as soon as it's computed at schedule time (P4).
        let quantization_error_us = (exact_real_delay_ms - real_delay_ms as f64) * 1_000.0;
        stats.record_quantization_error_us(quantization_error_us.abs());

        publish(&snapshot_tx, ActivityState::Firing, Some(scheduled_at), stats, context.clone());
        let actual_wake = tokio::time::Instant::now();
        let scheduling_delay_us = actual_wake.saturating_duration_since(target).as_secs_f64() * 1_000_000.0;
        stats.record_scheduling_delay_us(scheduling_delay_us);

        match fire_once(&mut task, scheduled_at, options.overlap).await {
            FireOutcome::Spawned(handle) => {
                in_flight.push(handle);
            }
            FireOutcome::Done(measurement) => {
                if let Some(panicked) = fold_and_check_panic(&mut stats, measurement) {
                    tracing::error!(job_id = %id, job_name = %name, error = %panicked, "task panicked");
                    publish(&snapshot_tx, ActivityState::Terminated, None, stats, context);
                    return Err(SchedulerError::TaskPanicked(panicked));
                }
            }
        }
    }

    // Drain any still-running overlapped fires before terminating so a
    // panic in one of them is still observed rather than silently lost.
    while let Some(finished) = in_flight.next().await {
        if let Some(panicked) = fold_and_check_panic(&mut stats, unwrap_join(finished)) {
            tracing::error!(job_id = %id, job_name = %name, error = %panicked, "task panicked during drain");
            publish(&snapshot_tx, ActivityState::Terminated, None, stats, context);
            return Err(SchedulerError::TaskPanicked(panicked));
        }
    }

    publish(&snapshot_tx, ActivityState::Terminated, None, stats, context);
    Ok(())
}

fn unwrap_join(result: std::result::Result<FireMeasurement, tokio::task::JoinError>) -> FireMeasurement {
    match result {
        Ok(m) => m,
        Err(e) => FireMeasurement {
            execution_time_us: 0.0,
            outcome: Err(format!("task join error: {e}")),
        },
    }
}

fn fold_measurement(stats: &mut Stats, result: std::result::Result<FireMeasurement, tokio::task::JoinError>) {
    let measurement = unwrap_join(result);
    stats.record_execution_time_us(measurement.execution_time_us);
    if let Err(e) = measurement.outcome {
        tracing::error!(error = %e, "overlapped task fire failed");
    }
}

fn fold_and_check_panic(stats: &mut Stats, measurement: FireMeasurement) -> Option<String> {
    stats.record_execution_time_us(measurement.execution_time_us);
    measurement.outcome.err()
}
