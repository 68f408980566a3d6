use std::time::Duration as StdDuration;

use job_scheduler_core::{JobOptions, RepeatSpec, Scheduler, Schedule, Task, Unit};

/// Small end-to-end demonstration: registers a cron job and a fixed
/// interval job against the real system clock, lets them fire a couple
/// of times, then prints each one's running stats and cancels both.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("debug").init();

    let scheduler = Scheduler::with_real_time();

    scheduler
        .run_every(
            "heartbeat",
            Schedule::delay(1, Unit::Seconds)?,
            Task::Sync1(Box::new(|scheduled_at| {
                tracing::info!(%scheduled_at, "heartbeat fired");
            })),
            Some(JobOptions {
                repeat: RepeatSpec::Times(3),
                ..JobOptions::default()
            }),
        )
        .await?;

    scheduler
        .run_every(
            "midnight-report",
            Schedule::cron("0 0 * * *")?,
            Task::Async0(Box::new(|| {
                Box::pin(async move {
                    tracing::info!("midnight report would run here");
                })
            })),
            None,
        )
        .await?;

    tokio::time::sleep(StdDuration::from_secs(4)).await;

    if let Ok(stats) = scheduler.stats("heartbeat").await {
        println!("heartbeat stats: {stats:?}");
    }
    if let Ok(next) = scheduler.next_schedule("midnight-report").await {
        println!("midnight-report next fire: {next:?}");
    }

    scheduler.cancel("heartbeat").await?;
    scheduler.cancel("midnight-report").await?;

    Ok(())
}
