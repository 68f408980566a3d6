use thiserror::Error;

/// Errors produced by the scheduling engine and its façade.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{0}': {1}")]
    InvalidCron(String, String),

    #[error("invalid timezone '{0}': {1}")]
    InvalidTimezone(String, String),

    #[error("invalid repeat value: {0}")]
    InvalidRepeatValue(String),

    #[error("invalid delay unit '{0}'")]
    InvalidUnit(String),

    #[error("schedule evaluation failed: {0}")]
    ScheduleExhausted(String),

    #[error("task body panicked: {0}")]
    TaskPanicked(String),

    #[error("no activity registered for job name '{0}'")]
    NotFound(String),

    #[error("job '{0}' is already registered")]
    AlreadyExists(String),

    #[error("activity already terminated")]
    Terminated,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
