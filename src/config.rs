use serde::{Deserialize, Serialize};

use crate::schedule::NonexistentTimeStrategy;

/// Process-wide defaults applied to a job's [`crate::job::JobOptions`]
/// whenever the caller doesn't supply its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerDefaults {
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    #[serde(default = "default_nonexistent_time_strategy")]
    pub default_nonexistent_time_strategy: NonexistentTimeStrategy,
    /// Bound on each activity's control mailbox (`cancel`/`update_job`
    /// signals), applied when the scheduler spawns each activity.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_timezone() -> String {
    "Etc/UTC".to_string()
}

fn default_nonexistent_time_strategy() -> NonexistentTimeStrategy {
    NonexistentTimeStrategy::Skip
}

fn default_mailbox_capacity() -> usize {
    64
}

impl Default for SchedulerDefaults {
    fn default() -> Self {
        Self {
            default_timezone: default_timezone(),
            default_nonexistent_time_strategy: default_nonexistent_time_strategy(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}
