use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kinds of background work, each drained by its own lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskClass {
    Upload,
    Delete,
    Cleanup,
}

impl TaskClass {
    pub const ALL: [TaskClass; 3] = [TaskClass::Upload, TaskClass::Delete, TaskClass::Cleanup];

    /// The uniqueness key under which tasks of this class are enqueued.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Delete => "delete",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn policy(&self) -> UniquenessPolicy {
        match self {
            Self::Upload => UniquenessPolicy::Coalesce,
            Self::Delete => UniquenessPolicy::Append,
            Self::Cleanup => UniquenessPolicy::Singleton,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Upload => 0,
            Self::Delete => 1,
            Self::Cleanup => 2,
        }
    }
}

impl std::fmt::Display for TaskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// What happens when a task is enqueued under a key which already has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniquenessPolicy {
    /// Drop the new request if a task is queued or running.
    Coalesce,
    /// Always add; tasks run in request order.
    Append,
    /// One recurring task which is rescheduled instead of removed.
    Singleton,
}

/// One unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    /// Monotonic sequence number, defines execution order within a class.
    pub seq: u64,
    pub class: TaskClass,
    pub key: String,
    /// Number of failed runs so far.
    pub attempts: u32,
    pub next_eligible: DateTime<Utc>,
    pub running: bool,
    pub created_at: DateTime<Utc>,
    /// For delete requests, the record which was soft deleted.
    #[serde(default)]
    pub payload: Option<String>,
}

/// Exponential backoff: `base * 2^(attempts-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// The delay before the next run after `attempts` failures.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}
