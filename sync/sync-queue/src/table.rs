use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use record_store::{DirLock, lock_dir, read_json, write_json_atomic};

use crate::{Backoff, Error, Result, SyncTask, TaskClass, UniquenessPolicy};

/// The name of the file holding the task table within the sync directory.
pub const TASKS_JSON_FNAME: &str = "sync-tasks.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new task with this sequence number was added.
    Enqueued(u64),
    /// An existing task (this sequence number) already covers the request.
    Coalesced(u64),
}

#[derive(Default, Deserialize)]
struct TableFile {
    next_seq: u64,
    tasks: Vec<SyncTask>,
}

/// All pending sync tasks, optionally mirrored to disk after every change.
///
/// A persisted table holds a lock on its directory until dropped.
pub struct TaskTable {
    path: Option<PathBuf>,
    next_seq: u64,
    tasks: Vec<SyncTask>,
    _lock: Option<DirLock>,
}

impl TaskTable {
    /// A table which is not persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            next_seq: 0,
            tasks: Vec::new(),
            _lock: None,
        }
    }

    /// Open the table in `dirname`. Tasks which were running when the
    /// previous process ended are queued again.
    pub fn open<P: AsRef<Path>>(dirname: P) -> Result<Self> {
        let dirname = dirname.as_ref();
        std::fs::create_dir_all(dirname).map_err(|source| Error::Io {
            path: dirname.into(),
            source,
        })?;
        let lock = lock_dir(dirname)?;
        let path = dirname.join(TASKS_JSON_FNAME);
        let file: TableFile = read_json(&path)?.unwrap_or_default();
        let mut result = Self {
            path: Some(path),
            next_seq: file.next_seq,
            tasks: file.tasks,
            _lock: Some(lock),
        };
        let mut requeued = 0;
        for task in result.tasks.iter_mut().filter(|t| t.running) {
            task.running = false;
            requeued += 1;
        }
        if requeued > 0 {
            info!("re-queued {requeued} interrupted sync task(s)");
            result.persist()?;
        }
        // never reuse a sequence number
        if let Some(max) = result.tasks.iter().map(|t| t.seq).max() {
            result.next_seq = result.next_seq.max(max + 1);
        }
        Ok(result)
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let file = TableFileRef {
                next_seq: self.next_seq,
                tasks: &self.tasks,
            };
            write_json_atomic(path, &file)?;
        }
        Ok(())
    }

    /// Add a task for `class` according to its uniqueness policy.
    pub fn enqueue(
        &mut self,
        class: TaskClass,
        payload: Option<String>,
        not_before: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        match class.policy() {
            UniquenessPolicy::Coalesce | UniquenessPolicy::Singleton => {
                if let Some(existing) = self.tasks.iter().find(|t| t.key == class.key()) {
                    debug!("{class} request coalesced into task {}", existing.seq);
                    return Ok(EnqueueOutcome::Coalesced(existing.seq));
                }
            }
            UniquenessPolicy::Append => {}
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.push(SyncTask {
            seq,
            class,
            key: class.key().to_string(),
            attempts: 0,
            next_eligible: not_before,
            running: false,
            created_at: Utc::now(),
            payload,
        });
        if let Err(e) = self.persist() {
            self.tasks.pop();
            self.next_seq -= 1;
            return Err(e);
        }
        debug!("enqueued {class} task {seq}");
        Ok(EnqueueOutcome::Enqueued(seq))
    }

    /// The oldest task of `class`.
    pub fn head(&self, class: TaskClass) -> Option<&SyncTask> {
        self.tasks
            .iter()
            .filter(|t| t.class == class)
            .min_by_key(|t| t.seq)
    }

    pub fn get(&self, seq: u64) -> Option<&SyncTask> {
        self.tasks.iter().find(|t| t.seq == seq)
    }

    pub fn tasks(&self) -> &[SyncTask] {
        &self.tasks
    }

    pub fn count(&self, class: TaskClass) -> usize {
        self.tasks.iter().filter(|t| t.class == class).count()
    }

    fn update<F>(&mut self, seq: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut SyncTask),
    {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.seq == seq)
            .ok_or(Error::UnknownTask(seq))?;
        let orig = task.clone();
        f(task);
        if let Err(e) = self.persist() {
            if let Some(task) = self.tasks.iter_mut().find(|t| t.seq == seq) {
                *task = orig;
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn mark_running(&mut self, seq: u64) -> Result<()> {
        self.update(seq, |t| t.running = true)
    }

    /// Remove a finished task.
    pub fn complete(&mut self, seq: u64) -> Result<()> {
        let idx = self
            .tasks
            .iter()
            .position(|t| t.seq == seq)
            .ok_or(Error::UnknownTask(seq))?;
        let task = self.tasks.remove(idx);
        if let Err(e) = self.persist() {
            self.tasks.insert(idx, task);
            return Err(e);
        }
        Ok(())
    }

    /// Count a failed run and schedule the next one. Returns when the task
    /// becomes eligible again.
    pub fn retry(&mut self, seq: u64, backoff: &Backoff, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let mut at = now;
        self.update(seq, |t| {
            t.attempts = t.attempts.saturating_add(1);
            at = crate::after(now, backoff.delay(t.attempts));
            t.next_eligible = at;
            t.running = false;
        })?;
        Ok(at)
    }

    /// Queue the task again at `at` without counting an attempt.
    pub fn reschedule(&mut self, seq: u64, at: DateTime<Utc>) -> Result<()> {
        self.update(seq, |t| {
            t.next_eligible = at;
            t.running = false;
        })
    }
}

#[derive(Serialize)]
struct TableFileRef<'a> {
    next_seq: u64,
    tasks: &'a [SyncTask],
}
