//! One-shot delayed jobs with bounded retry, used to fire poll closes without
//! any inbound request. Anything that can run a closure once at a given time
//! satisfies [`Scheduler`]; the in-process implementation spawns one timer
//! task per job. There is no cancel API: a registered job either fires or
//! outlives the process.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Re-invokable unit the scheduler fires; reports failure so the scheduler
/// can apply its bounded retry.
pub type Job = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct JobId(pub Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

pub trait Scheduler: Send + Sync {
    /// Registers `job` to run once at `at` (immediately if already past),
    /// retried up to `retries` more times on failure, then abandoned.
    fn schedule(&self, at: DateTime<Utc>, retries: u32, job: Job) -> Result<JobId>;
}

pub struct TimerScheduler {
    backoff: Duration,
    jobs: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

impl TimerScheduler {
    pub fn new(backoff: Duration) -> Self {
        Self {
            backoff,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// A registered job that has not run to completion yet.
    pub fn is_pending(&self, id: JobId) -> bool {
        self.jobs
            .lock()
            .unwrap()
            .get(&id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Scheduler for TimerScheduler {
    fn schedule(&self, at: DateTime<Utc>, retries: u32, job: Job) -> Result<JobId> {
        let id = JobId::new();
        let backoff = self.backoff;
        let handle = tokio::spawn(async move {
            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                match job().await {
                    Ok(()) => {
                        debug!(job = %id.0, attempt, "closing job completed");
                        return;
                    }
                    Err(err) => {
                        warn!(job = %id.0, attempt, error = %err, "closing job failed");
                        if attempt > retries {
                            warn!(job = %id.0, attempt, "closing job abandoned");
                            return;
                        }
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        });
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| Error::Scheduler("job table poisoned".to_owned()))?;
        jobs.insert(id, handle);
        Ok(id)
    }
}
