//! Job descriptor and the locked job handle.
//!
//! A [`NewJob`] describes work to enqueue. A [`Job`] is handed out by the
//! client with an open database transaction bound to it; the transaction is
//! the row lock, so the handle must be finalized with [`Job::done`] or
//! [`Job::error`] to release it.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use ulid::Ulid;

use crate::backoff::Backoff;
use crate::errors::Error;

/// Transaction a locked job is bound to.
pub type JobTx = sqlx::Transaction<'static, sqlx::Postgres>;

/// Highest priority a job can carry. Lower values run first.
pub const JOB_PRIORITY_HIGHEST: i16 = i16::MIN;
/// Higher-than-default priority.
pub const JOB_PRIORITY_HIGH: i16 = -16384;
/// The priority jobs are enqueued with by default.
pub const JOB_PRIORITY_DEFAULT: i16 = 0;
/// Lower-than-default priority.
pub const JOB_PRIORITY_LOW: i16 = 16384;
/// Lowest priority a job can carry.
pub const JOB_PRIORITY_LOWEST: i16 = i16::MAX;

const DELETE_JOB: &str = "DELETE FROM gue_jobs WHERE job_id = $1";

const MARK_JOB_ERROR: &str = "UPDATE gue_jobs \
SET error_count = $1, run_at = $2, last_error = $3, updated_at = $4 \
WHERE job_id = $5";

/// Descriptor for a job to be enqueued.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) job_type: String,
    pub(crate) queue: String,
    pub(crate) priority: i16,
    pub(crate) run_at: Option<DateTime<Utc>>,
    pub(crate) args: Vec<u8>,
}

impl NewJob {
    /// Create a descriptor for `job_type`, targeting the default queue with
    /// default priority, immediate execution, and an empty payload.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            queue: crate::DEFAULT_QUEUE_NAME.to_string(),
            priority: JOB_PRIORITY_DEFAULT,
            run_at: None,
            args: Vec::new(),
        }
    }

    /// Target a named queue instead of the default one.
    pub fn queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..self
        }
    }

    /// Set the priority. Lower values run first.
    pub fn priority(self, priority: i16) -> Self {
        Self { priority, ..self }
    }

    /// Delay execution until `run_at`.
    pub fn run_at(self, run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: Some(run_at),
            ..self
        }
    }

    /// Attach a raw payload.
    pub fn args(self, args: impl Into<Vec<u8>>) -> Self {
        Self {
            args: args.into(),
            ..self
        }
    }

    /// Attach a payload serialized as JSON.
    pub fn args_json<T: Serialize>(self, args: &T) -> Result<Self, Error> {
        Ok(Self {
            args: serde_json::to_vec(args)?,
            ..self
        })
    }
}

pub(crate) struct JobState {
    pub(crate) tx: Option<JobTx>,
    pub(crate) deleted: bool,
}

/// A locked job, bound to the open transaction that holds its row lock.
///
/// Exactly one of [`Job::done`] or [`Job::error`] should complete the handle;
/// both are idempotent. Workers obtained from this crate finalize the jobs
/// they lock, so handlers never need to call these themselves.
impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("priority", &self.priority)
            .field("run_at", &self.run_at)
            .field("job_type", &self.job_type)
            .field("args", &self.args)
            .field("error_count", &self.error_count)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

pub struct Job {
    /// Unique, time-sortable id of the job.
    pub id: Ulid,
    /// Queue the job belongs to.
    pub queue: String,
    /// Priority; lower values run first.
    pub priority: i16,
    /// Earliest execution time.
    pub run_at: DateTime<Utc>,
    /// Dispatch key into the worker's handler map.
    pub job_type: String,
    /// Raw payload.
    pub args: Vec<u8>,
    /// Number of times the job has already failed.
    pub error_count: i32,
    /// Failure message of the last errored run, if any.
    pub last_error: Option<String>,

    pub(crate) backoff: Backoff,
    pub(crate) state: Mutex<JobState>,
}

impl Job {
    /// Deserialize the payload as JSON.
    pub fn args_json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.args)?)
    }

    /// Borrow the transaction the job is locked to, so handler writes commit
    /// or roll back atomically with job completion. Returns `None` once the
    /// job is finalized.
    ///
    /// The guard holds the handle lock; drop it before calling
    /// [`Job::done`], [`Job::error`], or [`Job::delete`].
    pub async fn tx(&self) -> Option<MappedMutexGuard<'_, JobTx>> {
        let state = self.state.lock().await;
        MutexGuard::try_map(state, |s| s.tx.as_mut()).ok()
    }

    /// Delete the job's row. Idempotent; the deletion becomes durable on
    /// [`Job::done`].
    pub async fn delete(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        self.delete_locked(&mut state).await
    }

    async fn delete_locked(&self, state: &mut JobState) -> Result<(), Error> {
        if state.deleted {
            return Ok(());
        }
        let Some(tx) = state.tx.as_mut() else {
            return Ok(());
        };

        sqlx::query(DELETE_JOB)
            .bind(self.id.to_string())
            .execute(&mut **tx)
            .await?;

        state.deleted = true;
        Ok(())
    }

    /// Commit the bound transaction, releasing the row lock. Idempotent.
    pub async fn done(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        self.done_locked(&mut state).await
    }

    async fn done_locked(&self, state: &mut JobState) -> Result<(), Error> {
        let Some(tx) = state.tx.take() else {
            // already finalized
            return Ok(());
        };

        tx.commit().await?;
        Ok(())
    }

    /// Record a failed run: increment the error count, store `msg` as the
    /// last error, and reschedule per the client's backoff. A backoff of
    /// `None` discards the job instead. The transaction is committed in all
    /// cases, so a separate [`Job::done`] is not required.
    pub async fn error(&self, msg: &str) -> Result<(), Error> {
        let mut state = self.state.lock().await;

        let attempts = self.error_count + 1;
        let marked = match (self.backoff)(attempts) {
            None => {
                tracing::info!(
                    job_type = %self.job_type,
                    queue = %self.queue,
                    error_count = attempts,
                    "backoff discarded the job, deleting it"
                );
                self.delete_locked(&mut state).await
            }
            Some(delay) => self.mark_error_locked(&mut state, attempts, delay, msg).await,
        };

        let committed = self.done_locked(&mut state).await;
        match (marked, committed) {
            (marked, Ok(())) => marked,
            (Ok(()), Err(commit)) => Err(commit),
            (Err(original), Err(commit)) => Err(Error::finalize(original, commit)),
        }
    }

    async fn mark_error_locked(
        &self,
        state: &mut JobState,
        attempts: i32,
        delay: std::time::Duration,
        msg: &str,
    ) -> Result<(), Error> {
        let Some(tx) = state.tx.as_mut() else {
            return Ok(());
        };

        let now = Utc::now();
        let delay = chrono::TimeDelta::from_std(delay).unwrap_or(chrono::TimeDelta::MAX);
        let run_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);

        sqlx::query(MARK_JOB_ERROR)
            .bind(attempts)
            .bind(run_at)
            .bind(msg)
            .bind(now)
            .bind(self.id.to_string())
            .execute(&mut **tx)
            .await?;

        Ok(())
    }
}
