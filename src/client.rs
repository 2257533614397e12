//! Enqueue and lock primitives over a PostgreSQL pool.
//!
//! Locking opens a transaction and selects one eligible row with
//! `FOR UPDATE SKIP LOCKED`; the returned [`Job`] keeps that transaction
//! open until it is finalized, so peers skip the row instead of blocking.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sqlx::Row as _;
use ulid::Ulid;

use crate::backoff::{Backoff, default_exponential};
use crate::errors::Error;
use crate::job::{Job, JobState, JobTx, NewJob};

const INSERT_JOB: &str = "INSERT INTO gue_jobs \
(job_id, queue, priority, run_at, job_type, args, created_at, updated_at) \
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

const LOCK_JOB: &str = "SELECT job_id, queue, priority, run_at, job_type, args, error_count, last_error \
FROM gue_jobs \
WHERE queue = $1 AND run_at <= $2 \
ORDER BY priority ASC \
LIMIT 1 FOR UPDATE SKIP LOCKED";

const LOCK_NEXT_SCHEDULED_JOB: &str = "SELECT job_id, queue, priority, run_at, job_type, args, error_count, last_error \
FROM gue_jobs \
WHERE queue = $1 AND run_at <= $2 \
ORDER BY run_at, priority ASC \
LIMIT 1 FOR UPDATE SKIP LOCKED";

const LOCK_JOB_BY_ID: &str = "SELECT job_id, queue, priority, run_at, job_type, args, error_count, last_error \
FROM gue_jobs \
WHERE job_id = $1 FOR UPDATE SKIP LOCKED";

const ENQUEUE_COUNTER: &str = "gue_client_enqueue";
const LOCK_JOB_COUNTER: &str = "gue_client_lock_job";

/// A handle for adding jobs to the queue and locking them for work.
///
/// Cloning is cheap; clones share the pool and the id entropy, so ids stay
/// monotonic across clones within the process.
#[derive(Clone)]
pub struct Client {
    pool: sqlx::PgPool,
    id: String,
    backoff: Backoff,
    entropy: Arc<Mutex<ulid::Generator>>,
}

impl Client {
    /// Create a client over the given connection pool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            id: crate::random_string_id(),
            backoff: default_exponential(),
            entropy: Arc::new(Mutex::new(ulid::Generator::new())),
        }
    }

    /// Override the generated client id used in log events.
    pub fn id(self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..self
        }
    }

    /// Override the backoff applied to jobs this client locks.
    pub fn backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }

    /// Add a job to the queue. Returns the generated id.
    pub async fn enqueue(&self, job: NewJob) -> Result<Ulid, Error> {
        self.exec_enqueue(job, &self.pool).await
    }

    /// Add a job to the queue within the scope of a caller-supplied
    /// transaction, so the job is committed or rolled back atomically with
    /// the caller's other changes. The caller commits or rolls back.
    pub async fn enqueue_tx<'c, E>(&self, job: NewJob, executor: E) -> Result<Ulid, Error>
    where
        E: sqlx::PgExecutor<'c>,
    {
        self.exec_enqueue(job, executor).await
    }

    async fn exec_enqueue<'c, E>(&self, job: NewJob, executor: E) -> Result<Ulid, Error>
    where
        E: sqlx::PgExecutor<'c>,
    {
        if job.job_type.is_empty() {
            return Err(Error::missing_type());
        }

        let now = Utc::now();
        let run_at = job.run_at.unwrap_or(now);
        let id = self.next_id()?;

        let inserted = sqlx::query(INSERT_JOB)
            .bind(id.to_string())
            .bind(&job.queue)
            .bind(job.priority)
            .bind(run_at)
            .bind(&job.job_type)
            .bind(&job.args)
            .bind(now)
            .bind(now)
            .execute(executor)
            .await;

        tracing::debug!(
            client_id = %self.id,
            queue = %job.queue,
            id = %id,
            success = inserted.is_ok(),
            "tried to enqueue a job"
        );
        metrics::counter!(
            ENQUEUE_COUNTER,
            "job-type" => job.job_type.clone(),
            "success" => inserted.is_ok().to_string()
        )
        .increment(1);

        inserted?;
        Ok(id)
    }

    /// Lock the next eligible job in `queue`, highest priority first.
    /// Returns `Ok(None)` when the queue has no eligible job.
    ///
    /// The returned job holds an open transaction; call [`Job::done`] or
    /// [`Job::error`] to release it.
    pub async fn lock_job(&self, queue: &str) -> Result<Option<Job>, Error> {
        self.exec_lock_job(LOCK_JOB, queue).await
    }

    /// Lock the next eligible job in `queue`, earliest `run_at` first, even
    /// when a higher-priority job is also eligible. Returns `Ok(None)` when
    /// the queue has no eligible job.
    pub async fn lock_next_scheduled_job(&self, queue: &str) -> Result<Option<Job>, Error> {
        self.exec_lock_job(LOCK_NEXT_SCHEDULED_JOB, queue).await
    }

    /// Lock a specific job regardless of its `run_at`.
    ///
    /// Skip-locked semantics make a row held by a peer indistinguishable
    /// from a missing one; both surface as [`ErrorKind::JobNotFound`].
    ///
    /// [`ErrorKind::JobNotFound`]: crate::errors::ErrorKind::JobNotFound
    pub async fn lock_job_by_id(&self, id: Ulid) -> Result<Job, Error> {
        let mut tx = self.begin_counted().await?;

        let row = sqlx::query(LOCK_JOB_BY_ID)
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await;

        match row {
            Ok(row) => self.lock_hit(row, tx).await,
            Err(sqlx::Error::RowNotFound) => {
                self.count_lock_miss();
                self.rollback_logged(tx).await;
                Err(Error::job_not_found(id))
            }
            Err(err) => {
                self.count_lock_miss();
                self.rollback_logged(tx).await;
                Err(err.into())
            }
        }
    }

    async fn exec_lock_job(&self, sql: &str, queue: &str) -> Result<Option<Job>, Error> {
        let mut tx = self.begin_counted().await?;

        let row = sqlx::query(sql)
            .bind(queue)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await;

        match row {
            Ok(row) => self.lock_hit(row, tx).await.map(Some),
            Err(sqlx::Error::RowNotFound) => {
                self.count_lock_miss();
                tx.rollback().await?;
                Ok(None)
            }
            Err(err) => {
                self.count_lock_miss();
                self.rollback_logged(tx).await;
                Err(err.into())
            }
        }
    }

    async fn begin_counted(&self) -> Result<JobTx, Error> {
        match self.pool.begin().await {
            Ok(tx) => Ok(tx),
            Err(err) => {
                self.count_lock_miss();
                Err(err.into())
            }
        }
    }

    async fn lock_hit(&self, row: sqlx::postgres::PgRow, tx: JobTx) -> Result<Job, Error> {
        let scanned = match scan_job(&row) {
            Ok(scanned) => scanned,
            Err(err) => {
                // A row we cannot decode is still a failed lock attempt;
                // release the row lock now rather than on the drop.
                self.count_lock_miss();
                self.rollback_logged(tx).await;
                return Err(err);
            }
        };

        let job = Job {
            id: scanned.id,
            queue: scanned.queue,
            priority: scanned.priority,
            run_at: scanned.run_at,
            job_type: scanned.job_type,
            args: scanned.args,
            error_count: scanned.error_count,
            last_error: scanned.last_error,
            backoff: Arc::clone(&self.backoff),
            state: tokio::sync::Mutex::new(JobState {
                tx: Some(tx),
                deleted: false,
            }),
        };

        metrics::counter!(
            LOCK_JOB_COUNTER,
            "job-type" => job.job_type.clone(),
            "success" => "true".to_string()
        )
        .increment(1);

        Ok(job)
    }

    fn count_lock_miss(&self) {
        metrics::counter!(
            LOCK_JOB_COUNTER,
            "job-type" => String::new(),
            "success" => "false".to_string()
        )
        .increment(1);
    }

    async fn rollback_logged(&self, tx: JobTx) {
        if let Err(err) = tx.rollback().await {
            tracing::error!(
                client_id = %self.id,
                error = %err,
                "failed to roll back a lock transaction"
            );
        }
    }

    fn next_id(&self) -> Result<Ulid, Error> {
        let mut entropy = match self.entropy.lock() {
            Ok(entropy) => entropy,
            Err(poisoned) => poisoned.into_inner(),
        };
        entropy.generate().map_err(Error::decode)
    }
}

struct ScannedJob {
    id: Ulid,
    queue: String,
    priority: i16,
    run_at: DateTime<Utc>,
    job_type: String,
    args: Vec<u8>,
    error_count: i32,
    last_error: Option<String>,
}

fn scan_job(row: &sqlx::postgres::PgRow) -> Result<ScannedJob, Error> {
    // job_id is canonical ULID text; scanning it as anything else is wrong
    // even on backends that store it compactly.
    let id: String = row.try_get("job_id")?;
    let id = Ulid::from_string(&id).map_err(Error::decode)?;

    Ok(ScannedJob {
        id,
        queue: row.try_get("queue")?,
        priority: row.try_get("priority")?,
        run_at: row.try_get("run_at")?,
        job_type: row.try_get("job_type")?,
        args: row.try_get("args")?,
        error_count: row.try_get("error_count")?,
        last_error: row.try_get("last_error")?,
    })
}
