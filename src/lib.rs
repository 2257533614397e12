//! Transactional PostgreSQL job queue.
//!
//! Jobs live in a single `gue_jobs` table; the database is the only source
//! of truth. A [`Client`] enqueues typed jobs and locks eligible ones with
//! `FOR UPDATE SKIP LOCKED`, holding the transaction open for the whole
//! lock-work-finalize cycle, so a crash anywhere releases the row back to
//! the queue and no two workers ever run the same job at once. A [`Worker`]
//! (or a [`WorkerPool`]) polls, dispatches to the handler registered for the
//! job's type, and deletes the row on success or reschedules it with
//! exponential backoff on failure.
//!
//! ```no_run
//! use gue::{Client, NewJob, WorkMap, Worker, work_fn};
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), gue::Error> {
//! let client = Client::new(pool);
//! client.enqueue(NewJob::new("SendInvoice").args_json(&42)?).await?;
//!
//! let work_map = WorkMap::from([(
//!     "SendInvoice".to_string(),
//!     work_fn(|job| async move {
//!         let invoice: u64 = job.args_json()?;
//!         println!("sending invoice {invoice}");
//!         Ok(())
//!     }),
//! )]);
//! Worker::new(client, work_map)
//!     .run(std::future::pending())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod errors;
pub mod job;
pub mod worker;

pub use backoff::{Backoff, default_exponential, exponential};
pub use client::Client;
pub use errors::{Error, ErrorKind};
pub use job::{
    JOB_PRIORITY_DEFAULT, JOB_PRIORITY_HIGH, JOB_PRIORITY_HIGHEST, JOB_PRIORITY_LOW,
    JOB_PRIORITY_LOWEST, Job, JobTx, NewJob,
};
pub use worker::{
    HookFunc, PollStrategy, WorkFunc, WorkMap, WorkResult, Worker, WorkerPool, hook_fn, work_fn,
};

/// Queue jobs are enqueued to and workers poll when none is configured.
pub const DEFAULT_QUEUE_NAME: &str = "";

pub(crate) fn random_string_id() -> String {
    use rand::Rng as _;

    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}
