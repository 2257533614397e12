//! Poll-execute worker loop, hooks, and the worker pool.
//!
//! A [`Worker`] repeatedly locks one eligible job, dispatches it to the
//! handler registered for its type, and finalizes the outcome: delete on
//! success, reschedule with backoff on failure. Handler panics are rescued
//! and recorded; they never take the worker down. A [`WorkerPool`] fans the
//! same loop out over several workers sharing one client.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt as _;
use futures::future::{BoxFuture, join_all};

use crate::client::Client;
use crate::errors::Error;
use crate::job::Job;

/// Outcome of a handler invocation.
pub type WorkResult = Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;

/// A boxed handler bound to a job type.
pub type WorkFunc = Arc<dyn Fn(Arc<Job>) -> BoxFuture<'static, WorkResult> + Send + Sync>;

/// Maps job types to their handlers. Fixed at worker construction; a locked
/// job whose type is missing here takes the unknown-type path.
pub type WorkMap = HashMap<String, WorkFunc>;

/// A lifecycle notification callback.
///
/// Hooks observe; they cannot mutate the job or short-circuit processing.
/// Depending on the lifecycle point, the job or the error may be absent.
pub type HookFunc = Arc<dyn Fn(Option<&Job>, Option<&Error>) + Send + Sync>;

/// Box an async closure as a [`WorkFunc`].
pub fn work_fn<F, Fut>(f: F) -> WorkFunc
where
    F: Fn(Arc<Job>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    Arc::new(move |job| f(job).boxed())
}

/// Box a closure as a [`HookFunc`].
pub fn hook_fn<F>(f: F) -> HookFunc
where
    F: Fn(Option<&Job>, Option<&Error>) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Ordering used when a worker selects the next eligible job.
pub enum PollStrategy {
    /// Highest priority first (`ORDER BY priority`), even when an earlier
    /// scheduled job is eligible.
    #[default]
    Priority,
    /// Earliest scheduled first (`ORDER BY run_at, priority`).
    RunAt,
}

const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// A single poll-execute loop over one queue.
pub struct Worker {
    client: Client,
    queue: String,
    work_map: WorkMap,
    interval: std::time::Duration,
    id: String,
    poll_strategy: PollStrategy,
    running: AtomicBool,
    hooks_job_locked: Vec<HookFunc>,
    hooks_unknown_job_type: Vec<HookFunc>,
    hooks_job_done: Vec<HookFunc>,
}

impl Worker {
    /// Create a worker over the default queue with a 5s idle poll interval.
    pub fn new(client: Client, work_map: WorkMap) -> Self {
        Self {
            client,
            queue: crate::DEFAULT_QUEUE_NAME.to_string(),
            work_map,
            interval: DEFAULT_POLL_INTERVAL,
            id: crate::random_string_id(),
            poll_strategy: PollStrategy::default(),
            running: AtomicBool::new(false),
            hooks_job_locked: Vec::new(),
            hooks_unknown_job_type: Vec::new(),
            hooks_job_done: Vec::new(),
        }
    }

    /// Poll a named queue instead of the default one.
    pub fn queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..self
        }
    }

    /// Set the sleep between polls when the queue is empty.
    pub fn interval(self, interval: std::time::Duration) -> Self {
        Self { interval, ..self }
    }

    /// Override the generated worker id used in log events.
    pub fn id(self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..self
        }
    }

    /// Choose the ordering used to select the next job.
    pub fn poll_strategy(self, poll_strategy: PollStrategy) -> Self {
        Self {
            poll_strategy,
            ..self
        }
    }

    /// Hooks fired right after a lock attempt returned a job or an error.
    pub fn hooks_job_locked(self, hooks: Vec<HookFunc>) -> Self {
        Self {
            hooks_job_locked: hooks,
            ..self
        }
    }

    /// Hooks fired when a locked job has no registered handler. No job-done
    /// hooks follow for such a job.
    pub fn hooks_unknown_job_type(self, hooks: Vec<HookFunc>) -> Self {
        Self {
            hooks_unknown_job_type: hooks,
            ..self
        }
    }

    /// Hooks fired after a job was worked, with the handler error if any.
    pub fn hooks_job_done(self, hooks: Vec<HookFunc>) -> Self {
        Self {
            hooks_job_done: hooks,
            ..self
        }
    }

    /// Whether the worker is currently inside [`Worker::run`].
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one poll-execute cycle. Returns `false` only when no eligible job
    /// was found; lock errors and handler failures still count as work done.
    pub async fn work_one(&self) -> bool {
        let locked = match self.poll_strategy {
            PollStrategy::Priority => self.client.lock_job(&self.queue).await,
            PollStrategy::RunAt => self.client.lock_next_scheduled_job(&self.queue).await,
        };

        let job = match locked {
            Err(err) => {
                tracing::error!(worker_id = %self.id, error = %err, "worker failed to lock a job");
                self.fire_hooks(&self.hooks_job_locked, None, Some(&err));
                return true;
            }
            Ok(None) => return false,
            Ok(Some(job)) => Arc::new(job),
        };
        self.fire_hooks(&self.hooks_job_locked, Some(&*job), None);

        tracing::debug!(worker_id = %self.id, id = %job.id, job_type = %job.job_type, "locked a job");

        let Some(work_func) = self.work_map.get(&job.job_type) else {
            self.work_one_unknown_type(&job).await;
            return true;
        };

        match AssertUnwindSafe(work_func(Arc::clone(&job))).catch_unwind().await {
            Ok(Ok(())) => {
                if let Err(err) = job.delete().await {
                    tracing::error!(worker_id = %self.id, id = %job.id, error = %err, "failed to delete a finished job");
                }
                if let Err(err) = job.done().await {
                    tracing::error!(worker_id = %self.id, id = %job.id, error = %err, "failed to commit a finished job");
                }
                tracing::debug!(worker_id = %self.id, id = %job.id, "job finished");
                self.fire_hooks(&self.hooks_job_done, Some(&*job), None);
            }
            Ok(Err(cause)) => {
                let err = Error::handler(cause);
                tracing::error!(worker_id = %self.id, id = %job.id, error = %err, "job failed");
                self.mark_job_error(&job, &err.to_string()).await;
                self.fire_hooks(&self.hooks_job_done, Some(&*job), Some(&err));
            }
            Err(panic) => {
                let msg = format!(
                    "{}\n{}",
                    panic_message(panic.as_ref()),
                    std::backtrace::Backtrace::force_capture()
                );
                tracing::error!(worker_id = %self.id, id = %job.id, panic = %panic_message(panic.as_ref()), "job handler panicked");
                self.mark_job_error(&job, &msg).await;
                let err = Error::unwind(msg);
                self.fire_hooks(&self.hooks_job_done, Some(&*job), Some(&err));
            }
        }

        true
    }

    async fn work_one_unknown_type(&self, job: &Job) {
        let msg = format!("unknown job type: {:?}", job.job_type);
        tracing::error!(worker_id = %self.id, id = %job.id, job_type = %job.job_type, "locked a job with an unknown type");
        self.mark_job_error(job, &msg).await;
        let err = Error::unknown_type(msg);
        self.fire_hooks(&self.hooks_unknown_job_type, Some(job), Some(&err));
    }

    async fn mark_job_error(&self, job: &Job, msg: &str) {
        if let Err(err) = job.error(msg).await {
            tracing::error!(worker_id = %self.id, id = %job.id, error = %err, "failed to mark a job as errored");
        }
    }

    fn fire_hooks(&self, hooks: &[HookFunc], job: Option<&Job>, err: Option<&Error>) {
        for hook in hooks {
            // A hook is a notification; one that panics is rescued so the
            // cycle keeps going.
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(job, err))).is_err() {
                tracing::error!(worker_id = %self.id, "lifecycle hook panicked");
            }
        }
    }

    /// Run the poll-execute loop until `shutdown` resolves, then return
    /// `Ok(())`. While jobs are available the loop is tight; when the queue
    /// is empty it sleeps for the configured interval. Fails with
    /// `AlreadyRunning` when the worker is already inside `run`.
    ///
    /// A job in flight when `shutdown` resolves is worked and finalized
    /// before the loop exits.
    pub async fn run<S>(&self, shutdown: S) -> Result<(), Error>
    where
        S: Future<Output = ()> + Send,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::already_running("worker"));
        }

        tracing::info!(worker_id = %self.id, queue = %self.queue, "worker started");
        self.run_loop(shutdown).await;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(worker_id = %self.id, "worker stopped");

        Ok(())
    }

    async fn run_loop<S>(&self, shutdown: S)
    where
        S: Future<Output = ()> + Send,
    {
        let shutdown = shutdown.fuse();
        futures::pin_mut!(shutdown);

        loop {
            if futures::poll!(&mut shutdown).is_ready() {
                return;
            }

            if self.work_one().await {
                // Drain bursts without idling between jobs.
                continue;
            }

            futures::select_biased! {
                _ = &mut shutdown => return,
                _ = futures_timer::Delay::new(self.interval).fuse() => {}
            }
        }
    }
}

/// A fixed-size group of workers sharing one client and configuration.
pub struct WorkerPool {
    workers: Vec<Worker>,
    id: String,
    running: AtomicBool,
}

impl WorkerPool {
    /// Create `count` workers sharing `client` and `work_map`.
    pub fn new(client: Client, work_map: WorkMap, count: usize) -> Self {
        let id = crate::random_string_id();
        let workers = (0..count)
            .map(|n| {
                Worker::new(client.clone(), work_map.clone()).id(format!("{id}/worker-{n}"))
            })
            .collect();

        Self {
            workers,
            id,
            running: AtomicBool::new(false),
        }
    }

    /// Point every worker at a named queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        self.workers = self
            .workers
            .into_iter()
            .map(|w| w.queue(queue.clone()))
            .collect();
        self
    }

    /// Set every worker's idle poll interval.
    pub fn interval(mut self, interval: std::time::Duration) -> Self {
        self.workers = self
            .workers
            .into_iter()
            .map(|w| w.interval(interval))
            .collect();
        self
    }

    /// Override the pool id; member ids derive from it.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self.workers = self
            .workers
            .into_iter()
            .enumerate()
            .map(|(n, w)| {
                let id = format!("{}/worker-{n}", self.id);
                w.id(id)
            })
            .collect();
        self
    }

    /// Set every worker's poll strategy.
    pub fn poll_strategy(mut self, poll_strategy: PollStrategy) -> Self {
        self.workers = self
            .workers
            .into_iter()
            .map(|w| w.poll_strategy(poll_strategy))
            .collect();
        self
    }

    /// Set every worker's job-locked hooks.
    pub fn hooks_job_locked(mut self, hooks: Vec<HookFunc>) -> Self {
        self.workers = self
            .workers
            .into_iter()
            .map(|w| w.hooks_job_locked(hooks.clone()))
            .collect();
        self
    }

    /// Set every worker's unknown-job-type hooks.
    pub fn hooks_unknown_job_type(mut self, hooks: Vec<HookFunc>) -> Self {
        self.workers = self
            .workers
            .into_iter()
            .map(|w| w.hooks_unknown_job_type(hooks.clone()))
            .collect();
        self
    }

    /// Set every worker's job-done hooks.
    pub fn hooks_job_done(mut self, hooks: Vec<HookFunc>) -> Self {
        self.workers = self
            .workers
            .into_iter()
            .map(|w| w.hooks_job_done(hooks.clone()))
            .collect();
        self
    }

    /// The pool's workers, in id order.
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Whether the pool is currently inside [`WorkerPool::run`].
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one cycle on one member worker. Intended for tests.
    pub async fn work_one(&self) -> bool {
        match self.workers.first() {
            Some(worker) => worker.work_one().await,
            None => false,
        }
    }

    /// Run every worker until `shutdown` resolves, wait for all of them to
    /// exit, and return the first error. Fails with `AlreadyRunning` when
    /// the pool is already inside `run`.
    pub async fn run<S>(&self, shutdown: S) -> Result<(), Error>
    where
        S: Future<Output = ()> + Send,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::already_running("worker pool"));
        }

        tracing::info!(pool_id = %self.id, workers = self.workers.len(), "worker pool started");
        let shutdown = shutdown.shared();
        let results = join_all(self.workers.iter().map(|w| w.run(shutdown.clone()))).await;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(pool_id = %self.id, "worker pool stopped");

        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_worker(work_map: WorkMap) -> Worker {
        let pool = sqlx::PgPool::connect_lazy("postgres://gue@localhost/gue").unwrap();
        Worker::new(Client::new(pool), work_map)
    }

    #[test]
    fn panic_message_extracts_common_payloads() {
        let caught =
            std::panic::catch_unwind(|| panic!("the panic msg")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "the panic msg");

        let caught =
            std::panic::catch_unwind(|| panic!("the panic msg {}", 1)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "the panic msg 1");

        let caught = std::panic::catch_unwind(|| std::panic::panic_any(42_u8)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "unknown panic payload");
    }

    #[test]
    fn hook_panics_are_rescued() {
        let worker = lazy_worker(WorkMap::new());
        let hooks = vec![
            hook_fn(|_, _| panic!("misbehaving hook")),
            hook_fn(|job, err| {
                assert!(job.is_none());
                assert!(err.is_none());
            }),
        ];

        // Both hooks fire; the panicking one must not unwind out of the
        // dispatch.
        worker.fire_hooks(&hooks, None, None);
    }

    #[tokio::test]
    async fn run_exits_cleanly_on_resolved_shutdown() {
        let worker = lazy_worker(WorkMap::new());

        worker.run(std::future::ready(())).await.unwrap();
        assert!(!worker.is_running());
    }

    #[test]
    fn pool_derives_worker_ids() {
        let pool = sqlx::PgPool::connect_lazy("postgres://gue@localhost/gue").unwrap();
        let pool = WorkerPool::new(Client::new(pool), WorkMap::new(), 2).id("pool");

        let ids: Vec<&str> = pool.workers().iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, ["pool/worker-0", "pool/worker-1"]);
    }
}
