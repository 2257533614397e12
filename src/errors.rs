//! Crate-wide error type.
//!
//! One `Error` carrying an [`ErrorKind`] plus the boxed cause, so callers can
//! branch on the kind without losing the underlying driver error.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categorization of failures produced by the queue.
pub enum ErrorKind {
    /// A job was enqueued without a type.
    MissingType,
    /// An error was returned by the database layer.
    Database,
    /// Id or payload encoding/decoding failed.
    Decode,
    /// `lock_job_by_id` found no row (missing, or locked by a peer).
    JobNotFound,
    /// A locked job has no handler registered for its type.
    UnknownType,
    /// A handler returned an error.
    Handler,
    /// A handler panicked.
    Unwind,
    /// Finalizing a job failed in both the row update and the commit.
    Finalize,
    /// `run` was called on a worker or pool that is already running.
    AlreadyRunning,
}

#[derive(Debug)]
/// Error type returned by all queue operations.
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl Error {
    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn missing_type() -> Self {
        Self {
            kind: ErrorKind::MissingType,
            inner: Box::new(Message("job type must be specified".into())),
        }
    }

    pub(crate) fn already_running(what: &'static str) -> Self {
        Self {
            kind: ErrorKind::AlreadyRunning,
            inner: Box::new(Message(format!("{what} is already running").into())),
        }
    }

    pub(crate) fn job_not_found(id: ulid::Ulid) -> Self {
        Self {
            kind: ErrorKind::JobNotFound,
            inner: Box::new(Message(
                format!("no job found with id {id} (missing or locked by a peer)").into(),
            )),
        }
    }

    pub(crate) fn unknown_type(msg: String) -> Self {
        Self {
            kind: ErrorKind::UnknownType,
            inner: Box::new(Message(msg.into())),
        }
    }

    pub(crate) fn handler(cause: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Self {
            kind: ErrorKind::Handler,
            inner: cause,
        }
    }

    pub(crate) fn unwind(msg: String) -> Self {
        Self {
            kind: ErrorKind::Unwind,
            inner: Box::new(Message(msg.into())),
        }
    }

    pub(crate) fn decode(cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            kind: ErrorKind::Decode,
            inner: Box::new(cause),
        }
    }

    pub(crate) fn finalize(original: Error, commit: Error) -> Self {
        Self {
            kind: ErrorKind::Finalize,
            inner: Box::new(FinalizeError { original, commit }),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            kind: ErrorKind::Database,
            inner: Box::new(value),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Decode,
            inner: Box::new(value),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct Message(std::borrow::Cow<'static, str>);

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

#[derive(Debug)]
struct FinalizeError {
    original: Error,
    commit: Error,
}

impl std::fmt::Display for FinalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to mark job as done (original error: {}): {}",
            self.original, self.commit
        )
    }
}

impl std::error::Error for FinalizeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.commit)
    }
}
