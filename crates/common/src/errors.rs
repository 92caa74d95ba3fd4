// Error taxonomy shared by the substrate collaborator interface, the
// reconciler and the allocation engine. Call sites match on `kind()` instead
// of string-sniffing, the way the teacher wraps transport errors with
// `anyhow::Context` but still needs typed branches for retry decisions.
use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum SubstrateError {
    /// The object disappeared. Usually benign (drop the work item) or a
    /// signal to recreate (pod missing when expected).
    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotent creation target already exists; callers should treat this
    /// as success.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The substrate rejected the spec outright. Not retryable.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Optimistic-concurrency loss (stale resource version). Retryable with
    /// backoff.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network error, 5xx, or timeout talking to the substrate. Retryable
    /// with rate-limited backoff.
    #[error("transient error: {0}")]
    Transient(String),
}

impl SubstrateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubstrateError::NotFound(_) => ErrorKind::NotFound,
            SubstrateError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SubstrateError::Invalid(_) => ErrorKind::Invalid,
            SubstrateError::Conflict(_) => ErrorKind::Conflict,
            SubstrateError::Transient(_) => ErrorKind::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Invalid,
    Conflict,
    Transient,
}

/// Outcome of a single allocation attempt, distinct from `SubstrateError`
/// because `NoReady`/`Contention` are not substrate failures — they are
/// results of the matching algorithm itself.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// No Ready game server matched the request's selectors. Terminal for
    /// this request.
    #[error("no ready game server matches the request")]
    NoReady,

    /// Every candidate match was lost to a concurrent allocator. Retryable
    /// up to the caller's backoff budget.
    #[error("lost race to a concurrent allocator")]
    Contention,

    /// The stop signal was observed before a reply could be produced.
    #[error("shutdown in progress")]
    Shutdown,

    /// A forwarding cluster's allocation endpoint returned a non-2xx,
    /// non-5xx response. Not retryable; the body is the cluster's own
    /// explanation and is surfaced to the caller verbatim.
    #[error("remote cluster rejected the request: {0}")]
    RemoteRejected(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::Invalid => "Invalid",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Transient => "Transient",
        };
        f.write_str(s)
    }
}
