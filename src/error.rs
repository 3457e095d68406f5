use std::time::Duration;

/// Errors surfaced by the upstream API client.
///
/// Every non-2xx response and every transport failure is classified into
/// exactly one of these variants; retriability is a property of the variant
/// (plus status for 5xx), not of the call site.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication rejected by upstream (status {status})")]
    Authentication { status: u16 },

    #[error("resource not found: {url}")]
    NotFound { url: String },

    #[error("rate limited by upstream (429)")]
    RateLimit { retry_after: Option<Duration> },

    #[error("upstream server error (status {status})")]
    Server { status: u16 },

    #[error("upstream rejected request (status {status}): {message}")]
    Client { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid JSON in response: {0}")]
    Parse(String),

    #[error("unexpected response shape: {0}")]
    Validation(String),

    #[error("pagination limit exceeded: {0}")]
    PaginationLimitExceeded(String),
}

impl ApiError {
    /// Map an HTTP status to its error class. `retry_after` is only
    /// meaningful for 429.
    pub fn from_status(
        status: u16,
        url: &str,
        message: String,
        retry_after: Option<Duration>,
    ) -> Self {
        match status {
            401 | 403 => ApiError::Authentication { status },
            404 => ApiError::NotFound {
                url: url.to_string(),
            },
            429 => ApiError::RateLimit { retry_after },
            500..=599 => ApiError::Server { status },
            _ => ApiError::Client { status, message },
        }
    }

    /// Whether the retry/backoff loop may re-attempt after this error.
    ///
    /// 501 and 505 are permanent server-side conditions; they stay
    /// classified as `Server` but are never retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            ApiError::RateLimit { .. } | ApiError::Timeout | ApiError::Network(_) => true,
            ApiError::Server { status } => !matches!(*status, 501 | 505),
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Errors raised by the execution engine outside of the API client.
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job config invalid: {0}")]
    ConfigInvalid(String),

    #[error("dependency references unknown job {0}")]
    DependencyMissing(i64),

    #[error("cycle detected in job dependencies, residual nodes: {0:?}")]
    DependencyCycle(Vec<i64>),

    #[error("checkpoint corrupt for run {run_id}: {reason}")]
    CheckpointCorrupt { run_id: i64, reason: String },

    #[error("{failed} of {total} loader batches failed, first error: {first_error}")]
    LoaderBatchFailed {
        failed: usize,
        total: usize,
        first_error: String,
    },

    #[error(
        "job exceeded timeout of {timeout_seconds}s, progress saved at {records_loaded} records; retry to resume"
    )]
    Timeout {
        timeout_seconds: u64,
        records_loaded: i64,
    },

    #[error("preflight blocked: {0}")]
    PreflightBlocked(String),

    #[error("all {total} parameter executions failed, first error: {first_error}")]
    AllParametersFailed { total: usize, first_error: String },
}

/// Database errors worth retrying: connection-level failures plus Postgres
/// deadlock (40P01) and serialization (40001) aborts.
pub fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_the_taxonomy() {
        assert!(matches!(
            ApiError::from_status(401, "u", String::new(), None),
            ApiError::Authentication { status: 401 }
        ));
        assert!(matches!(
            ApiError::from_status(403, "u", String::new(), None),
            ApiError::Authentication { status: 403 }
        ));
        assert!(matches!(
            ApiError::from_status(404, "u", String::new(), None),
            ApiError::NotFound { .. }
        ));
        assert!(matches!(
            ApiError::from_status(429, "u", String::new(), Some(Duration::from_secs(7))),
            ApiError::RateLimit {
                retry_after: Some(d)
            } if d == Duration::from_secs(7)
        ));
        assert!(matches!(
            ApiError::from_status(503, "u", String::new(), None),
            ApiError::Server { status: 503 }
        ));
        assert!(matches!(
            ApiError::from_status(422, "u", String::new(), None),
            ApiError::Client { status: 422, .. }
        ));
    }

    #[test]
    fn retriability_table() {
        assert!(ApiError::RateLimit { retry_after: None }.is_retriable());
        assert!(ApiError::Server { status: 500 }.is_retriable());
        assert!(ApiError::Server { status: 503 }.is_retriable());
        assert!(ApiError::Timeout.is_retriable());
        assert!(ApiError::Network("reset".into()).is_retriable());

        // 501/505 stay Server but are permanent.
        assert!(!ApiError::Server { status: 501 }.is_retriable());
        assert!(!ApiError::Server { status: 505 }.is_retriable());

        assert!(!ApiError::Authentication { status: 401 }.is_retriable());
        assert!(
            !ApiError::NotFound {
                url: "u".to_string()
            }
            .is_retriable()
        );
        assert!(
            !ApiError::Client {
                status: 400,
                message: String::new()
            }
            .is_retriable()
        );
        assert!(!ApiError::Parse("bad".into()).is_retriable());
        assert!(!ApiError::Validation("shape".into()).is_retriable());
        assert!(!ApiError::PaginationLimitExceeded("pages".into()).is_retriable());
    }
}
