use std::time::Duration;

/// Failure classes surfaced by the run and record stores.
///
/// `Transient` means the caller should retry with backoff; `Unavailable`
/// means persistent storage is gone and the caller must degrade (spill to
/// backup files, fail the run).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient storage error: {0}")]
    Transient(#[source] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("illegal run transition: {0}")]
    InvalidTransition(String),
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

// SQLITE_BUSY and SQLITE_LOCKED are the retry-worthy result codes; everything
// else from the driver means the database itself is unusable.
pub(crate) fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|c| c.parse::<i64>().ok())
                .map(|c| c & 0xff);
            if matches!(primary, Some(5) | Some(6)) {
                StoreError::Transient(err)
            } else {
                StoreError::Unavailable(err)
            }
        }
        sqlx::Error::PoolTimedOut => StoreError::Transient(err),
        sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
        _ => StoreError::Unavailable(err),
    }
}

/// Exponential backoff schedule shared by store callers: 100ms, 200ms, 400ms…
/// capped at five seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(100);
    let factor = 1u32 << attempt.min(6);
    (base * factor).min(Duration::from_secs(5))
}
