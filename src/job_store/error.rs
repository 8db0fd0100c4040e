use thiserror::Error;

pub type JobStoreResult<T> = Result<T, JobStoreError>;

#[derive(Debug, Error)]
pub enum JobStoreError {
    /// A uniqueness rule rejected the insert (an unfinished instance of the
    /// same periodic task already exists).
    #[error("Duplicate job: {0}")]
    Duplicate(String),

    /// The caller's fencing token is outdated: the job was reclaimed or finished.
    #[error("Stale claim on job {job_id} (version {version})")]
    StaleClaim { job_id: String, version: i64 },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobStoreError {
    pub fn is_stale_claim(&self) -> bool {
        matches!(self, JobStoreError::StaleClaim { .. })
    }
}

/// True for SQLite UNIQUE/PRIMARY KEY violations.
pub(crate) fn is_unique_violation(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(err, _) => {
            err.code == rusqlite::ErrorCode::ConstraintViolation
                && matches!(
                    err.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}
