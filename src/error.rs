use thiserror::Error;

/// Failures of one update attempt, grouped by how the loader recovers from them.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("download failed after {attempts} attempts: {source}")]
    DownloadExhausted {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("backup failed: {0}")]
    Backup(#[source] anyhow::Error),
    #[error("health check failed: {0}")]
    HealthCheck(String),
    #[error("rollback impossible, manual intervention required: {0}")]
    RollbackFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Only a failed rollback leaves the device without a known-good version.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, UpdateError::RollbackFailed(_))
    }
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor not initialized")]
    NotInitialized,
    #[error("sensor driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("message on unexpected topic {0}")]
    UnknownTopic(String),
    #[error("invalid payload on {topic}: {source}")]
    Invalid {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}
