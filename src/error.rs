use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// One record could not be normalized.
    #[error("malformed record #{index}: {reason}")]
    Malformed { index: usize, reason: String },

    /// No game could be found or inferred for the event; it is held pending.
    #[error("orphan event {fingerprint} on server {server} at {at_ms}ms")]
    OrphanEvent {
        fingerprint: String,
        server: String,
        at_ms: i64,
    },

    /// A write would break a store invariant. The batch is rolled back.
    #[error("integrity violation on {fingerprint}: {reason}")]
    IntegrityViolation { fingerprint: String, reason: String },

    #[error("unknown derivation version {0}")]
    UnknownVersion(u32),

    #[error("sqlite error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Whether re-running the same batch may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::IntegrityViolation { .. } | IngestError::OrphanEvent { .. } => true,
            IngestError::Storage(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Short stable label for log records.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Malformed { .. } => "malformed_record",
            IngestError::OrphanEvent { .. } => "orphan_event",
            IngestError::IntegrityViolation { .. } => "integrity_violation",
            IngestError::UnknownVersion(_) => "unknown_version",
            IngestError::Storage(_) => "storage",
            IngestError::Serialization(_) => "serialization",
            IngestError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
