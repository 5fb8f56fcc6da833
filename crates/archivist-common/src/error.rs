use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchivistError {
    #[error("dataset record not found: {0}")]
    RecordNotFound(String),
    #[error("job not found: {0}")]
    JobNotFound(u64),
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },
    #[error("network error: {0}")]
    Network(String),
    #[error("conversion of {instance} failed: {reason}")]
    Conversion { instance: String, reason: String },
    #[error("no files converted out of {total}")]
    TotalConversionFailure { total: usize },
    #[error("storage provider error: {0}")]
    StorageProvider(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ArchivistError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RecordNotFound(_) => "RecordNotFound",
            Self::JobNotFound(_) => "JobNotFound",
            Self::BucketNotFound(_) => "NoSuchBucket",
            Self::ObjectNotFound { .. } => "NoSuchKey",
            Self::Timeout { .. } => "Timeout",
            Self::Network(_) => "NetworkError",
            Self::Conversion { .. } => "ConversionError",
            Self::TotalConversionFailure { .. } => "TotalConversionFailure",
            Self::StorageProvider(_) => "StorageProviderError",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::AccessDenied(_) => "AccessDenied",
            Self::Crypto(_) => "CryptoError",
            Self::InternalError(_) => "InternalError",
            Self::Io(_) => "InternalError",
        }
    }

    /// Transient failures are resolved by issuing a new create call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, ArchivistError>;

#[cfg(test)]
mod tests {
    use super::ArchivistError;

    #[test]
    fn timeout_message_mentions_operation() {
        let err = ArchivistError::Timeout {
            operation: "dataset export".to_string(),
            seconds: 600,
        };
        assert_eq!(err.to_string(), "dataset export timed out after 600s");
        assert_eq!(err.code(), "Timeout");
        assert!(err.is_transient());
    }

    #[test]
    fn storage_diagnostic_is_kept_verbatim() {
        let err = ArchivistError::StorageProvider("QuotaExceeded: bucket full".to_string());
        assert!(err.to_string().ends_with("QuotaExceeded: bucket full"));
        assert!(!err.is_transient());
    }
}
