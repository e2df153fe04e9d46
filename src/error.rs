//! Engine error taxonomy.

/// Errors surfaced by the engine.
///
/// Conflicts and busy conditions are retryable; `Panic` is terminal for the
/// engine instance that produced it.
#[derive(Debug, thiserror::Error)]
pub enum LapisError {
    #[error("conflict between concurrent operations: {reason}")]
    RollbackConflict { reason: String },

    #[error("page eviction busy")]
    EvictionBusy,

    #[error("conflict with a prepared update")]
    PreparedConflict,

    #[error("engine panic: {0}")]
    Panic(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LapisError {
    pub fn conflict(reason: impl Into<String>) -> Self {
        LapisError::RollbackConflict { reason: reason.into() }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        LapisError::InvalidArgument(msg.into())
    }

    /// Whether the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LapisError::RollbackConflict { .. }
                | LapisError::EvictionBusy
                | LapisError::PreparedConflict
                | LapisError::Busy(_)
        )
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, LapisError::Panic(_))
    }
}

pub type Result<T> = std::result::Result<T, LapisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(LapisError::conflict("k").is_retryable());
        assert!(LapisError::EvictionBusy.is_retryable());
        assert!(LapisError::PreparedConflict.is_retryable());
        assert!(!LapisError::Panic("x".into()).is_retryable());
        assert!(!LapisError::invalid("x").is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let err: LapisError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(matches!(err, LapisError::Io(_)));
        assert!(err.to_string().contains("disk"));
    }
}
