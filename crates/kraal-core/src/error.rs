//! Error types for the kraal core.

use thiserror::Error;

/// Core error type.
///
/// Request-scoped failures bubble up to the request coordinator, which picks
/// the transport mapping; background loops log and keep going. `Repairing` is
/// a distinct signal rather than a failure: the transport layer answers
/// "accepted, retry later" without blocking a worker.
#[derive(Debug, Error)]
pub enum Error {
    /// Model is not present in the models directory.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// File does not look like a loadable model (wrong extension).
    #[error("Invalid model file: {0}")]
    InvalidFormat(String),

    /// File exists but fails corruption checks (size or GGUF magic).
    #[error("Corrupted model file: {0}")]
    Corrupted(String),

    /// Native load or context creation failed.
    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    /// The model is mid-repair; retry later.
    #[error("Model is being repaired: {model}")]
    Repairing { model: String },

    /// Download exhausted its retries or failed verification.
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// A bounded wait expired; the underlying work keeps running.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Inference-time failure inside the pipeline.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this failure marks the model file as corrupt and therefore
    /// eligible for auto-repair.
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            Error::InvalidFormat(_) | Error::Corrupted(_) | Error::LoadFailed(_)
        )
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repairing_carries_model_name() {
        let err = Error::Repairing {
            model: "gpt-oss:7b".to_string(),
        };
        assert_eq!(err.to_string(), "Model is being repaired: gpt-oss:7b");
    }

    #[test]
    fn repairable_kinds() {
        assert!(Error::Corrupted("x".into()).is_repairable());
        assert!(Error::LoadFailed("x".into()).is_repairable());
        assert!(!Error::ModelNotFound("x".into()).is_repairable());
        assert!(!Error::DownloadFailed("x".into()).is_repairable());
    }
}
