//! Central error handling for the tile streaming engine.
//!
//! Provides a unified StreamError enum with consistent categorization.
//! Steady-state streaming never surfaces errors to the renderer; recoverable
//! conditions (heap pressure, pool exhaustion) are absorbed into queue state.

/// Centralized error type for all streaming operations
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Streamer error: {0}")]
    Streamer(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Manifest version mismatch: expected {expected}, got {got}")]
    ManifestVersion { expected: u32, got: u32 },

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Convenience constructors for common error types
    pub fn backend<T: ToString>(msg: T) -> Self {
        StreamError::Backend(msg.to_string())
    }

    pub fn streamer<T: ToString>(msg: T) -> Self {
        StreamError::Streamer(msg.to_string())
    }

    pub fn config<T: ToString>(msg: T) -> Self {
        StreamError::Config(msg.to_string())
    }

    pub fn manifest<T: ToString>(msg: T) -> Self {
        StreamError::Manifest(msg.to_string())
    }

    pub fn lifecycle<T: ToString>(msg: T) -> Self {
        StreamError::Lifecycle(msg.to_string())
    }
}

/// Result type alias for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = StreamError::backend("fence device lost");
        assert!(err.to_string().contains("Backend"));

        let err = StreamError::config("heap_pages must be nonzero");
        assert!(err.to_string().starts_with("Config error"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing tile store");
        let err: StreamError = io.into();
        assert!(matches!(err, StreamError::Io(_)));
    }
}
