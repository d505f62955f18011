//! Error types for the segmentation runtime

use thiserror::Error;

/// Result type alias for segmentation runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the segmentation runtime
///
/// Run-level failures (`Conversion`, `Inference`, `Reconstruction`) never
/// escape a run: the scheduler logs them, counts them and returns to idle.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Raw frame could not be converted into a tensor-ready image
    #[error("Frame conversion failed: {0}")]
    Conversion(String),

    /// Inference dispatch or read-back failed
    #[error("Inference failed: {0}")]
    Inference(String),

    /// Model could not be resolved or loaded by any provider
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// A mandatory reconstruction stage (render or upscale) failed
    #[error("Mask reconstruction failed: {stage}: {message}")]
    Reconstruction {
        /// Stage that failed
        stage: &'static str,
        /// Error message
        message: String,
    },

    /// Buffer or tensor shape did not match what the operation expects
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Scheduler was shut down
    #[error("Scheduler has been shut down")]
    ShutDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a reconstruction error for the given stage
    pub fn reconstruction(stage: &'static str, message: impl Into<String>) -> Self {
        Error::Reconstruction {
            stage,
            message: message.into(),
        }
    }

    /// Whether this error aborts a single run without affecting the scheduler
    pub fn is_run_local(&self) -> bool {
        matches!(
            self,
            Error::Conversion(_)
                | Error::Inference(_)
                | Error::Reconstruction { .. }
                | Error::InvalidData(_)
        )
    }
}
