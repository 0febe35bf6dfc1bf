//! Error types surfaced by the augmentation engine.

use std::io;

use thiserror::Error;

/// Errors that end (or prevent) an augmentation run.
#[derive(Debug, Error)]
pub enum AugmentError {
    /// Filesystem failure while reading input or persisting state.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Input, checkpoint or backup JSON could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Invalid tunables or client setup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The input collection is unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Every credential was retired.
    #[error("no usable credentials remain in the pool")]
    CredentialsExhausted,
    /// The safety monitor halted the run.
    #[error("emergency stop: {reason}")]
    EmergencyStop {
        /// Threshold that tripped.
        reason: String,
    },
}

/// Convenience alias used across the library.
pub type Result<T, E = AugmentError> = std::result::Result<T, E>;
