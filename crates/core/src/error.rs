use thiserror::Error;

use crate::session::Step;

#[derive(Error, Debug)]
pub enum HoundError {
    #[error("Session rejected action: {0}")]
    Session(#[from] SessionError),

    #[error("Invalid configuration for {key}: {reason}")]
    Config { key: &'static str, reason: String },

    #[error("Could not write frame to {path}: {reason}")]
    FrameWriteFailed {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),
}

/// Rejections raised by the session state machine. None of these change state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Please upload a video file (got {mime:?})")]
    NotAVideo { mime: String },

    #[error("Consent is required before a video can be submitted")]
    ConsentRequired,

    #[error("No video file selected")]
    NoFile,

    #[error("Cannot {action} while in {from:?}")]
    InvalidTransition { from: Step, action: &'static str },
}

/// Transport-level failures: no HTTP response was received at all.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Network failure: {0}")]
    Network(String),

    #[error("Analysis job {job_id} did not finish within {waited_ms} ms")]
    PollTimeout { job_id: String, waited_ms: u64 },
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HoundError>;
