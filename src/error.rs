use axum::http::StatusCode;
use std::path::PathBuf;

/// Failure of a describe request, as seen by the HTTP layer.
#[derive(thiserror::Error, Debug)]
pub enum DescribeError {
    /// No model is loaded; detected before any inference work starts.
    #[error("model service unavailable: the model or processor failed to load")]
    EngineUnavailable,

    /// Prompt rendering, vision extraction, input preparation, device
    /// transfer, generation or decoding failed.
    #[error("image description failed: {0}")]
    InferenceFailed(String),

    /// Anything else, e.g. the upload could not be stored.
    #[error("internal server error: {0}")]
    Unexpected(String),
}

impl DescribeError {
    /// The status this condition would carry if it were not folded into the
    /// response body.
    pub fn status(&self) -> StatusCode {
        match self {
            DescribeError::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            DescribeError::InferenceFailed(_) | DescribeError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Failure while loading the model at startup.
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("model path '{}' is not a valid directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("failed to load model or processor: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// An unrecognised value for a command-line option.
#[derive(thiserror::Error, Debug)]
#[error("unsupported {kind}: '{value}'")]
pub struct ParseOptionError {
    kind: &'static str,
    value: String,
}

impl ParseOptionError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
