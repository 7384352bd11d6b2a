//! Error handling for the AKI prediction pipeline
//!
//! Every stage of Collect -> Predict -> Explain -> Render reports failures
//! through [`PipelineError`]. Input domain violations carry a structured
//! [`ValidationError`] so callers can see which feature failed and why.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Pipeline stage, used to report where a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collect,
    Predict,
    Explain,
    RenderSummary,
    RenderAttribution,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Collect => "collect",
            Stage::Predict => "predict",
            Stage::Explain => "explain",
            Stage::RenderSummary => "render_summary",
            Stage::RenderAttribution => "render_attribution",
        };
        f.write_str(name)
    }
}

/// The specific way a supplied value violated its feature's domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum Violation {
    BelowMinimum { value: f64, minimum: f64 },
    AboveMaximum { value: f64, maximum: f64 },
    NotAnOption { value: f64, options: Vec<i64> },
    NotFinite,
    Unparseable { raw: String },
    UnknownFeature,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::BelowMinimum { value, minimum } => {
                write!(f, "value {value} is below the minimum {minimum}")
            }
            Violation::AboveMaximum { value, maximum } => {
                write!(f, "value {value} is above the maximum {maximum}")
            }
            Violation::NotAnOption { value, options } => {
                write!(f, "value {value} is not one of {options:?}")
            }
            Violation::NotFinite => f.write_str("value is not a finite number"),
            Violation::Unparseable { raw } => write!(f, "'{raw}' is not a number"),
            Violation::UnknownFeature => f.write_str("no such feature in the schema"),
        }
    }
}

/// A caller-supplied value outside its declared domain.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("invalid value for '{feature}': {violation}")]
pub struct ValidationError {
    pub feature: String,
    #[serde(flatten)]
    pub violation: Violation,
}

impl ValidationError {
    pub fn new(feature: impl Into<String>, violation: Violation) -> Self {
        Self {
            feature: feature.into(),
            violation,
        }
    }
}

/// Main error type for the prediction pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(ValidationError),

    #[error("Model invocation failed: {message}")]
    ModelInvocation { message: String },

    #[error("Explainer error: {message}")]
    Explainer { message: String },

    #[error("Failed to write artifact {path}: {message}")]
    ArtifactWrite { path: String, message: String },

    #[error("Failed to load model from {path}: {message}")]
    ModelLoad { path: String, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: String, millis: u64 },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result alias used throughout the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Create a model invocation error
    pub fn model_invocation(message: impl Into<String>) -> Self {
        Self::ModelInvocation {
            message: message.into(),
        }
    }

    /// Create an explainer error
    pub fn explainer(message: impl Into<String>) -> Self {
        Self::Explainer {
            message: message.into(),
        }
    }

    /// Create an artifact write error
    pub fn artifact_write(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ArtifactWrite {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a model load error
    pub fn model_load(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModelLoad {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    pub fn timeout(operation: impl Into<String>, millis: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis,
        }
    }

    /// The validation details, if this is a domain violation.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            PipelineError::Validation(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn status(&self) -> StatusCode {
        match self {
            PipelineError::Validation(_) | PipelineError::Serialization { .. } => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::ModelInvocation { .. } | PipelineError::Explainer { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::ArtifactWrite { .. }
            | PipelineError::ModelLoad { .. }
            | PipelineError::Config { .. }
            | PipelineError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ValidationError> for PipelineError {
    fn from(err: ValidationError) -> Self {
        PipelineError::Validation(err)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::io("io_operation", err)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::serialization("json_operation", err)
    }
}

impl From<figment::Error> for PipelineError {
    fn from(err: figment::Error) -> Self {
        PipelineError::config(err.to_string())
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.to_string(),
            "validation": self.as_validation(),
        });
        (status, Json(body)).into_response()
    }
}

/// A pipeline run that stopped before all stages completed.
///
/// Results computed by earlier stages are kept so callers can inspect them;
/// they are never presented as a finished report.
#[derive(Error, Debug)]
#[error("{stage} stage failed")]
pub struct RunFailure {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
    pub prediction: Option<crate::prediction::PredictionResult>,
    pub attribution: Option<crate::prediction::AttributionReport>,
}

impl RunFailure {
    pub fn at(stage: Stage, error: PipelineError) -> Self {
        Self {
            stage,
            error,
            prediction: None,
            attribution: None,
        }
    }
}

impl IntoResponse for RunFailure {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let body = serde_json::json!({
            "error": self.error.to_string(),
            "stage": self.stage,
            "validation": self.error.as_validation(),
        });
        (status, Json(body)).into_response()
    }
}
