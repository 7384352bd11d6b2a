//! Library root for the `aki_predict` crate: AKI risk prediction with
//! per-feature attribution.

// Errors
pub mod errors;

// Schema & input collection
pub mod feature_schema;
pub mod input_validator;

// Model, attribution and results
pub mod forest_model;
pub mod model;
pub mod prediction;
pub mod tree_explainer;

// Pipeline & rendering
pub mod pipeline;
pub mod render;

// Configuration, logging & surfaces
pub mod cli;
pub mod config;
pub mod log_sink;
pub mod web;

pub use errors::{PipelineError, PipelineResult, RunFailure, Stage, ValidationError, Violation};
pub use feature_schema::{FeatureKind, FeatureSchema, FeatureSpec, FeatureVector};
pub use input_validator::{collect, CollectedInput, FeatureInput};
pub use model::{AttributionEngine, ClassLabel, Classifier};
pub use pipeline::{ArtifactPaths, InferenceService, PipelineRun};
pub use prediction::{AttributionReport, FeatureContribution, PredictionResult};
