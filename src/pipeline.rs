//! pipeline.rs
//! Inference service: Collect -> Predict -> Explain -> Render, run linearly
//! with no retries. The service is built once, checked for consistency
//! between schema, classifier and explainer, and never mutated afterwards.

use crate::config::AppConfig;
use crate::errors::{PipelineError, PipelineResult, RunFailure, Stage, ValidationError};
use crate::feature_schema::{FeatureSchema, FeatureVector};
use crate::forest_model::RandomForest;
use crate::input_validator::{collect, CollectedInput, FeatureInput};
use crate::model::{AttributionEngine, ClassLabel, Classifier};
use crate::prediction::{AttributionReport, FeatureContribution, PredictionResult};
use crate::render::{render_attribution_plot, render_prediction_summary};
use crate::tree_explainer::TreeExplainer;

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// Where a run writes its two images.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactPaths {
    pub summary: PathBuf,
    pub attribution: PathBuf,
}

impl ArtifactPaths {
    pub fn in_dir(dir: &Path, summary_file: &str, attribution_file: &str) -> Self {
        Self {
            summary: dir.join(summary_file),
            attribution: dir.join(attribution_file),
        }
    }
}

/// Everything a completed run produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub vector: FeatureVector,
    pub defaulted: Vec<String>,
    pub prediction: PredictionResult,
    pub attribution: AttributionReport,
    pub artifacts: ArtifactPaths,
}

impl PipelineRun {
    pub fn assemble(
        run_id: Uuid,
        collected: CollectedInput,
        prediction: PredictionResult,
        attribution: AttributionReport,
        artifacts: ArtifactPaths,
    ) -> Self {
        Self {
            run_id,
            timestamp: chrono::Utc::now(),
            vector: collected.vector,
            defaulted: collected.defaulted,
            prediction,
            attribution,
            artifacts,
        }
    }
}

/// Immutable prediction service shared by every request.
pub struct InferenceService {
    schema: FeatureSchema,
    classifier: Arc<dyn Classifier>,
    explainer: Arc<dyn AttributionEngine>,
}

impl std::fmt::Debug for InferenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceService")
            .field("model_id", &self.classifier.model_id())
            .field("features", &self.schema.len())
            .field("classes", &self.classifier.classes())
            .finish()
    }
}

impl InferenceService {
    /// Assemble a service, verifying that the classifier was fit on the
    /// schema's column order and that the explainer uses the classifier's
    /// class order for its baselines.
    pub fn new(
        schema: FeatureSchema,
        classifier: Arc<dyn Classifier>,
        explainer: Arc<dyn AttributionEngine>,
    ) -> PipelineResult<Self> {
        schema
            .verify_column_order(classifier.feature_names())
            .map_err(|message| PipelineError::model_load(classifier.model_id(), message))?;

        if explainer.classes() != classifier.classes() {
            return Err(PipelineError::explainer(format!(
                "explainer classes {:?} do not match classifier classes {:?}",
                explainer.classes(),
                classifier.classes()
            )));
        }
        if explainer.expected_values().len() != classifier.classes().len() {
            return Err(PipelineError::explainer(format!(
                "explainer has {} baselines for {} classes",
                explainer.expected_values().len(),
                classifier.classes().len()
            )));
        }

        info!(
            model_id = classifier.model_id(),
            features = schema.len(),
            classes = ?classifier.classes(),
            "inference service ready"
        );
        Ok(Self {
            schema,
            classifier,
            explainer,
        })
    }

    /// Load the forest named by `config.model_path` and build the TreeSHAP
    /// engine over it. Called once at startup.
    pub fn load(config: &AppConfig) -> PipelineResult<Self> {
        let forest = Arc::new(RandomForest::load(&config.model_path)?);
        let explainer = Arc::new(TreeExplainer::new(forest.clone()));
        Self::new(FeatureSchema::charls(), forest, explainer)
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }

    pub fn explainer(&self) -> &dyn AttributionEngine {
        self.explainer.as_ref()
    }

    /// Score one row. Fails without a result if the row does not fit the
    /// classifier.
    pub fn predict(&self, vector: &FeatureVector) -> PipelineResult<PredictionResult> {
        let row = vector.as_slice();
        if row.len() != self.classifier.feature_names().len() {
            return Err(PipelineError::model_invocation(format!(
                "feature vector has {} values, classifier expects {}",
                row.len(),
                self.classifier.feature_names().len()
            )));
        }

        let probabilities = self.classifier.predict_proba(row)?;
        let predicted_class = self.classifier.predict(row)?;
        let classes = self.classifier.classes().to_vec();

        if probabilities.len() != classes.len() {
            return Err(PipelineError::model_invocation(format!(
                "classifier returned {} probabilities for {} classes",
                probabilities.len(),
                classes.len()
            )));
        }
        let total: f64 = probabilities.iter().sum();
        if probabilities.iter().any(|p| !p.is_finite() || *p < 0.0)
            || (total - 1.0).abs() > PROBABILITY_TOLERANCE
        {
            return Err(PipelineError::model_invocation(format!(
                "classifier returned an invalid distribution {probabilities:?}"
            )));
        }
        let class_index = classes
            .iter()
            .position(|&c| c == predicted_class)
            .ok_or_else(|| {
                PipelineError::model_invocation(format!(
                    "predicted label {predicted_class} is not one of {classes:?}"
                ))
            })?;

        let result = PredictionResult::new(predicted_class, class_index, classes, probabilities);
        debug!(
            predicted_class,
            probability = result.predicted_probability(),
            "prediction complete"
        );
        Ok(result)
    }

    /// Attribute the prediction for `predicted_class` to each feature.
    pub fn explain(
        &self,
        vector: &FeatureVector,
        predicted_class: ClassLabel,
    ) -> PipelineResult<AttributionReport> {
        let class_index = self
            .explainer
            .classes()
            .iter()
            .position(|&c| c == predicted_class)
            .ok_or_else(|| {
                PipelineError::explainer(format!(
                    "class {predicted_class} is unknown to the explainer (classes {:?})",
                    self.explainer.classes()
                ))
            })?;
        let baseline = *self.explainer.expected_values().get(class_index).ok_or_else(|| {
            PipelineError::explainer(format!(
                "class index {class_index} out of range for {} baselines",
                self.explainer.expected_values().len()
            ))
        })?;

        let shap = self.explainer.shap_values(vector.as_slice())?;
        if shap.len() != self.schema.len() {
            return Err(PipelineError::explainer(format!(
                "explainer returned {} contributions for {} features",
                shap.len(),
                self.schema.len()
            )));
        }

        let mut contributions = Vec::with_capacity(shap.len());
        for ((spec, &value), per_class) in self.schema.specs().iter().zip(vector.as_slice()).zip(&shap) {
            let contribution = *per_class.get(class_index).ok_or_else(|| {
                PipelineError::explainer(format!(
                    "no contribution for class index {class_index} on '{}'",
                    spec.name
                ))
            })?;
            contributions.push(FeatureContribution {
                feature: spec.name.to_string(),
                value,
                display_value: spec.format_value(value),
                contribution,
            });
        }

        let report = AttributionReport {
            explained_class: predicted_class,
            baseline,
            contributions,
        };
        debug!(baseline, output = report.output_value(), "attribution complete");
        Ok(report)
    }

    /// Run every stage for one request. The first failure stops the run;
    /// results from stages that already finished stay on the failure.
    pub fn run(&self, input: &FeatureInput, artifacts: &ArtifactPaths) -> Result<PipelineRun, RunFailure> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        let _enter = span.enter();

        let collected = self
            .collect(input)
            .map_err(|e| RunFailure::at(Stage::Collect, e.into()))?;
        if !collected.defaulted.is_empty() {
            info!(defaulted = ?collected.defaulted, "declared defaults substituted");
        }

        let prediction = self
            .predict(&collected.vector)
            .map_err(|e| RunFailure::at(Stage::Predict, e))?;

        let attribution = match self.explain(&collected.vector, prediction.predicted_class()) {
            Ok(a) => a,
            Err(e) => {
                return Err(RunFailure {
                    prediction: Some(prediction),
                    ..RunFailure::at(Stage::Explain, e)
                })
            }
        };

        if let Err((stage, e)) = render_artifacts(&prediction, &attribution, artifacts) {
            return Err(render_failure(stage, e, prediction, attribution));
        }

        info!(
            predicted_class = prediction.predicted_class(),
            probability = prediction.predicted_probability(),
            "pipeline run complete"
        );
        Ok(PipelineRun::assemble(
            run_id,
            collected,
            prediction,
            attribution,
            artifacts.clone(),
        ))
    }

    /// Collect stage on its own, for callers that drive the stages
    /// themselves.
    pub fn collect(&self, input: &FeatureInput) -> Result<CollectedInput, ValidationError> {
        collect(&self.schema, input)
    }
}

/// Render both artifacts, summary first. Stops at the first failure and
/// reports which render stage it was.
pub fn render_artifacts(
    prediction: &PredictionResult,
    attribution: &AttributionReport,
    artifacts: &ArtifactPaths,
) -> Result<(), (Stage, PipelineError)> {
    render_prediction_summary(prediction, &artifacts.summary).map_err(|e| (Stage::RenderSummary, e))?;
    render_attribution_plot(attribution, &artifacts.attribution)
        .map_err(|e| (Stage::RenderAttribution, e))?;
    Ok(())
}

/// Failure during rendering: both model results stay available.
pub fn render_failure(
    stage: Stage,
    error: PipelineError,
    prediction: PredictionResult,
    attribution: AttributionReport,
) -> RunFailure {
    warn!(%stage, error = %error, "render failed");
    RunFailure {
        stage,
        error,
        prediction: Some(prediction),
        attribution: Some(attribution),
    }
}
