//! End-to-end pipeline behaviour against the bundled demo forest.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use aki_predict::config::AppConfig;
use aki_predict::forest_model::RandomForest;
use aki_predict::tree_explainer::TreeExplainer;
use aki_predict::{
    AttributionEngine, ClassLabel, Classifier, FeatureInput, FeatureSchema, FeatureVector,
    InferenceService, PipelineError, PipelineResult, Stage, Violation,
};

fn demo_model_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("models/rf_demo.json")
}

fn config_in(dir: &TempDir) -> AppConfig {
    AppConfig {
        model_path: demo_model_path(),
        output_dir: dir.path().to_path_buf(),
        ..AppConfig::default()
    }
}

/// Classifier wrapper that counts how often the model is invoked.
struct CountingClassifier {
    inner: Arc<RandomForest>,
    calls: Arc<AtomicUsize>,
}

impl Classifier for CountingClassifier {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn feature_names(&self) -> &[String] {
        self.inner.feature_names()
    }

    fn classes(&self) -> &[ClassLabel] {
        Classifier::classes(self.inner.as_ref())
    }

    fn predict_proba(&self, row: &[f64]) -> PipelineResult<Vec<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.predict_proba(row)
    }
}

fn counting_service() -> (InferenceService, Arc<AtomicUsize>) {
    let forest = Arc::new(RandomForest::load(demo_model_path()).expect("demo model loads"));
    let calls = Arc::new(AtomicUsize::new(0));
    let classifier = Arc::new(CountingClassifier {
        inner: forest.clone(),
        calls: calls.clone(),
    });
    let explainer = Arc::new(TreeExplainer::new(forest));
    let service = InferenceService::new(FeatureSchema::charls(), classifier, explainer)
        .expect("consistent service");
    (service, calls)
}

#[test]
fn all_defaults_complete_every_stage() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let service = InferenceService::load(&config).unwrap();

    let run = service
        .run(&FeatureInput::new(), &config.artifact_paths())
        .expect("defaults are always valid");

    assert_eq!(run.defaulted.len(), 15);
    assert_eq!(run.vector, FeatureSchema::charls().defaults());
    for path in [&run.artifacts.summary, &run.artifacts.attribution] {
        let meta = std::fs::metadata(path).expect("artifact written");
        assert!(meta.len() > 0, "{} is empty", path.display());
    }
    let summary = std::fs::read(&run.artifacts.summary).unwrap();
    assert!(summary.starts_with(b"\x89PNG"));
}

#[test]
fn probabilities_sum_to_one_and_prediction_is_deterministic() {
    let (service, _) = counting_service();
    let vector = FeatureSchema::charls().defaults();

    let first = service.predict(&vector).unwrap();
    let second = service.predict(&vector).unwrap();
    assert_eq!(first, second);

    let total: f64 = first.probabilities().iter().sum();
    assert!((total - 1.0).abs() < 1e-9);
    assert_eq!(
        first.classes()[first.class_index()],
        first.predicted_class()
    );
}

#[test]
fn attributions_add_up_to_the_predicted_probability() {
    let (service, _) = counting_service();
    let inputs = [
        FeatureInput::new(),
        FeatureInput::new().with("age", 88.0).with("hypertension", 1.0),
        FeatureInput::new()
            .with("night_sleep_duration", 3.5)
            .with("hospitalizations_last_year", 4.0)
            .with("self_rated_health", 5.0),
        FeatureInput::new().with("age", 45.0).with("gender", 1.0).with("residence_type", 0.0),
    ];

    for input in &inputs {
        let collected = service.collect(input).unwrap();
        let prediction = service.predict(&collected.vector).unwrap();
        let report = service
            .explain(&collected.vector, prediction.predicted_class())
            .unwrap();

        assert_eq!(report.contributions.len(), 15);
        assert_eq!(report.explained_class, prediction.predicted_class());
        assert!(
            (report.output_value() - prediction.predicted_probability()).abs() < 1e-8,
            "baseline {} + contributions != {}",
            report.baseline,
            prediction.predicted_probability()
        );
    }
}

#[test]
fn age_below_domain_fails_before_the_classifier() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let (service, calls) = counting_service();

    let failure = service
        .run(&FeatureInput::new().with("age", 44.0), &config.artifact_paths())
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Collect);
    let validation = failure.error.as_validation().expect("validation error");
    assert_eq!(validation.feature, "age");
    assert_eq!(
        validation.violation,
        Violation::BelowMinimum {
            value: 44.0,
            minimum: 45.0
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(failure.prediction.is_none());
    assert!(!config.artifact_paths().summary.exists());
}

#[test]
fn gender_outside_options_fails_before_the_classifier() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let (service, calls) = counting_service();

    let failure = service
        .run(&FeatureInput::new().with("gender", 2.0), &config.artifact_paths())
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Collect);
    let validation = failure.error.as_validation().expect("validation error");
    assert_eq!(validation.feature, "gender");
    assert!(matches!(validation.violation, Violation::NotAnOption { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn wrong_length_vector_is_a_model_invocation_error() {
    let (service, calls) = counting_service();
    let err = service
        .predict(&FeatureVector::new(vec![1.0; 14]))
        .unwrap_err();
    assert!(matches!(err, PipelineError::ModelInvocation { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn render_failure_keeps_model_results() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.output_dir = dir.path().join("missing").join("nested");
    let (service, _) = counting_service();

    let failure = service
        .run(&FeatureInput::new(), &config.artifact_paths())
        .unwrap_err();

    assert_eq!(failure.stage, Stage::RenderSummary);
    assert!(matches!(failure.error, PipelineError::ArtifactWrite { .. }));
    assert!(failure.prediction.is_some());
    assert!(failure.attribution.is_some());
}

#[test]
fn model_with_reordered_columns_is_rejected() {
    let dir = TempDir::new().unwrap();
    let raw = std::fs::read_to_string(demo_model_path()).unwrap();
    let mut json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let names = json["feature_names"].as_array_mut().unwrap();
    names.swap(0, 1);
    let path = dir.path().join("swapped.json");
    std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();

    let config = AppConfig {
        model_path: path,
        ..config_in(&dir)
    };
    let err = InferenceService::load(&config).unwrap_err();
    assert!(matches!(err, PipelineError::ModelLoad { .. }), "got {err}");
}

#[test]
fn missing_model_file_is_a_load_error() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig {
        model_path: dir.path().join("absent.json"),
        ..config_in(&dir)
    };
    assert!(matches!(
        InferenceService::load(&config),
        Err(PipelineError::ModelLoad { .. })
    ));
}

struct MisalignedExplainer;

impl AttributionEngine for MisalignedExplainer {
    fn classes(&self) -> &[ClassLabel] {
        &[1, 0]
    }

    fn expected_values(&self) -> &[f64] {
        &[0.3, 0.7]
    }

    fn shap_values(&self, _row: &[f64]) -> PipelineResult<Vec<Vec<f64>>> {
        Ok(vec![vec![0.0, 0.0]; 15])
    }
}

#[test]
fn explainer_with_different_class_order_is_rejected() {
    let forest = Arc::new(RandomForest::load(demo_model_path()).unwrap());
    let err = InferenceService::new(FeatureSchema::charls(), forest, Arc::new(MisalignedExplainer))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Explainer { .. }));
}

#[test]
fn explaining_an_unknown_class_is_an_explainer_error() {
    let (service, _) = counting_service();
    let err = service
        .explain(&FeatureSchema::charls().defaults(), 7)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Explainer { .. }), "got {err}");
    assert!(err.to_string().contains("class 7"));
}

/// Explainer that agrees with the forest on classes but never produces values.
struct FailingExplainer;

impl AttributionEngine for FailingExplainer {
    fn classes(&self) -> &[ClassLabel] {
        &[0, 1]
    }

    fn expected_values(&self) -> &[f64] {
        &[0.5, 0.5]
    }

    fn shap_values(&self, _row: &[f64]) -> PipelineResult<Vec<Vec<f64>>> {
        Err(PipelineError::explainer("tree traversal failed"))
    }
}

#[test]
fn explain_failure_keeps_the_prediction_only() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let forest = Arc::new(RandomForest::load(demo_model_path()).unwrap());
    let service =
        InferenceService::new(FeatureSchema::charls(), forest, Arc::new(FailingExplainer)).unwrap();

    let failure = service
        .run(&FeatureInput::new(), &config.artifact_paths())
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Explain);
    assert!(matches!(failure.error, PipelineError::Explainer { .. }));
    assert!(failure.prediction.is_some());
    assert!(failure.attribution.is_none());
    assert!(!config.artifact_paths().summary.exists());
    assert!(!config.artifact_paths().attribution.exists());
}
