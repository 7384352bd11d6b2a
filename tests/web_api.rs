//! Router tests driven through `tower::ServiceExt::oneshot`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use aki_predict::config::AppConfig;
use aki_predict::forest_model::RandomForest;
use aki_predict::tree_explainer::TreeExplainer;
use aki_predict::web::{build_router, WebState};
use aki_predict::{ClassLabel, Classifier, FeatureSchema, InferenceService, PipelineResult};

fn demo_model_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("models/rf_demo.json")
}

fn test_app() -> (Router, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let config = AppConfig {
        model_path: demo_model_path(),
        output_dir: dir.path().to_path_buf(),
        ..AppConfig::default()
    };
    let service = Arc::new(InferenceService::load(&config).expect("demo model loads"));
    (build_router(WebState::new(service, &config)), dir)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn json_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn form_post(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/predict")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_and_schema_endpoints() {
    let (app, _dir) = test_app();

    let (status, body) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");

    let (status, body) = send(&app, get("/api/schema")).await;
    assert_eq!(status, StatusCode::OK);
    let schema: Value = serde_json::from_slice(&body).unwrap();
    let specs = schema["specs"].as_array().unwrap();
    assert_eq!(specs.len(), 15);
    assert_eq!(specs[1]["name"], "age");
    assert_eq!(specs[1]["kind"], "numerical");
    assert_eq!(specs[1]["minimum"], 45.0);
}

#[tokio::test]
async fn index_serves_the_form() {
    let (app, _dir) = test_app();
    let (status, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("<form method=\"post\" action=\"/predict\">"));
    assert!(html.contains("name=\"hypertension\""));
    assert!(html.contains("age (45 - 100)"));
}

#[tokio::test]
async fn json_predict_with_defaults_serves_artifacts() {
    let (app, _dir) = test_app();

    let (status, body) = send(&app, json_post("/api/predict", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let result: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(result["defaulted"].as_array().unwrap().len(), 15);
    assert_eq!(result["contributions"].as_array().unwrap().len(), 15);

    let probability = result["probability"].as_f64().unwrap();
    let baseline = result["baseline"].as_f64().unwrap();
    let total: f64 = result["contributions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["contribution"].as_f64().unwrap())
        .sum();
    assert!((baseline + total - probability).abs() < 1e-8);

    let summary_url = result["artifacts"]["summary"].as_str().unwrap().to_string();
    let (status, png) = send(&app, get(&summary_url)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(png.starts_with(b"\x89PNG"));
}

#[tokio::test]
async fn json_predict_rejects_out_of_domain_age() {
    let (app, _dir) = test_app();
    let (status, body) = send(&app, json_post("/api/predict", json!({ "age": 44 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["stage"], "collect");
    assert_eq!(err["validation"]["feature"], "age");
    assert_eq!(err["validation"]["violation"], "below_minimum");
    assert_eq!(err["validation"]["minimum"], 45.0);
}

#[tokio::test]
async fn json_predict_rejects_unknown_feature() {
    let (app, _dir) = test_app();
    let (status, body) = send(&app, json_post("/api/predict", json!({ "bmi": 22.0 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["validation"]["violation"], "unknown_feature");
}

#[tokio::test]
async fn form_submission_renders_result_page() {
    let (app, dir) = test_app();
    let (status, body) = send(&app, form_post("age=71&gender=1&hypertension=1")).await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("predicted possibility of AKI is"));
    assert!(html.contains("/artifacts/prediction_text.png"));
    assert!(html.contains("/artifacts/shap_force_plot.png"));
    assert!(dir.path().join("shap_force_plot.png").exists());
}

#[tokio::test]
async fn form_submission_with_invalid_gender_reports_error() {
    let (app, dir) = test_app();
    let (status, body) = send(&app, form_post("gender=2")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("collect failed"));
    assert!(html.contains("gender"));
    assert!(!dir.path().join("prediction_text.png").exists());
}

#[tokio::test]
async fn rejected_form_keeps_submitted_values() {
    let (app, _dir) = test_app();
    let (status, body) = send(&app, form_post("night_sleep_duration=7.255&age=71&gender=2")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("value=\"7.255\""), "{html}");
    assert!(html.contains("value=\"71\""));
    assert!(!html.contains("value=\"63.48\""));
}

#[tokio::test]
async fn result_page_keeps_submitted_values_unrounded() {
    let (app, _dir) = test_app();
    let (status, body) = send(&app, form_post("night_sleep_duration=7.255&gender=1")).await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("value=\"7.255\""));
    assert!(!html.contains("value=\"7.26\""));
    assert!(html.contains("<option value=\"1\" selected>1</option></select></p><p><label for=\"hypertension\""));
}

/// Forest wrapper whose scoring outlasts any short request timeout.
struct SlowClassifier {
    inner: Arc<RandomForest>,
}

impl Classifier for SlowClassifier {
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
        std::thread::sleep(Duration::from_millis(300));
        self.inner.predict_proba(row)
    }
}

#[tokio::test]
async fn slow_classifier_times_out_with_gateway_timeout() {
    let dir = TempDir::new().unwrap();
    let config = AppConfig {
        model_path: demo_model_path(),
        output_dir: dir.path().to_path_buf(),
        inference_timeout_ms: 1,
        ..AppConfig::default()
    };
    let forest = Arc::new(RandomForest::load(demo_model_path()).unwrap());
    let service = InferenceService::new(
        FeatureSchema::charls(),
        Arc::new(SlowClassifier {
            inner: forest.clone(),
        }),
        Arc::new(TreeExplainer::new(forest)),
    )
    .unwrap();
    let app = build_router(WebState::new(Arc::new(service), &config));

    let (status, body) = send(&app, json_post("/api/predict", json!({}))).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    let err: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(err["stage"], "predict");
    assert!(err["error"].as_str().unwrap().contains("timed out after 1 ms"));
    assert!(!dir.path().join("prediction_text.png").exists());
}
