//! HTTP surface: the single-page prediction form plus a JSON API.
//!
//! Runs are serialized behind one lock so the two artifact files are never
//! written by two requests at once. Model and explainer calls run on the
//! blocking pool under the configured timeout.

use crate::config::AppConfig;
use crate::errors::{PipelineError, PipelineResult, RunFailure, Stage};
use crate::feature_schema::{FeatureKind, FeatureSchema};
use crate::input_validator::FeatureInput;
use crate::model::ClassLabel;
use crate::pipeline::{render_artifacts, render_failure, ArtifactPaths, InferenceService, PipelineRun};
use crate::prediction::FeatureContribution;

use axum::{
    extract::{Form, State},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Shared, read-only request state.
#[derive(Clone)]
pub struct WebState {
    service: Arc<InferenceService>,
    artifacts: ArtifactPaths,
    summary_file: String,
    attribution_file: String,
    output_dir: PathBuf,
    timeout: Duration,
    run_lock: Arc<Mutex<()>>,
}

impl WebState {
    pub fn new(service: Arc<InferenceService>, config: &AppConfig) -> Self {
        Self {
            service,
            artifacts: config.artifact_paths(),
            summary_file: config.summary_file.clone(),
            attribution_file: config.attribution_file.clone(),
            output_dir: config.output_dir.clone(),
            timeout: Duration::from_millis(config.inference_timeout_ms),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    fn timeout_millis(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Build the router: form, JSON API, health check and artifact files.
pub fn build_router(state: WebState) -> Router {
    let artifacts = ServeDir::new(&state.output_dir);
    Router::new()
        .route("/", get(form_page))
        .route("/predict", post(predict_form))
        .route("/api/predict", post(predict_json))
        .route("/api/schema", get(schema))
        .route("/healthz", get(healthz))
        .nest_service("/artifacts", artifacts)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run a model call on the blocking pool, bounded by the request timeout.
async fn bounded<T, F>(state: &WebState, stage: Stage, call: F) -> PipelineResult<T>
where
    T: Send + 'static,
    F: FnOnce(&InferenceService) -> PipelineResult<T> + Send + 'static,
{
    let service = state.service.clone();
    let task = tokio::task::spawn_blocking(move || call(&service));
    match tokio::time::timeout(state.timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(PipelineError::model_invocation(format!(
            "{stage} task aborted: {join}"
        ))),
        Err(_) => {
            warn!(%stage, millis = state.timeout_millis(), "stage timed out");
            Err(PipelineError::timeout(stage.to_string(), state.timeout_millis()))
        }
    }
}

/// The four stages, driven asynchronously. Same ordering and failure
/// semantics as [`InferenceService::run`].
async fn execute(state: &WebState, input: FeatureInput) -> Result<PipelineRun, RunFailure> {
    let _guard = state.run_lock.lock().await;
    let run_id = Uuid::new_v4();

    async move {
        let collected = state
            .service
            .collect(&input)
            .map_err(|e| RunFailure::at(Stage::Collect, e.into()))?;

        let vector = collected.vector.clone();
        let prediction = bounded(state, Stage::Predict, move |s| s.predict(&vector))
            .await
            .map_err(|e| RunFailure::at(Stage::Predict, e))?;

        let vector = collected.vector.clone();
        let class = prediction.predicted_class();
        let attribution = match bounded(state, Stage::Explain, move |s| s.explain(&vector, class)).await {
            Ok(a) => a,
            Err(e) => {
                return Err(RunFailure {
                    prediction: Some(prediction),
                    ..RunFailure::at(Stage::Explain, e)
                })
            }
        };

        let (p, a, paths) = (prediction.clone(), attribution.clone(), state.artifacts.clone());
        let rendered = tokio::task::spawn_blocking(move || render_artifacts(&p, &a, &paths))
            .await
            .unwrap_or_else(|join| {
                Err((
                    Stage::RenderSummary,
                    PipelineError::artifact_write("artifacts", join.to_string()),
                ))
            });
        if let Err((stage, e)) = rendered {
            return Err(render_failure(stage, e, prediction, attribution));
        }

        info!(
            predicted_class = prediction.predicted_class(),
            probability = prediction.predicted_probability(),
            "pipeline run complete"
        );
        Ok::<_, RunFailure>(PipelineRun::assemble(
            run_id,
            collected,
            prediction,
            attribution,
            state.artifacts.clone(),
        ))
    }
    .instrument(info_span!("pipeline_run", %run_id))
    .await
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn schema(State(state): State<WebState>) -> Json<FeatureSchema> {
    Json(state.service.schema().clone())
}

#[derive(Debug, Serialize)]
pub struct ClassProbability {
    pub class: ClassLabel,
    pub probability: f64,
}

#[derive(Debug, Serialize)]
pub struct ArtifactUrls {
    pub summary: String,
    pub attribution: String,
}

/// JSON body of a successful `/api/predict`.
#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub run_id: Uuid,
    pub predicted_class: ClassLabel,
    pub probability: f64,
    pub probabilities: Vec<ClassProbability>,
    pub defaulted: Vec<String>,
    pub baseline: f64,
    pub contributions: Vec<FeatureContribution>,
    pub artifacts: ArtifactUrls,
}

impl WebState {
    fn artifact_urls(&self, run_id: Uuid) -> ArtifactUrls {
        ArtifactUrls {
            summary: format!("/artifacts/{}?run={run_id}", self.summary_file),
            attribution: format!("/artifacts/{}?run={run_id}", self.attribution_file),
        }
    }
}

async fn predict_json(
    State(state): State<WebState>,
    Json(input): Json<FeatureInput>,
) -> Result<Json<PredictResponse>, RunFailure> {
    let run = execute(&state, input).await?;
    let prediction = &run.prediction;
    Ok(Json(PredictResponse {
        run_id: run.run_id,
        predicted_class: prediction.predicted_class(),
        probability: prediction.predicted_probability(),
        probabilities: prediction
            .classes()
            .iter()
            .zip(prediction.probabilities())
            .map(|(&class, &probability)| ClassProbability { class, probability })
            .collect(),
        defaulted: run.defaulted.clone(),
        baseline: run.attribution.baseline,
        contributions: run.attribution.contributions.clone(),
        artifacts: state.artifact_urls(run.run_id),
    }))
}

async fn form_page(State(state): State<WebState>) -> Html<String> {
    Html(page(&render_form(state.service.schema(), &[]), ""))
}

async fn predict_form(
    State(state): State<WebState>,
    Form(fields): Form<Vec<(String, String)>>,
) -> Response {
    let schema = state.service.schema();
    let input = match FeatureInput::from_fields(fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))) {
        Ok(input) => input,
        Err(e) => {
            let failure = RunFailure::at(Stage::Collect, e.into());
            return error_page(schema, &fields, &failure);
        }
    };

    match execute(&state, input).await {
        Ok(run) => {
            let urls = state.artifact_urls(run.run_id);
            let mut result = String::new();
            let _ = write!(
                result,
                "<section class=\"result\"><h2>Result</h2><p>{}</p>",
                escape(&run.prediction.summary_text())
            );
            if !run.defaulted.is_empty() {
                let _ = write!(
                    result,
                    "<p>Defaults used for: {}</p>",
                    escape(&run.defaulted.join(", "))
                );
            }
            let _ = write!(
                result,
                "<img alt=\"prediction summary\" src=\"{}\"><img alt=\"feature attribution\" src=\"{}\"></section>",
                escape(&urls.summary),
                escape(&urls.attribution)
            );
            Html(page(&render_form(schema, &fields), &result)).into_response()
        }
        Err(failure) => error_page(schema, &fields, &failure),
    }
}

fn error_page(schema: &FeatureSchema, submitted: &[(String, String)], failure: &RunFailure) -> Response {
    let status = failure.error.status();
    let message = format!(
        "<section class=\"error\"><h2>{} failed</h2><p>{}</p></section>",
        failure.stage,
        escape(&failure.error.to_string())
    );
    (status, Html(page(&render_form(schema, submitted), &message))).into_response()
}

fn page(form: &str, result: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>AKI risk prediction</title></head>\
         <body><h1>AKI risk prediction</h1>{form}{result}</body></html>"
    )
}

/// The last non-blank value submitted for `name`, as typed.
fn submitted_value<'a>(submitted: &'a [(String, String)], name: &str) -> Option<&'a str> {
    submitted
        .iter()
        .rev()
        .find(|(field, raw)| field == name && !raw.trim().is_empty())
        .map(|(_, raw)| raw.trim())
}

/// One input per schema entry. Submitted text is shown exactly as entered;
/// untouched fields show their defaults.
fn render_form(schema: &FeatureSchema, submitted: &[(String, String)]) -> String {
    let mut html = String::from("<form method=\"post\" action=\"/predict\">");
    for spec in schema.specs() {
        let raw = submitted_value(submitted, spec.name);
        let _ = write!(
            html,
            "<p><label for=\"{name}\" title=\"{desc}\">{label}</label> ",
            name = spec.name,
            desc = escape(spec.description),
            label = escape(&spec.label())
        );
        match &spec.kind {
            FeatureKind::Numerical {
                minimum, maximum, ..
            } => {
                let _ = write!(
                    html,
                    "<input type=\"number\" step=\"any\" id=\"{name}\" name=\"{name}\" min=\"{minimum}\" max=\"{maximum}\" value=\"{value}\">",
                    name = spec.name,
                    value = raw.map_or_else(|| spec.default_value().to_string(), escape)
                );
            }
            FeatureKind::Categorical { options, default } => {
                let chosen = raw
                    .and_then(|r| r.parse::<f64>().ok())
                    .filter(|v| options.iter().any(|o| *o as f64 == *v))
                    .unwrap_or(*default as f64);
                let _ = write!(html, "<select id=\"{name}\" name=\"{name}\">", name = spec.name);
                for option in options {
                    let selected = if *option as f64 == chosen { " selected" } else { "" };
                    let _ = write!(html, "<option value=\"{option}\"{selected}>{option}</option>");
                }
                html.push_str("</select>");
            }
        }
        html.push_str("</p>");
    }
    html.push_str("<button type=\"submit\">Predict</button></form>");
    html
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
