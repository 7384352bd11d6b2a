use crate::config::AppConfig;
use crate::errors::PipelineError;
use crate::feature_schema::FeatureKind;
use crate::input_validator::FeatureInput;
use crate::pipeline::{InferenceService, PipelineRun};
use crate::web::{build_router, WebState};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Top-level CLI for the AKI risk predictor
#[derive(Parser, Debug)]
#[command(
    name = "aki_predict",
    version,
    about = "AKI risk prediction with per-feature attribution"
)]
pub struct Cli {
    /// Config file (defaults to ./aki_predict.toml when present)
    #[arg(long, global = true, env = "AKI_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the ordered feature schema with domains and defaults
    Schema,

    /// Run one prediction and write both report images
    Predict {
        /// Feature assignment, e.g. `--set age=71`; repeatable
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,
        /// JSON object of feature values; `--set` entries override it
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Directory for the report images
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Load the model and print its metadata and baselines
    Inspect,

    /// Serve the HTML form and JSON API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

/// Execute a parsed command against a loaded configuration.
pub fn dispatch(cli: Cli, mut config: AppConfig) -> anyhow::Result<()> {
    match cli.command {
        Commands::Schema => {
            print_schema();
            Ok(())
        }
        Commands::Inspect => {
            let service = load_service(&config)?;
            print_inspect(&service);
            Ok(())
        }
        Commands::Predict {
            set,
            input,
            output_dir,
        } => {
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            let report = predict(&config, &set, input.as_deref())?;
            print!("{report}");
            Ok(())
        }
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config)
        }
    }
}

/// Run one prediction and return the report text.
///
/// A failed run yields only the error; nothing computed before the failure
/// is reported.
fn predict(config: &AppConfig, set: &[String], input: Option<&Path>) -> anyhow::Result<String> {
    let service = load_service(config)?;
    let mut values = match input {
        Some(path) => FeatureInput::from_json_file(path)?,
        None => FeatureInput::new(),
    };
    values.merge(FeatureInput::from_assignments(set).map_err(PipelineError::from)?);

    std::fs::create_dir_all(&config.output_dir)
        .map_err(|e| PipelineError::io("creating output directory", e))?;
    let run = service.run(&values, &config.artifact_paths())?;
    Ok(report_text(&run))
}

fn load_service(config: &AppConfig) -> anyhow::Result<InferenceService> {
    InferenceService::load(config)
        .with_context(|| format!("failed to load model from {}", config.model_path.display()))
}

fn serve(config: AppConfig) -> anyhow::Result<()> {
    let service = Arc::new(load_service(&config)?);
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir.display()))?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = build_router(WebState::new(service, &config));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build Tokio runtime")?;

    rt.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("HTTP server listening on http://{addr}");
        axum::serve(listener, app).await.context("server error")
    })
}

fn print_schema() {
    let schema = crate::feature_schema::FeatureSchema::charls();
    for (i, spec) in schema.specs().iter().enumerate() {
        let domain = match &spec.kind {
            FeatureKind::Numerical {
                minimum, maximum, ..
            } => format!("[{minimum}, {maximum}]"),
            FeatureKind::Categorical { options, .. } => format!("{options:?}"),
        };
        println!(
            "{:>2}. {:<28} {:<18} default {:<6} {}",
            i + 1,
            spec.name,
            domain,
            spec.format_value(spec.default_value()),
            spec.description
        );
    }
}

fn print_inspect(service: &InferenceService) {
    let classifier = service.classifier();
    println!("model:     {}", classifier.model_id());
    println!("features:  {}", classifier.feature_names().len());
    println!("classes:   {:?}", classifier.classes());
    let baselines = service.explainer().expected_values();
    for (class, baseline) in classifier.classes().iter().zip(baselines) {
        println!("baseline[{class}] = {baseline:.4}");
    }
}

fn report_text(run: &PipelineRun) -> String {
    let prediction = &run.prediction;
    let mut out = String::new();
    let _ = writeln!(out, "{}", prediction.summary_text());
    let _ = writeln!(out, "predicted class: {}", prediction.predicted_class());
    for (class, p) in prediction.classes().iter().zip(prediction.probabilities()) {
        let _ = writeln!(out, "  P(class {class}) = {p:.4}");
    }
    if !run.defaulted.is_empty() {
        let _ = writeln!(out, "defaults used: {}", run.defaulted.join(", "));
    }
    let _ = writeln!(out, "top contributions (baseline {:.4}):", run.attribution.baseline);
    for c in run.attribution.ranked().into_iter().take(5) {
        let _ = writeln!(out, "  {:<28} = {:<6} {:+.4}", c.feature, c.display_value, c.contribution);
    }
    let _ = writeln!(out, "summary:     {}", run.artifacts.summary.display());
    let _ = writeln!(out, "attribution: {}", run.artifacts.attribution.display());
    out
}
