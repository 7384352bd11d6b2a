// config.rs
// Purpose: runtime configuration for the prediction service, layered as
// built-in defaults < TOML file < AKI_* environment variables.

use crate::errors::{PipelineError, PipelineResult};
use crate::pipeline::ArtifactPaths;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "aki_predict.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8501
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub model_path: PathBuf,
    pub output_dir: PathBuf,
    pub summary_file: String,
    pub attribution_file: String,
    pub inference_timeout_ms: u64,
    pub log_filter: String,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/rf_demo.json"),
            output_dir: PathBuf::from("."),
            summary_file: "prediction_text.png".to_string(),
            attribution_file: "shap_force_plot.png".to_string(),
            inference_timeout_ms: 5_000,
            log_filter: "info".to_string(),
            server: ServerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Layered figment: defaults, then the TOML file, then `AKI_` env vars
    /// (`AKI_SERVER__PORT=9000` sets `server.port`).
    pub fn figment(config_path: Option<&Path>) -> Figment {
        let file = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("AKI_").split("__"))
    }

    pub fn load(config_path: Option<&Path>) -> PipelineResult<Self> {
        let config: AppConfig = Self::figment(config_path).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.model_path.as_os_str().is_empty() {
            return Err(PipelineError::config("model_path must be set"));
        }
        if self.summary_file.trim().is_empty() || self.attribution_file.trim().is_empty() {
            return Err(PipelineError::config("artifact file names cannot be empty"));
        }
        if self.summary_file == self.attribution_file {
            return Err(PipelineError::config(
                "summary_file and attribution_file must differ",
            ));
        }
        if self.inference_timeout_ms == 0 {
            return Err(PipelineError::config("inference_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths::in_dir(&self.output_dir, &self.summary_file, &self.attribution_file)
    }
}
