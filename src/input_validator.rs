//! Input collection: turns caller-supplied feature values into a validated
//! [`FeatureVector`] in schema order.
//!
//! Values outside a feature's domain are rejected, never clamped. A feature
//! the caller left out takes its declared default, and every such
//! substitution is reported on [`CollectedInput::defaulted`] and logged.

use crate::errors::{PipelineResult, ValidationError, Violation};
use crate::feature_schema::{FeatureSchema, FeatureVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Raw feature values keyed by feature name, as supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureInput {
    values: BTreeMap<String, f64>,
}

impl FeatureInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) -> &mut Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse `name=value` assignments, as given on the command line.
    pub fn from_assignments<S: AsRef<str>>(pairs: &[S]) -> Result<Self, ValidationError> {
        let mut input = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (name, raw) = pair.split_once('=').ok_or_else(|| {
                ValidationError::new(
                    pair,
                    Violation::Unparseable {
                        raw: pair.to_string(),
                    },
                )
            })?;
            let name = name.trim();
            input.set(name, parse_value(name, raw)?);
        }
        Ok(input)
    }

    /// Build input from string fields, e.g. an HTML form submission. Blank
    /// fields count as not supplied.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut input = Self::new();
        for (name, raw) in fields {
            if raw.trim().is_empty() {
                continue;
            }
            input.set(name, parse_value(name, raw)?);
        }
        Ok(input)
    }

    /// Read a JSON object of `{ "feature": number }` from disk.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::errors::PipelineError::io(format!("reading input {}", path.display()), e)
        })?;
        serde_json::from_str(&content).map_err(|e| {
            crate::errors::PipelineError::serialization(
                format!("parsing input {}", path.display()),
                e,
            )
        })
    }

    /// Overlay `other` on top of this input; values in `other` win.
    pub fn merge(&mut self, other: FeatureInput) {
        self.values.extend(other.values);
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

fn parse_value(name: &str, raw: &str) -> Result<f64, ValidationError> {
    raw.trim().parse::<f64>().map_err(|_| {
        ValidationError::new(
            name,
            Violation::Unparseable {
                raw: raw.to_string(),
            },
        )
    })
}

/// A validated feature vector plus the features that fell back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectedInput {
    pub vector: FeatureVector,
    pub defaulted: Vec<String>,
}

/// Validate `input` against `schema` and assemble the model row.
///
/// Unknown names are rejected first, then each feature is checked in schema
/// order; the first violation is returned.
pub fn collect(schema: &FeatureSchema, input: &FeatureInput) -> Result<CollectedInput, ValidationError> {
    if let Some(unknown) = input.names().find(|name| schema.get(name).is_none()) {
        return Err(ValidationError::new(unknown, Violation::UnknownFeature));
    }

    let mut values = Vec::with_capacity(schema.len());
    let mut defaulted = Vec::new();
    for spec in schema.specs() {
        let value = match input.get(spec.name) {
            Some(v) => spec.check(v)?,
            None => {
                let d = spec.default_value();
                info!(feature = spec.name, default = d, "no value supplied, using declared default");
                defaulted.push(spec.name.to_string());
                d
            }
        };
        values.push(value);
    }

    debug!(supplied = input.len(), defaulted = defaulted.len(), "input collected");
    Ok(CollectedInput {
        vector: FeatureVector::new(values),
        defaulted,
    })
}
