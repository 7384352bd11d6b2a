//! Schema registry for the fifteen model inputs.
//!
//! The order of [`FeatureSchema::charls`] is the column order the classifier
//! and the attribution engine were fit on. Reordering it silently corrupts
//! predictions, so model loading compares the artifact's feature names
//! against this order position by position.

use crate::errors::{ValidationError, Violation};
use serde::Serialize;

/// Domain of one model input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKind {
    Numerical {
        minimum: f64,
        maximum: f64,
        default: f64,
    },
    Categorical {
        options: Vec<i64>,
        default: i64,
    },
}

/// Declarative constraint and default for one model input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSpec {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(flatten)]
    pub kind: FeatureKind,
}

impl FeatureSpec {
    pub const fn numerical(
        name: &'static str,
        description: &'static str,
        minimum: f64,
        maximum: f64,
        default: f64,
    ) -> Self {
        Self {
            name,
            description,
            kind: FeatureKind::Numerical {
                minimum,
                maximum,
                default,
            },
        }
    }

    pub fn categorical(
        name: &'static str,
        description: &'static str,
        options: &[i64],
        default: i64,
    ) -> Self {
        Self {
            name,
            description,
            kind: FeatureKind::Categorical {
                options: options.to_vec(),
                default,
            },
        }
    }

    pub fn default_value(&self) -> f64 {
        match &self.kind {
            FeatureKind::Numerical { default, .. } => *default,
            FeatureKind::Categorical { default, .. } => *default as f64,
        }
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self.kind, FeatureKind::Categorical { .. })
    }

    /// Check a value against this spec's domain. Numerical bounds are
    /// inclusive; categorical values must equal one of the option codes.
    pub fn check(&self, value: f64) -> Result<f64, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::new(self.name, Violation::NotFinite));
        }
        match &self.kind {
            FeatureKind::Numerical {
                minimum, maximum, ..
            } => {
                if value < *minimum {
                    Err(ValidationError::new(
                        self.name,
                        Violation::BelowMinimum {
                            value,
                            minimum: *minimum,
                        },
                    ))
                } else if value > *maximum {
                    Err(ValidationError::new(
                        self.name,
                        Violation::AboveMaximum {
                            value,
                            maximum: *maximum,
                        },
                    ))
                } else {
                    Ok(value)
                }
            }
            FeatureKind::Categorical { options, .. } => {
                if options.iter().any(|&o| o as f64 == value) {
                    Ok(value)
                } else {
                    Err(ValidationError::new(
                        self.name,
                        Violation::NotAnOption {
                            value,
                            options: options.clone(),
                        },
                    ))
                }
            }
        }
    }

    /// Form label, e.g. `age (45 - 100)` or `gender (Select a value)`.
    pub fn label(&self) -> String {
        match &self.kind {
            FeatureKind::Numerical {
                minimum, maximum, ..
            } => format!("{} ({} - {})", self.name, minimum, maximum),
            FeatureKind::Categorical { .. } => format!("{} (Select a value)", self.name),
        }
    }

    /// Render a vector value the way it is shown in reports: categorical
    /// codes as integers, numericals with up to two decimals.
    pub fn format_value(&self, value: f64) -> String {
        if self.is_categorical() {
            format!("{}", value as i64)
        } else {
            let s = format!("{value:.2}");
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        }
    }
}

/// Ordered, immutable feature registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSchema {
    specs: Vec<FeatureSpec>,
}

impl FeatureSchema {
    pub fn new(specs: Vec<FeatureSpec>) -> Self {
        Self { specs }
    }

    /// The CHARLS-derived AKI schema, in model column order.
    pub fn charls() -> Self {
        Self::new(vec![
            FeatureSpec::numerical("night_sleep_duration", "Night sleep, hours", 0.0, 12.0, 6.12),
            FeatureSpec::numerical("age", "Age, years", 45.0, 100.0, 63.48),
            FeatureSpec::categorical(
                "self_rated_health",
                "1 = very good ... 5 = very poor",
                &[1, 2, 3, 4, 5],
                3,
            ),
            FeatureSpec::categorical(
                "life_satisfaction",
                "1 = very satisfied ... 5 = very dissatisfied",
                &[1, 2, 3, 4, 5],
                3,
            ),
            FeatureSpec::numerical("nap_duration", "Daytime nap, minutes", 0.0, 180.0, 42.34),
            FeatureSpec::categorical(
                "distance_vision",
                "1 = excellent ... 5 = very poor",
                &[1, 2, 3, 4, 5],
                2,
            ),
            FeatureSpec::categorical(
                "education_level",
                "1 = no schooling ... 4 = high school or above",
                &[1, 2, 3, 4],
                1,
            ),
            FeatureSpec::numerical("household_size", "Persons in household", 1.0, 15.0, 2.73),
            FeatureSpec::categorical(
                "near_vision",
                "1 = excellent ... 5 = very poor",
                &[1, 2, 3, 4, 5],
                2,
            ),
            FeatureSpec::categorical(
                "hearing_status",
                "1 = excellent ... 5 = very poor",
                &[1, 2, 3, 4, 5],
                2,
            ),
            FeatureSpec::numerical(
                "hospitalizations_last_year",
                "Inpatient stays in the last year",
                0.0,
                10.0,
                0.27,
            ),
            FeatureSpec::categorical("arthritis", "0 = no, 1 = yes", &[0, 1], 0),
            FeatureSpec::categorical("residence_type", "0 = rural, 1 = urban", &[0, 1], 1),
            FeatureSpec::categorical("gender", "0 = female, 1 = male", &[0, 1], 0),
            FeatureSpec::categorical("hypertension", "0 = no, 1 = yes", &[0, 1], 0),
        ])
    }

    pub fn specs(&self) -> &[FeatureSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.specs.iter().map(|s| s.name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&FeatureSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.name == name)
    }

    /// A vector holding every declared default, in schema order.
    pub fn defaults(&self) -> FeatureVector {
        FeatureVector::new(self.specs.iter().map(FeatureSpec::default_value).collect())
    }

    /// Compare a model's column names against this schema. Returns the first
    /// position where they disagree.
    pub fn verify_column_order(&self, columns: &[String]) -> Result<(), String> {
        if columns.len() != self.specs.len() {
            return Err(format!(
                "model has {} feature columns, schema declares {}",
                columns.len(),
                self.specs.len()
            ));
        }
        for (i, (spec, column)) in self.specs.iter().zip(columns).enumerate() {
            if spec.name != column {
                return Err(format!(
                    "column {i} is '{column}' in the model but '{}' in the schema",
                    spec.name
                ));
            }
        }
        Ok(())
    }
}

/// One prediction's input row, in schema order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
