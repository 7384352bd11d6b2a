//! Immutable results handed from the model stages to the renderers.

use crate::model::ClassLabel;
use serde::Serialize;

/// Output of the predict stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    predicted_class: ClassLabel,
    class_index: usize,
    classes: Vec<ClassLabel>,
    probabilities: Vec<f64>,
}

impl PredictionResult {
    pub(crate) fn new(
        predicted_class: ClassLabel,
        class_index: usize,
        classes: Vec<ClassLabel>,
        probabilities: Vec<f64>,
    ) -> Self {
        Self {
            predicted_class,
            class_index,
            classes,
            probabilities,
        }
    }

    pub fn predicted_class(&self) -> ClassLabel {
        self.predicted_class
    }

    /// Position of the predicted class in [`PredictionResult::classes`].
    pub fn class_index(&self) -> usize {
        self.class_index
    }

    pub fn classes(&self) -> &[ClassLabel] {
        &self.classes
    }

    /// Full class-probability distribution, aligned with `classes()`.
    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    /// Probability mass on the predicted class.
    pub fn predicted_probability(&self) -> f64 {
        self.probabilities[self.class_index]
    }

    /// Text shown on the summary image.
    pub fn summary_text(&self) -> String {
        format!(
            "Based on feature values, predicted possibility of AKI is {:.2}%",
            self.predicted_probability() * 100.0
        )
    }
}

/// One feature's share of the push from baseline to output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureContribution {
    pub feature: String,
    pub value: f64,
    /// Value as shown in reports (`63.48`, `1`).
    pub display_value: String,
    pub contribution: f64,
}

/// Output of the explain stage, for the predicted class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionReport {
    pub explained_class: ClassLabel,
    pub baseline: f64,
    pub contributions: Vec<FeatureContribution>,
}

impl AttributionReport {
    /// Baseline plus every contribution: the explained class's model output.
    pub fn output_value(&self) -> f64 {
        self.baseline + self.contributions.iter().map(|c| c.contribution).sum::<f64>()
    }

    /// Contributions ordered by magnitude, largest first.
    pub fn ranked(&self) -> Vec<&FeatureContribution> {
        let mut ranked: Vec<&FeatureContribution> = self.contributions.iter().collect();
        ranked.sort_by(|a, b| b.contribution.abs().total_cmp(&a.contribution.abs()));
        ranked
    }
}
