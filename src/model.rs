//! Seams between the pipeline and its two externally supplied artifacts.
//!
//! The pipeline only talks to a [`Classifier`] and an [`AttributionEngine`];
//! the random forest in [`crate::forest_model`] and the TreeSHAP engine in
//! [`crate::tree_explainer`] are the implementations shipped with the crate.

use crate::errors::{PipelineError, PipelineResult};

/// Class label as encoded by the classifier (e.g. `0` = no AKI, `1` = AKI).
pub type ClassLabel = i64;

/// A trained, read-only classifier.
pub trait Classifier: Send + Sync {
    fn model_id(&self) -> &str;

    /// Column names in the order the model was fit on.
    fn feature_names(&self) -> &[String];

    /// Class labels, in the order of the probability vector.
    fn classes(&self) -> &[ClassLabel];

    /// Per-class probabilities for a single row.
    fn predict_proba(&self, row: &[f64]) -> PipelineResult<Vec<f64>>;

    /// Label of the most probable class. Ties go to the first class.
    fn predict(&self, row: &[f64]) -> PipelineResult<ClassLabel> {
        let proba = self.predict_proba(row)?;
        let index = argmax(&proba)
            .ok_or_else(|| PipelineError::model_invocation("classifier returned no probabilities"))?;
        self.classes().get(index).copied().ok_or_else(|| {
            PipelineError::model_invocation(format!(
                "probability vector has {} entries but only {} classes are known",
                proba.len(),
                self.classes().len()
            ))
        })
    }
}

/// Per-feature attribution for a single row.
pub trait AttributionEngine: Send + Sync {
    /// Class labels in the order of [`AttributionEngine::expected_values`].
    fn classes(&self) -> &[ClassLabel];

    /// Baseline model output per class.
    fn expected_values(&self) -> &[f64];

    /// Contributions indexed `[feature][class]`.
    fn shap_values(&self, row: &[f64]) -> PipelineResult<Vec<Vec<f64>>>;
}

/// Index of the first maximal element.
pub fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_prefers_first_of_ties() {
        assert_eq!(argmax(&[0.5, 0.5]), Some(0));
        assert_eq!(argmax(&[0.2, 0.7, 0.1]), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}
