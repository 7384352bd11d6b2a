//! Random-forest classifier loaded from a JSON artifact.
//!
//! Each tree is a flat node array with the root at index 0. A split sends a
//! row left when `row[feature] <= threshold`. Leaves hold per-class
//! fractions, and the forest probability is the mean leaf distribution over
//! all trees. Every node carries its training `cover` (sample weight), which
//! the attribution engine needs.

use crate::errors::{PipelineError, PipelineResult};
use crate::model::{ClassLabel, Classifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

const COVER_TOLERANCE: f64 = 1e-6;
const DISTRIBUTION_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        cover: f64,
    },
    Leaf {
        cover: f64,
        value: Vec<f64>,
    },
}

impl TreeNode {
    pub fn cover(&self) -> f64 {
        match self {
            TreeNode::Split { cover, .. } | TreeNode::Leaf { cover, .. } => *cover,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    /// Leaf distribution reached by `row`.
    pub fn leaf_value(&self, row: &[f64]) -> &[f64] {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    index = if row[*feature] <= *threshold { *left } else { *right };
                }
                TreeNode::Leaf { value, .. } => return value,
            }
        }
    }

    fn validate(&self, tree_index: usize, n_features: usize, n_classes: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err(format!("tree {tree_index} has no nodes"));
        }
        let mut parents = vec![0usize; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            let cover = node.cover();
            if !cover.is_finite() || cover <= 0.0 {
                return Err(format!("tree {tree_index} node {i} has invalid cover {cover}"));
            }
            match node {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= n_features {
                        return Err(format!(
                            "tree {tree_index} node {i} splits on feature {feature}, model has {n_features}"
                        ));
                    }
                    if !threshold.is_finite() {
                        return Err(format!("tree {tree_index} node {i} has a non-finite threshold"));
                    }
                    for &child in [left, right] {
                        if child <= i || child >= self.nodes.len() {
                            return Err(format!(
                                "tree {tree_index} node {i} points at invalid child {child}"
                            ));
                        }
                        parents[child] += 1;
                    }
                    let children = self.nodes[*left].cover() + self.nodes[*right].cover();
                    if (children - cover).abs() > COVER_TOLERANCE * cover.max(1.0) {
                        return Err(format!(
                            "tree {tree_index} node {i} cover {cover} differs from its children's total {children}"
                        ));
                    }
                }
                TreeNode::Leaf { value, .. } => {
                    if value.len() != n_classes {
                        return Err(format!(
                            "tree {tree_index} leaf {i} has {} class values, model has {n_classes} classes",
                            value.len()
                        ));
                    }
                    if value.iter().any(|v| !v.is_finite() || *v < 0.0) {
                        return Err(format!("tree {tree_index} leaf {i} has a negative or non-finite value"));
                    }
                    let total: f64 = value.iter().sum();
                    if (total - 1.0).abs() > DISTRIBUTION_TOLERANCE {
                        return Err(format!(
                            "tree {tree_index} leaf {i} distribution sums to {total}, expected 1"
                        ));
                    }
                }
            }
        }
        if parents[0] != 0 {
            return Err(format!("tree {tree_index} root has a parent"));
        }
        if let Some(orphan) = parents.iter().skip(1).position(|&p| p != 1) {
            return Err(format!(
                "tree {tree_index} node {} is not reached exactly once",
                orphan + 1
            ));
        }
        Ok(())
    }
}

/// Serialized random-forest classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub model_id: String,
    pub feature_names: Vec<String>,
    pub classes: Vec<ClassLabel>,
    pub trees: Vec<DecisionTree>,
    #[serde(skip)]
    digest: Option<String>,
}

impl RandomForest {
    /// Load and validate a forest from disk. Any failure here is fatal for
    /// the caller; nothing is partially loaded.
    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let bytes = std::fs::read(path)
            .map_err(|e| PipelineError::model_load(&shown, format!("cannot read artifact: {e}")))?;
        let digest = format!("{:x}", Sha256::digest(&bytes));

        let mut forest: RandomForest = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::model_load(&shown, format!("invalid model JSON: {e}")))?;
        forest
            .validate()
            .map_err(|message| PipelineError::model_load(&shown, message))?;
        forest.digest = Some(digest);

        info!(
            model_id = %forest.model_id,
            trees = forest.trees.len(),
            classes = ?forest.classes,
            sha256 = forest.digest.as_deref().unwrap_or_default(),
            "loaded random forest from {}",
            shown
        );
        Ok(forest)
    }

    /// Parse and validate a forest held in memory.
    pub fn from_json_str(json: &str) -> PipelineResult<Self> {
        let forest: RandomForest = serde_json::from_str(json)
            .map_err(|e| PipelineError::model_load("<memory>", format!("invalid model JSON: {e}")))?;
        forest
            .validate()
            .map_err(|message| PipelineError::model_load("<memory>", message))?;
        Ok(forest)
    }

    /// Build a forest from parts, validating it the same way as a loaded one.
    pub fn from_parts(
        model_id: impl Into<String>,
        feature_names: Vec<String>,
        classes: Vec<ClassLabel>,
        trees: Vec<DecisionTree>,
    ) -> PipelineResult<Self> {
        let forest = Self {
            model_id: model_id.into(),
            feature_names,
            classes,
            trees,
            digest: None,
        };
        forest
            .validate()
            .map_err(|message| PipelineError::model_load("<memory>", message))?;
        Ok(forest)
    }

    /// SHA-256 of the artifact bytes, when loaded from disk.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    fn validate(&self) -> Result<(), String> {
        if self.classes.len() < 2 {
            return Err(format!("model declares {} classes, need at least 2", self.classes.len()));
        }
        let unique: HashSet<_> = self.classes.iter().collect();
        if unique.len() != self.classes.len() {
            return Err("model class labels are not unique".into());
        }
        let names: HashSet<_> = self.feature_names.iter().collect();
        if names.len() != self.feature_names.len() {
            return Err("model feature names are not unique".into());
        }
        if self.trees.is_empty() {
            return Err("model has no trees".into());
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(i, self.feature_names.len(), self.classes.len())?;
        }
        debug!(model_id = %self.model_id, "model structure validated");
        Ok(())
    }

    /// Reject rows the forest cannot score.
    pub fn check_row(&self, row: &[f64]) -> PipelineResult<()> {
        if row.len() != self.n_features() {
            return Err(PipelineError::model_invocation(format!(
                "expected {} feature values, got {}",
                self.n_features(),
                row.len()
            )));
        }
        if let Some(i) = row.iter().position(|v| !v.is_finite()) {
            return Err(PipelineError::model_invocation(format!(
                "feature '{}' is not a finite number",
                self.feature_names[i]
            )));
        }
        Ok(())
    }
}

impl Classifier for RandomForest {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn classes(&self) -> &[ClassLabel] {
        &self.classes
    }

    fn predict_proba(&self, row: &[f64]) -> PipelineResult<Vec<f64>> {
        self.check_row(row)?;
        let mut proba = vec![0.0; self.classes.len()];
        for tree in &self.trees {
            for (p, v) in proba.iter_mut().zip(tree.leaf_value(row)) {
                *p += v;
            }
        }
        let n = self.trees.len() as f64;
        proba.iter_mut().for_each(|p| *p /= n);
        Ok(proba)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stump(feature: usize, threshold: f64, left: [f64; 2], right: [f64; 2]) -> DecisionTree {
        DecisionTree {
            nodes: vec![
                TreeNode::Split {
                    feature,
                    threshold,
                    left: 1,
                    right: 2,
                    cover: 10.0,
                },
                TreeNode::Leaf {
                    cover: 6.0,
                    value: left.to_vec(),
                },
                TreeNode::Leaf {
                    cover: 4.0,
                    value: right.to_vec(),
                },
            ],
        }
    }

    fn two_feature_forest() -> RandomForest {
        RandomForest::from_parts(
            "test",
            vec!["a".into(), "b".into()],
            vec![0, 1],
            vec![
                stump(0, 0.5, [0.9, 0.1], [0.2, 0.8]),
                stump(1, 2.0, [0.7, 0.3], [0.4, 0.6]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_predict_proba_averages_trees() {
        let forest = two_feature_forest();
        let proba = forest.predict_proba(&[1.0, 1.0]).unwrap();
        assert!((proba[0] - 0.45).abs() < 1e-12);
        assert!((proba[1] - 0.55).abs() < 1e-12);
        assert_eq!(forest.predict(&[1.0, 1.0]).unwrap(), 1);
        assert_eq!(forest.predict(&[0.0, 1.0]).unwrap(), 0);
    }

    #[test]
    fn test_threshold_goes_left_when_equal() {
        let forest = two_feature_forest();
        let proba = forest.predict_proba(&[0.5, 2.0]).unwrap();
        assert!((proba[0] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_wrong_row_length_is_an_invocation_error() {
        let forest = two_feature_forest();
        let err = forest.predict_proba(&[1.0]).unwrap_err();
        assert!(matches!(err, PipelineError::ModelInvocation { .. }));
        let err = forest.predict_proba(&[1.0, f64::NAN]).unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_inconsistent_cover_is_rejected() {
        let mut tree = stump(0, 0.5, [0.5, 0.5], [0.5, 0.5]);
        tree.nodes[2] = TreeNode::Leaf {
            cover: 5.0,
            value: vec![0.5, 0.5],
        };
        let err = RandomForest::from_parts("bad", vec!["a".into()], vec![0, 1], vec![tree]).unwrap_err();
        assert!(err.to_string().contains("cover"));
    }

    #[test]
    fn test_leaf_distribution_must_sum_to_one() {
        let tree = stump(0, 0.5, [0.5, 0.6], [0.5, 0.5]);
        assert!(RandomForest::from_parts("bad", vec!["a".into()], vec![0, 1], vec![tree]).is_err());
    }

    #[test]
    fn test_cyclic_child_is_rejected() {
        let mut tree = stump(0, 0.5, [0.5, 0.5], [0.5, 0.5]);
        tree.nodes[0] = TreeNode::Split {
            feature: 0,
            threshold: 0.5,
            left: 0,
            right: 2,
            cover: 10.0,
        };
        assert!(RandomForest::from_parts("bad", vec!["a".into()], vec![0, 1], vec![tree]).is_err());
    }

    #[test]
    fn test_load_from_disk_records_digest() {
        let forest = two_feature_forest();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, serde_json::to_string(&forest).unwrap()).unwrap();

        let loaded = RandomForest::load(&path).unwrap();
        assert_eq!(loaded.trees, forest.trees);
        assert_eq!(loaded.digest().map(str::len), Some(64));
    }

    #[test]
    fn test_missing_artifact_is_a_load_error() {
        let err = RandomForest::load("/nonexistent/model.json").unwrap_err();
        assert!(matches!(err, PipelineError::ModelLoad { .. }));
    }
}
