//! Exact TreeSHAP attribution for [`RandomForest`].
//!
//! Contributions are computed per tree with the path-dependent algorithm
//! (Lundberg et al., "Consistent Individualized Feature Attribution for Tree
//! Ensembles") and averaged over the forest, matching how the forest
//! averages leaf distributions. For every class,
//! `expected_value + sum(contributions) == predict_proba`.

use crate::errors::{PipelineError, PipelineResult};
use crate::forest_model::{DecisionTree, RandomForest, TreeNode};
use crate::model::{AttributionEngine, ClassLabel};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    weight: f64,
}

/// Attribution engine bound to one loaded forest.
pub struct TreeExplainer {
    forest: Arc<RandomForest>,
    expected_values: Vec<f64>,
}

impl TreeExplainer {
    pub fn new(forest: Arc<RandomForest>) -> Self {
        let n_classes = forest.classes.len();
        let mut expected_values = vec![0.0; n_classes];
        for tree in &forest.trees {
            let root_cover = tree.nodes[0].cover();
            for node in &tree.nodes {
                if let TreeNode::Leaf { cover, value } = node {
                    for (e, v) in expected_values.iter_mut().zip(value) {
                        *e += cover / root_cover * v;
                    }
                }
            }
        }
        let n = forest.trees.len() as f64;
        expected_values.iter_mut().for_each(|e| *e /= n);
        debug!(expected_values = ?expected_values, "tree explainer ready");
        Self {
            forest,
            expected_values,
        }
    }

    fn tree_shap(&self, tree: &DecisionTree, row: &[f64], phi: &mut [Vec<f64>]) {
        recurse(tree, row, phi, 0, Vec::with_capacity(16), 1.0, 1.0, None);
    }
}

impl AttributionEngine for TreeExplainer {
    fn classes(&self) -> &[ClassLabel] {
        &self.forest.classes
    }

    fn expected_values(&self) -> &[f64] {
        &self.expected_values
    }

    fn shap_values(&self, row: &[f64]) -> PipelineResult<Vec<Vec<f64>>> {
        self.forest
            .check_row(row)
            .map_err(|e| PipelineError::explainer(e.to_string()))?;
        let n_classes = self.forest.classes.len();
        let mut phi = vec![vec![0.0; n_classes]; row.len()];
        for tree in &self.forest.trees {
            self.tree_shap(tree, row, &mut phi);
        }
        let n = self.forest.trees.len() as f64;
        for per_class in phi.iter_mut() {
            per_class.iter_mut().for_each(|v| *v /= n);
        }
        Ok(phi)
    }
}

#[allow(clippy::too_many_arguments)]
fn recurse(
    tree: &DecisionTree,
    row: &[f64],
    phi: &mut [Vec<f64>],
    node: usize,
    mut path: Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    extend_path(&mut path, zero_fraction, one_fraction, feature);
    let depth = path.len() - 1;

    match &tree.nodes[node] {
        TreeNode::Leaf { value, .. } => {
            for i in 1..=depth {
                let w = unwound_path_sum(&path, i);
                let el = path[i];
                if let Some(f) = el.feature {
                    let scale = w * (el.one_fraction - el.zero_fraction);
                    for (p, v) in phi[f].iter_mut().zip(value) {
                        *p += scale * v;
                    }
                }
            }
        }
        TreeNode::Split {
            feature: split,
            threshold,
            left,
            right,
            cover,
        } => {
            let (hot, cold) = if row[*split] <= *threshold {
                (*left, *right)
            } else {
                (*right, *left)
            };
            let hot_zero = tree.nodes[hot].cover() / cover;
            let cold_zero = tree.nodes[cold].cover() / cover;

            // A feature already on the path is undone so the split is counted once.
            let mut incoming_zero = 1.0;
            let mut incoming_one = 1.0;
            if let Some(k) = path.iter().position(|el| el.feature == Some(*split)) {
                incoming_zero = path[k].zero_fraction;
                incoming_one = path[k].one_fraction;
                unwind_path(&mut path, k);
            }

            recurse(
                tree,
                row,
                phi,
                hot,
                path.clone(),
                hot_zero * incoming_zero,
                incoming_one,
                Some(*split),
            );
            recurse(
                tree,
                row,
                phi,
                cold,
                path,
                cold_zero * incoming_zero,
                0.0,
                Some(*split),
            );
        }
    }
}

fn extend_path(path: &mut Vec<PathElement>, zero_fraction: f64, one_fraction: f64, feature: Option<usize>) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        weight: if depth == 0 { 1.0 } else { 0.0 },
    });
    let d = depth as f64;
    for i in (0..depth).rev() {
        path[i + 1].weight += one_fraction * path[i].weight * (i as f64 + 1.0) / (d + 1.0);
        path[i].weight = zero_fraction * path[i].weight * (d - i as f64) / (d + 1.0);
    }
}

fn unwind_path(path: &mut Vec<PathElement>, index: usize) {
    let depth = path.len() - 1;
    let d = depth as f64;
    let one_fraction = path[index].one_fraction;
    let zero_fraction = path[index].zero_fraction;
    let mut next_one_portion = path[depth].weight;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = path[i].weight;
            path[i].weight = next_one_portion * (d + 1.0) / ((i as f64 + 1.0) * one_fraction);
            next_one_portion = tmp - path[i].weight * zero_fraction * (d - i as f64) / (d + 1.0);
        } else {
            path[i].weight = path[i].weight * (d + 1.0) / (zero_fraction * (d - i as f64));
        }
    }

    for i in index..depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
    path.pop();
}

fn unwound_path_sum(path: &[PathElement], index: usize) -> f64 {
    let depth = path.len() - 1;
    let d = depth as f64;
    let one_fraction = path[index].one_fraction;
    let zero_fraction = path[index].zero_fraction;
    let mut next_one_portion = path[depth].weight;
    let mut total = 0.0;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = next_one_portion * (d + 1.0) / ((i as f64 + 1.0) * one_fraction);
            total += tmp;
            next_one_portion = path[i].weight - tmp * zero_fraction * ((d - i as f64) / (d + 1.0));
        } else if zero_fraction != 0.0 {
            total += (path[i].weight / zero_fraction) / ((d - i as f64) / (d + 1.0));
        }
    }
    total
}
