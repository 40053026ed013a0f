//! Frozen anomaly model: standard scaler plus isolation forest.
//!
//! The model is exported once from training as JSON and only consumed
//! here. Inference follows the usual isolation-forest definition:
//! `score = -2^(-E[h(x)] / c(max_samples))`, `decision = score - offset`,
//! and a sample is anomalous when its decision value is negative.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::types::OptimizerError;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationTree {
    pub nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    pub max_samples: usize,
    pub offset: f64,
    pub trees: Vec<IsolationTree>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyModel {
    pub feature_names: Vec<String>,
    pub scaler: StandardScaler,
    pub forest: IsolationForest,
}

/// Model output for one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Decision value; negative means anomalous.
    pub anomaly_score: f64,
    pub is_anomaly: bool,
}

/// Average path length of an unsuccessful BST search over `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

impl IsolationTree {
    /// Depth of the leaf `x` lands in, plus the expected remaining depth.
    fn path_length(&self, x: &[f64]) -> f64 {
        let mut idx = 0;
        let mut depth = 0.0;
        // Bounded by node count so a malformed tree cannot loop.
        for _ in 0..=self.nodes.len() {
            match self.nodes.get(idx) {
                Some(TreeNode::Split { feature, threshold, left, right }) => {
                    let v = x.get(*feature).copied().unwrap_or(0.0);
                    idx = if v <= *threshold { *left } else { *right };
                    depth += 1.0;
                }
                Some(TreeNode::Leaf { size }) => return depth + average_path_length(*size),
                None => break,
            }
        }
        depth
    }

    fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("empty tree".into());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split { feature, left, right, .. } = node {
                if *feature >= n_features {
                    return Err(format!("node {i} splits on feature {feature} of {n_features}"));
                }
                if *left <= i || *right <= i || *left >= self.nodes.len() || *right >= self.nodes.len() {
                    return Err(format!("node {i} has child indices out of order"));
                }
            }
        }
        Ok(())
    }
}

impl AnomalyModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OptimizerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            OptimizerError::ModelUnavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, OptimizerError> {
        let model: AnomalyModel = serde_json::from_str(json)
            .map_err(|e| OptimizerError::ModelUnavailable(format!("unparsable model: {e}")))?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), OptimizerError> {
        let n = self.feature_names.len();
        let bad = |msg: String| Err(OptimizerError::ModelUnavailable(msg));
        if n == 0 {
            return bad("model has no features".into());
        }
        if self.scaler.mean.len() != n || self.scaler.scale.len() != n {
            return bad(format!(
                "scaler has {}/{} entries for {n} features",
                self.scaler.mean.len(),
                self.scaler.scale.len()
            ));
        }
        if self.forest.trees.is_empty() {
            return bad("forest has no trees".into());
        }
        for (i, tree) in self.forest.trees.iter().enumerate() {
            tree.validate(n)
                .map_err(|e| OptimizerError::ModelUnavailable(format!("tree {i}: {e}")))?;
        }
        Ok(())
    }

    /// Order named features as the model expects, filling gaps with 0.
    pub fn vectorize(&self, features: &HashMap<&str, f64>) -> Vec<f64> {
        self.feature_names
            .iter()
            .map(|name| features.get(name.as_str()).copied().unwrap_or(0.0))
            .collect()
    }

    fn scale(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.scaler.mean.iter().zip(&self.scaler.scale))
            .map(|(v, (m, s))| {
                let s = if *s == 0.0 { 1.0 } else { *s };
                (v - m) / s
            })
            .collect()
    }

    pub fn predict(&self, raw: &[f64]) -> Prediction {
        let x = self.scale(raw);
        let trees = &self.forest.trees;
        let mean_path = trees.iter().map(|t| t.path_length(&x)).sum::<f64>() / trees.len() as f64;
        let c = average_path_length(self.forest.max_samples).max(f64::EPSILON);
        let score = -(2f64.powf(-mean_path / c));
        let decision = score - self.forest.offset;
        Prediction {
            anomaly_score: decision,
            is_anomaly: decision < 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// One feature, one tree: x <= 0 isolates quickly, x > 0 goes deep.
    fn make_model_json() -> String {
        json!({
            "feature_names": ["total_txns"],
            "scaler": {"mean": [0.0], "scale": [1.0]},
            "forest": {
                "max_samples": 8,
                "offset": -0.5,
                "trees": [{
                    "nodes": [
                        {"kind": "split", "feature": 0, "threshold": 0.0, "left": 1, "right": 2},
                        {"kind": "leaf", "size": 1},
                        {"kind": "leaf", "size": 7}
                    ]
                }]
            }
        })
        .to_string()
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        let c256 = average_path_length(256);
        assert!((c256 - 10.2448).abs() < 1e-3, "{c256}");
    }

    #[test]
    fn test_isolated_point_is_anomalous() {
        let model = AnomalyModel::from_json(&make_model_json()).unwrap();
        let outlier = model.predict(&[-5.0]);
        let inlier = model.predict(&[5.0]);
        assert!(outlier.anomaly_score < inlier.anomaly_score);
        assert!(outlier.is_anomaly);
        assert!(!inlier.is_anomaly);
    }

    #[test]
    fn test_vectorize_fills_missing() {
        let model = AnomalyModel::from_json(&make_model_json()).unwrap();
        let empty = HashMap::new();
        assert_eq!(model.vectorize(&empty), vec![0.0]);
        let features = HashMap::from([("total_txns", 12.0), ("ignored", 1.0)]);
        assert_eq!(model.vectorize(&features), vec![12.0]);
    }

    #[test]
    fn test_zero_scale_treated_as_one() {
        let mut v: serde_json::Value = serde_json::from_str(&make_model_json()).unwrap();
        v["scaler"]["scale"] = json!([0.0]);
        let model = AnomalyModel::from_json(&v.to_string()).unwrap();
        let p = model.predict(&[5.0]);
        assert!(p.anomaly_score.is_finite());
    }

    #[test]
    fn test_rejects_bad_models() {
        assert!(matches!(
            AnomalyModel::from_json("not json"),
            Err(OptimizerError::ModelUnavailable(_))
        ));

        let mut v: serde_json::Value = serde_json::from_str(&make_model_json()).unwrap();
        v["scaler"]["mean"] = json!([0.0, 1.0]);
        assert!(AnomalyModel::from_json(&v.to_string()).is_err());

        let mut v: serde_json::Value = serde_json::from_str(&make_model_json()).unwrap();
        v["forest"]["trees"][0]["nodes"][0]["left"] = json!(0);
        assert!(AnomalyModel::from_json(&v.to_string()).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = AnomalyModel::load("/nonexistent/vaultkeeper_model.json").unwrap_err();
        assert!(matches!(err, OptimizerError::ModelUnavailable(_)));
    }
}
