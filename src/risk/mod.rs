//! Risk gate.
//!
//! [`RiskScorer`] maps a strategy to a risk score in [0, 1]. It resolves
//! the protocol contract the strategy targets and asks an
//! [`AnomalyDetector`] how unusual that contract's on-chain activity is.
//! Scoring never fails: anything that goes wrong degrades to a moderate
//! 0.5 that neither blocks nor blindly approves.

pub mod activity;
pub mod features;
pub mod model;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::types::{OptimizerError, RiskAssessment, RiskLevel, Strategy};
use activity::ActivitySource;
use features::ActivityFeatures;
use model::AnomalyModel;

/// Score used whenever nothing better is known.
pub const MODERATE_RISK: f64 = 0.5;

/// Well-known protocol names and their main contracts.
const KNOWN_PROTOCOLS: &[(&str, &str)] = &[
    ("aave", "0x7fc66500c84a76ad7e9c93437bfc5ac33e2ddae9"),
    ("aave v3", "0x7fc66500c84a76ad7e9c93437bfc5ac33e2ddae9"),
    ("compound", "0xc00e94cb662c3520282e6f5717214004a7f26888"),
    ("compound v3", "0xc00e94cb662c3520282e6f5717214004a7f26888"),
    ("uniswap", "0x1f9840a85d5af5bf1d1762f925bdaddc4201f984"),
    ("curve", "0xd533a949740bb3306d119cc777fa900ba034cd52"),
    ("usdc", "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"),
    ("usdt", "0xdac17f958d2ee523a2206206994597c13d831ec7"),
    ("weth", "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"),
];

// ---------------------------------------------------------------------------
// Detector seam
// ---------------------------------------------------------------------------

/// Anomaly verdict for one contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Isolation-forest decision value; lower is more anomalous.
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub features: Option<ActivityFeatures>,
}

#[async_trait]
pub trait AnomalyDetector: Send + Sync {
    /// `Ok(None)` when the contract has no activity to judge.
    async fn inspect(&self, contract: &str) -> Result<Option<Detection>, OptimizerError>;
}

/// Isolation forest over activity features from an [`ActivitySource`].
pub struct IsolationForestDetector {
    model: AnomalyModel,
    source: Box<dyn ActivitySource>,
}

impl IsolationForestDetector {
    pub fn new(model: AnomalyModel, source: Box<dyn ActivitySource>) -> Self {
        Self { model, source }
    }

    pub fn load(path: &str, source: Box<dyn ActivitySource>) -> Result<Self, OptimizerError> {
        let model = AnomalyModel::load(path)?;
        info!(path, features = model.feature_names.len(), trees = model.forest.trees.len(), "Risk model loaded");
        Ok(Self::new(model, source))
    }
}

#[async_trait]
impl AnomalyDetector for IsolationForestDetector {
    async fn inspect(&self, contract: &str) -> Result<Option<Detection>, OptimizerError> {
        let txs = self
            .source
            .recent_transactions(contract)
            .await
            .map_err(|e| OptimizerError::ModelUnavailable(format!("activity fetch failed: {e:#}")))?;

        let Some(features) = ActivityFeatures::from_transactions(&txs) else {
            return Ok(None);
        };
        let x = self.model.vectorize(&features.to_map());
        let prediction = self.model.predict(&x);
        Ok(Some(Detection {
            anomaly_score: prediction.anomaly_score,
            is_anomaly: prediction.is_anomaly,
            features: Some(features),
        }))
    }
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

/// `clamp(0.5 - anomaly_score, 0, 1)`.
pub fn risk_from_anomaly(anomaly_score: f64) -> f64 {
    if anomaly_score.is_nan() {
        return MODERATE_RISK;
    }
    (MODERATE_RISK - anomaly_score).clamp(0.0, 1.0)
}

/// Strict: a score equal to the threshold is not safe.
pub fn is_safe_score(risk_score: f64, threshold: f64) -> bool {
    risk_score < threshold
}

pub struct RiskScorer {
    detector: Option<Box<dyn AnomalyDetector>>,
    protocols: BTreeMap<String, String>,
}

impl RiskScorer {
    /// `detector = None` means the model could not be loaded.
    pub fn new(detector: Option<Box<dyn AnomalyDetector>>, extra_protocols: &HashMap<String, String>) -> Self {
        let mut protocols: BTreeMap<String, String> = KNOWN_PROTOCOLS
            .iter()
            .map(|(name, addr)| (name.to_string(), addr.to_string()))
            .collect();
        for (name, addr) in extra_protocols {
            protocols.insert(name.to_lowercase(), addr.to_lowercase());
        }
        if detector.is_none() {
            warn!("Risk model unavailable, every strategy will score {MODERATE_RISK}");
        }
        Self { detector, protocols }
    }

    /// Contract address the strategy targets, if any can be found.
    pub fn resolve_protocol_address(&self, strategy: &Strategy) -> Option<String> {
        let target = strategy.target_protocol.trim();
        if target.starts_with("0x") {
            return Some(target.to_string());
        }
        if let Some(addr) = self.protocols.get(&target.to_lowercase()) {
            return Some(addr.clone());
        }

        for action in &strategy.actions {
            for key in ["contract", "protocol"] {
                if let Some(v) = action.param_str(key).map(str::trim).filter(|v| !v.is_empty()) {
                    return Some(
                        self.protocols
                            .get(&v.to_lowercase())
                            .cloned()
                            .unwrap_or_else(|| v.to_string()),
                    );
                }
            }
        }
        None
    }

    pub async fn assess(&self, strategy: &Strategy) -> RiskAssessment {
        self.assess_with_features(strategy).await.0
    }

    async fn assess_with_features(&self, strategy: &Strategy) -> (RiskAssessment, Option<ActivityFeatures>) {
        let Some(contract) = self.resolve_protocol_address(strategy) else {
            debug!(target = %strategy.target_protocol, "No protocol address resolved");
            return (RiskAssessment::moderate("", "no protocol address resolved"), None);
        };
        let Some(detector) = self.detector.as_ref() else {
            return (RiskAssessment::moderate(contract, "risk model unavailable"), None);
        };

        match detector.inspect(&contract).await {
            Ok(Some(d)) => {
                let risk_score = risk_from_anomaly(d.anomaly_score);
                info!(
                    contract = %contract,
                    anomaly_score = d.anomaly_score,
                    risk_score,
                    is_anomaly = d.is_anomaly,
                    "Contract risk assessed"
                );
                let assessment = RiskAssessment {
                    contract,
                    risk_score,
                    risk_level: RiskLevel::from_score(risk_score),
                    is_anomaly: d.is_anomaly,
                    anomaly_score: Some(d.anomaly_score),
                    note: None,
                };
                (assessment, d.features)
            }
            Ok(None) => {
                warn!(contract = %contract, "No on-chain activity, treating as maximal risk");
                let assessment = RiskAssessment {
                    contract,
                    risk_score: 1.0,
                    risk_level: RiskLevel::High,
                    is_anomaly: true,
                    anomaly_score: None,
                    note: Some("no transaction data".into()),
                };
                (assessment, None)
            }
            Err(e) => {
                warn!(contract = %contract, error = %e, "Risk scoring failed, using moderate default");
                (RiskAssessment::moderate(contract, e.to_string()), None)
            }
        }
    }

    pub async fn score(&self, strategy: &Strategy) -> f64 {
        self.assess(strategy).await.risk_score
    }

    pub async fn is_safe(&self, strategy: &Strategy, threshold: f64) -> bool {
        is_safe_score(self.score(strategy).await, threshold)
    }

    pub async fn risk_factors(&self, strategy: &Strategy) -> BTreeMap<String, f64> {
        let (assessment, features) = self.assess_with_features(strategy).await;
        let factors: [(&str, f64); 5] = match features {
            Some(f) => [
                ("protocol_risk", 1.0 - assessment.risk_score),
                ("activity_level", (f.total_txns / 1000.0).min(1.0)),
                ("user_diversity", (f.unique_users / 500.0).min(1.0)),
                ("value_stability", 1.0 - f.value_std.min(1.0)),
                ("method_diversity", (f.method_diversity / 10.0).min(1.0)),
            ],
            None => [
                ("protocol_risk", MODERATE_RISK),
                ("activity_level", MODERATE_RISK),
                ("user_diversity", MODERATE_RISK),
                ("value_stability", MODERATE_RISK),
                ("method_diversity", MODERATE_RISK),
            ],
        };
        factors.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}
