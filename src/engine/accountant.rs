//! Accountant: folds each cycle's report into the lifetime agent state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::types::AgentState;

// ---------------------------------------------------------------------------
// Cycle report
// ---------------------------------------------------------------------------

/// Why the primary vault was left alone this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientBalance,
    NoMarketData,
    YieldBelowThreshold,
    NoDeployedStrategy,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::InsufficientBalance => "insufficient balance",
            SkipReason::NoMarketData => "no market data",
            SkipReason::YieldBelowThreshold => "yield below threshold",
            SkipReason::NoDeployedStrategy => "no deployed strategy contract",
        };
        f.write_str(s)
    }
}

/// What happened to the operator's primary vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PrimaryOutcome {
    Skipped { reason: SkipReason },
    Rejected { risk_score: f64 },
    Executed {
        success: bool,
        risk_score: f64,
        expected_apr: f64,
        /// Human units of the primary asset.
        deployed_amount: Decimal,
    },
}

/// Summary of one optimization cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_number: u64,
    pub connected_processed: usize,
    pub connected_succeeded: usize,
    /// USDC moved from the deposit proxy into the primary vault.
    #[serde(default)]
    pub deposits_swept: Decimal,
    pub primary: PrimaryOutcome,
    pub timestamp: DateTime<Utc>,
}

impl CycleReport {
    /// A cycle fails only when an approved strategy could not be executed.
    pub fn is_failure(&self) -> bool {
        matches!(self.primary, PrimaryOutcome::Executed { success: false, .. })
    }
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct Accountant;

impl Accountant {
    pub fn reconcile(state: &mut AgentState, report: &CycleReport) {
        state.cycle_count += 1;
        state.last_cycle_at = Some(report.timestamp);
        state.connected_optimized += report.connected_succeeded as u64;
        state.total_swept += report.deposits_swept;

        match &report.primary {
            PrimaryOutcome::Skipped { reason } => {
                state.cycles_skipped += 1;
                info!(cycle = state.cycle_count, reason = %reason, "Primary vault skipped");
            }
            PrimaryOutcome::Rejected { risk_score } => {
                state.strategies_rejected += 1;
                info!(cycle = state.cycle_count, risk_score, "Strategy rejected by risk gate");
            }
            PrimaryOutcome::Executed {
                success: true,
                deployed_amount,
                ..
            } => {
                state.strategies_executed += 1;
                state.total_deployed += *deployed_amount;
            }
            PrimaryOutcome::Executed { success: false, .. } => {
                state.strategies_failed += 1;
                state.cycles_failed += 1;
            }
        }

        info!(
            cycle = state.cycle_count,
            connected = report.connected_processed,
            executed = state.strategies_executed,
            rejected = state.strategies_rejected,
            skipped = state.cycles_skipped,
            total_deployed = %state.total_deployed,
            success_rate = format!("{:.1}%", state.success_rate() * 100.0),
            "Cycle reconciled"
        );
    }

    /// Count a cycle that aborted on an infrastructure error.
    pub fn record_failure(state: &mut AgentState, at: DateTime<Utc>) {
        state.cycle_count += 1;
        state.cycles_failed += 1;
        state.last_cycle_at = Some(at);
        warn!(cycle = state.cycle_count, failed = state.cycles_failed, "Cycle recorded as failed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_report(primary: PrimaryOutcome) -> CycleReport {
        CycleReport {
            cycle_number: 1,
            connected_processed: 2,
            connected_succeeded: 2,
            deposits_swept: Decimal::ZERO,
            primary,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_reconcile_executed() {
        let mut state = AgentState::new();
        let report = make_report(PrimaryOutcome::Executed {
            success: true,
            risk_score: 0.3,
            expected_apr: 0.06,
            deployed_amount: dec!(800),
        });
        Accountant::reconcile(&mut state, &report);

        assert_eq!(state.cycle_count, 1);
        assert_eq!(state.strategies_executed, 1);
        assert_eq!(state.total_deployed, dec!(800));
        assert_eq!(state.connected_optimized, 2);
        assert_eq!(state.last_cycle_at, Some(report.timestamp));
        assert!(!report.is_failure());
    }

    #[test]
    fn test_reconcile_failed_execution() {
        let mut state = AgentState::new();
        let report = make_report(PrimaryOutcome::Executed {
            success: false,
            risk_score: 0.3,
            expected_apr: 0.06,
            deployed_amount: dec!(800),
        });
        Accountant::reconcile(&mut state, &report);

        assert!(report.is_failure());
        assert_eq!(state.strategies_failed, 1);
        assert_eq!(state.cycles_failed, 1);
        assert_eq!(state.total_deployed, Decimal::ZERO);
    }

    #[test]
    fn test_reconcile_skip_and_reject_are_not_failures() {
        let mut state = AgentState::new();
        let skipped = make_report(PrimaryOutcome::Skipped {
            reason: SkipReason::InsufficientBalance,
        });
        let rejected = make_report(PrimaryOutcome::Rejected { risk_score: 0.8 });
        Accountant::reconcile(&mut state, &skipped);
        Accountant::reconcile(&mut state, &rejected);

        assert!(!skipped.is_failure());
        assert!(!rejected.is_failure());
        assert_eq!(state.cycle_count, 2);
        assert_eq!(state.cycles_skipped, 1);
        assert_eq!(state.strategies_rejected, 1);
        assert_eq!(state.cycles_failed, 0);
    }

    #[test]
    fn test_reconcile_accumulates_swept_deposits() {
        let mut state = AgentState::new();
        let mut report = make_report(PrimaryOutcome::Skipped {
            reason: SkipReason::InsufficientBalance,
        });
        report.deposits_swept = dec!(250);
        Accountant::reconcile(&mut state, &report);
        Accountant::reconcile(&mut state, &report);
        assert_eq!(state.total_swept, dec!(500));
    }

    #[test]
    fn test_record_failure() {
        let mut state = AgentState::new();
        Accountant::record_failure(&mut state, Utc::now());
        assert_eq!(state.cycle_count, 1);
        assert_eq!(state.cycles_failed, 1);
    }

    #[test]
    fn test_report_serializes_tagged() {
        let report = make_report(PrimaryOutcome::Skipped {
            reason: SkipReason::YieldBelowThreshold,
        });
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["primary"]["outcome"], "skipped");
        assert_eq!(v["primary"]["reason"], "yield_below_threshold");
    }
}
