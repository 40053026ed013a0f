//! Activity feature extraction.
//!
//! Summarises an address's recent transactions into the fixed feature
//! vector the anomaly model was trained on. Undefined statistics
//! (std of one sample, skew of a constant series) are 0.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One transaction as seen by the feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTransaction {
    pub from: String,
    /// Value in ether.
    pub value_eth: f64,
    pub timestamp: DateTime<Utc>,
    /// Hex calldata, `0x` for plain transfers.
    pub input: String,
    /// Gas price in wei.
    pub gas_price: f64,
    pub failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum MethodClass {
    Transfer,
    Approve,
    TransferFrom,
    Plain,
    Other,
}

impl MethodClass {
    fn of(input: &str) -> Self {
        let input = input.to_ascii_lowercase();
        if input.is_empty() || input == "0x" {
            MethodClass::Plain
        } else if input.starts_with("0xa9059cbb") {
            MethodClass::Transfer
        } else if input.starts_with("0x095ea7b3") {
            MethodClass::Approve
        } else if input.starts_with("0x23b872dd") {
            MethodClass::TransferFrom
        } else {
            MethodClass::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityFeatures {
    pub total_txns: f64,
    pub unique_users: f64,
    pub user_concentration: f64,
    pub avg_value: f64,
    pub median_value: f64,
    pub value_std: f64,
    pub value_skew: f64,
    pub zero_value_ratio: f64,
    pub time_span_days: f64,
    pub txns_per_day: f64,
    pub weekend_activity: f64,
    pub night_activity: f64,
    pub method_diversity: f64,
    pub method_entropy: f64,
    pub avg_gas_price: f64,
    pub gas_price_volatility: f64,
    pub failed_tx_ratio: f64,
    pub recent_activity_surge: f64,
}

impl ActivityFeatures {
    /// Returns `None` when there is no activity at all.
    pub fn from_transactions(txs: &[ActivityTransaction]) -> Option<Self> {
        if txs.is_empty() {
            return None;
        }
        let n = txs.len() as f64;

        let mut per_user: HashMap<String, usize> = HashMap::new();
        for tx in txs {
            *per_user.entry(tx.from.to_ascii_lowercase()).or_insert(0) += 1;
        }
        let max_user = per_user.values().copied().max().unwrap_or(0) as f64;

        let values: Vec<f64> = txs.iter().map(|t| t.value_eth).collect();
        let gas: Vec<f64> = txs.iter().map(|t| t.gas_price).collect();

        let first = txs.iter().map(|t| t.timestamp).min()?;
        let last = txs.iter().map(|t| t.timestamp).max()?;
        let span_days = (last - first).num_days() as f64;

        let weekend = txs
            .iter()
            .filter(|t| matches!(t.timestamp.weekday(), Weekday::Sat | Weekday::Sun))
            .count() as f64;
        let night = txs
            .iter()
            .filter(|t| {
                let h = t.timestamp.hour();
                h >= 22 || h < 6
            })
            .count() as f64;

        let mut methods: BTreeMap<MethodClass, usize> = BTreeMap::new();
        for tx in txs {
            *methods.entry(MethodClass::of(&tx.input)).or_insert(0) += 1;
        }
        let entropy = -methods
            .values()
            .map(|&c| {
                let p = c as f64 / n;
                p * (p + 1e-10).log2()
            })
            .sum::<f64>();

        let recent_cutoff = last - Duration::days(7);
        let recent = txs.iter().filter(|t| t.timestamp > recent_cutoff).count() as f64;

        Some(Self {
            total_txns: n,
            unique_users: per_user.len() as f64,
            user_concentration: max_user / n,
            avg_value: mean(&values),
            median_value: median(&values),
            value_std: sample_std(&values),
            value_skew: skewness(&values),
            zero_value_ratio: values.iter().filter(|v| **v == 0.0).count() as f64 / n,
            time_span_days: span_days,
            txns_per_day: n / span_days.max(1.0),
            weekend_activity: weekend / n,
            night_activity: night / n,
            method_diversity: methods.len() as f64,
            method_entropy: entropy,
            avg_gas_price: mean(&gas),
            gas_price_volatility: sample_std(&gas),
            failed_tx_ratio: txs.iter().filter(|t| t.failed).count() as f64 / n,
            recent_activity_surge: recent / n * 52.0,
        })
    }

    /// Features by name, for model vectorisation.
    pub fn to_map(&self) -> HashMap<&'static str, f64> {
        HashMap::from([
            ("total_txns", self.total_txns),
            ("unique_users", self.unique_users),
            ("user_concentration", self.user_concentration),
            ("avg_value", self.avg_value),
            ("median_value", self.median_value),
            ("value_std", self.value_std),
            ("value_skew", self.value_skew),
            ("zero_value_ratio", self.zero_value_ratio),
            ("time_span_days", self.time_span_days),
            ("txns_per_day", self.txns_per_day),
            ("weekend_activity", self.weekend_activity),
            ("night_activity", self.night_activity),
            ("method_diversity", self.method_diversity),
            ("method_entropy", self.method_entropy),
            ("avg_gas_price", self.avg_gas_price),
            ("gas_price_volatility", self.gas_price_volatility),
            ("failed_tx_ratio", self.failed_tx_ratio),
            ("recent_activity_surge", self.recent_activity_surge),
        ])
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn median(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn sample_std(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

/// Adjusted Fisher-Pearson skewness.
fn skewness(xs: &[f64]) -> f64 {
    let n = xs.len();
    if n < 3 {
        return 0.0;
    }
    let s = sample_std(xs);
    if s == 0.0 {
        return 0.0;
    }
    let m = mean(xs);
    let nf = n as f64;
    let sum_cubed: f64 = xs.iter().map(|x| ((x - m) / s).powi(3)).sum();
    nf / ((nf - 1.0) * (nf - 2.0)) * sum_cubed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_tx(from: &str, value: f64, ts: DateTime<Utc>, input: &str, failed: bool) -> ActivityTransaction {
        ActivityTransaction {
            from: from.to_string(),
            value_eth: value,
            timestamp: ts,
            input: input.to_string(),
            gas_price: 20e9,
            failed,
        }
    }

    #[test]
    fn test_no_activity() {
        assert!(ActivityFeatures::from_transactions(&[]).is_none());
    }

    #[test]
    fn test_single_transaction() {
        // Saturday 2024-03-02 23:00 UTC
        let ts = Utc.with_ymd_and_hms(2024, 3, 2, 23, 0, 0).unwrap();
        let f = ActivityFeatures::from_transactions(&[make_tx("0xA", 1.0, ts, "0x", false)]).unwrap();
        assert_eq!(f.total_txns, 1.0);
        assert_eq!(f.unique_users, 1.0);
        assert_eq!(f.user_concentration, 1.0);
        assert_eq!(f.value_std, 0.0);
        assert_eq!(f.value_skew, 0.0);
        assert_eq!(f.weekend_activity, 1.0);
        assert_eq!(f.night_activity, 1.0);
        assert_eq!(f.txns_per_day, 1.0);
        assert_eq!(f.method_diversity, 1.0);
        assert!(f.method_entropy.abs() < 1e-6);
        assert!((f.recent_activity_surge - 52.0).abs() < 1e-9);
    }

    #[test]
    fn test_mixed_activity() {
        // Wednesday 2024-03-06 12:00 UTC
        let base = Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap();
        let txs = vec![
            make_tx("0xA", 0.0, base - Duration::days(30), "0xa9059cbb0000", false),
            make_tx("0xa", 2.0, base - Duration::days(20), "0x095ea7b30000", false),
            make_tx("0xB", 4.0, base - Duration::days(1), "0xa9059cbb0000", true),
            make_tx("0xC", 6.0, base, "0x", false),
        ];
        let f = ActivityFeatures::from_transactions(&txs).unwrap();
        assert_eq!(f.total_txns, 4.0);
        assert_eq!(f.unique_users, 3.0);
        assert_eq!(f.user_concentration, 0.5);
        assert_eq!(f.avg_value, 3.0);
        assert_eq!(f.median_value, 3.0);
        assert!((f.value_std - (20.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert!(f.value_skew.abs() < 1e-9);
        assert_eq!(f.zero_value_ratio, 0.25);
        assert_eq!(f.time_span_days, 30.0);
        assert!((f.txns_per_day - 4.0 / 30.0).abs() < 1e-12);
        assert_eq!(f.method_diversity, 3.0);
        assert!((f.method_entropy - 1.5).abs() < 1e-6);
        assert_eq!(f.failed_tx_ratio, 0.25);
        assert!((f.recent_activity_surge - 26.0).abs() < 1e-9);
    }

    #[test]
    fn test_skew_sign() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let txs: Vec<_> = [1.0, 1.0, 1.0, 10.0]
            .iter()
            .map(|v| make_tx("0xA", *v, base, "0x", false))
            .collect();
        let f = ActivityFeatures::from_transactions(&txs).unwrap();
        assert!(f.value_skew > 0.0);
    }

    #[test]
    fn test_feature_map_has_every_feature() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let f = ActivityFeatures::from_transactions(&[make_tx("0xA", 1.0, base, "0x", false)]).unwrap();
        assert_eq!(f.to_map().len(), 18);
    }
}
