//! Historical knowledge: market patterns, strategy outcomes, risk events.
//!
//! Each kind of record lives in its own append-only log. Records are
//! tagged with a v4 UUID and a timestamp on append and never rewritten.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{RiskLevel, Strategy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub body: T,
}

impl<T> Record<T> {
    pub fn new(body: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            body,
        }
    }
}

/// Append-only record store.
pub trait AppendLog<T>: Send + Sync {
    fn append(&self, record: Record<T>) -> Result<()>;

    /// Matching records in append order.
    fn query(&self, predicate: &dyn Fn(&Record<T>) -> bool) -> Result<Vec<Record<T>>>;
}

// ---------------------------------------------------------------------------
// JSON-lines file log
// ---------------------------------------------------------------------------

/// One JSON record per line.
pub struct JsonlLog<T> {
    path: PathBuf,
    // Serialises appends from this process.
    lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonlLog<T> {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create knowledge dir {}", parent.display()))?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> AppendLog<T> for JsonlLog<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn append(&self, record: Record<T>) -> Result<()> {
        let line = serde_json::to_string(&record).context("Failed to serialise record")?;
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context(format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{line}").context(format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }

    fn query(&self, predicate: &dyn Fn(&Record<T>) -> bool) -> Result<Vec<Record<T>>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)
            .context(format!("Failed to open {}", self.path.display()))?;
        let mut out = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.context(format!("Failed to read {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record<T>>(&line) {
                Ok(record) if predicate(&record) => out.push(record),
                Ok(_) => {}
                Err(e) => warn!(path = %self.path.display(), line = n + 1, error = %e, "Skipping corrupt record"),
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// In-memory log
// ---------------------------------------------------------------------------

pub struct MemoryLog<T> {
    records: Mutex<Vec<Record<T>>>,
}

impl<T> MemoryLog<T> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Default for MemoryLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> AppendLog<T> for MemoryLog<T> {
    fn append(&self, record: Record<T>) -> Result<()> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).push(record);
        Ok(())
    }

    fn query(&self, predicate: &dyn Fn(&Record<T>) -> bool) -> Result<Vec<Record<T>>> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.iter().filter(|r| predicate(r)).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Record bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPattern {
    pub pattern_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOutcome {
    pub success: bool,
    pub risk_score: f64,
    /// Fraction, 0.06 = 6%.
    pub expected_apr: f64,
    #[serde(default)]
    pub deployed_amount: Option<Decimal>,
    #[serde(default)]
    pub tx_hashes: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub strategy: Strategy,
    pub outcome: StrategyOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub event_type: String,
    pub protocol: String,
    pub contract: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub details: Option<String>,
}

/// Recent history handed to the strategy planner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalContext {
    pub patterns: Vec<Record<MarketPattern>>,
    pub outcomes: Vec<Record<OutcomeRecord>>,
    pub risk_events: Vec<Record<RiskEvent>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolHistory {
    pub protocol: String,
    pub risk_events: Vec<Record<RiskEvent>>,
    pub outcomes: Vec<Record<OutcomeRecord>>,
    pub average_apr: f64,
    pub success_rate: f64,
}

// ---------------------------------------------------------------------------
// Knowledge base
// ---------------------------------------------------------------------------

pub struct KnowledgeBase {
    patterns: Box<dyn AppendLog<MarketPattern>>,
    outcomes: Box<dyn AppendLog<OutcomeRecord>>,
    risk_events: Box<dyn AppendLog<RiskEvent>>,
}

impl KnowledgeBase {
    pub fn new(
        patterns: Box<dyn AppendLog<MarketPattern>>,
        outcomes: Box<dyn AppendLog<OutcomeRecord>>,
        risk_events: Box<dyn AppendLog<RiskEvent>>,
    ) -> Self {
        Self {
            patterns,
            outcomes,
            risk_events,
        }
    }

    /// File-backed logs under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self::new(
            Box::new(JsonlLog::open(dir.join("market_patterns.jsonl"))?),
            Box::new(JsonlLog::open(dir.join("strategy_outcomes.jsonl"))?),
            Box::new(JsonlLog::open(dir.join("risk_events.jsonl"))?),
        ))
    }

    pub fn in_memory() -> Self {
        Self::new(
            Box::new(MemoryLog::new()),
            Box::new(MemoryLog::new()),
            Box::new(MemoryLog::new()),
        )
    }

    pub fn add_outcome(&self, strategy: &Strategy, outcome: StrategyOutcome) -> Result<Uuid> {
        let record = Record::new(OutcomeRecord {
            strategy: strategy.clone(),
            outcome,
        });
        let id = record.id;
        self.outcomes.append(record)?;
        debug!(%id, protocol = %strategy.target_protocol, "Outcome recorded");
        Ok(id)
    }

    pub fn add_market_pattern(&self, pattern_type: &str, data: Value) -> Result<Uuid> {
        let record = Record::new(MarketPattern {
            pattern_type: pattern_type.to_string(),
            data,
        });
        let id = record.id;
        self.patterns.append(record)?;
        Ok(id)
    }

    pub fn add_risk_event(&self, event: RiskEvent) -> Result<Uuid> {
        let record = Record::new(event);
        let id = record.id;
        self.risk_events.append(record)?;
        Ok(id)
    }

    /// The `limit` most recent records of each kind, oldest first.
    pub fn get_context(&self, limit: usize) -> Result<HistoricalContext> {
        Ok(HistoricalContext {
            patterns: tail(self.patterns.query(&|_| true)?, limit),
            outcomes: tail(self.outcomes.query(&|_| true)?, limit),
            risk_events: tail(self.risk_events.query(&|_| true)?, limit),
        })
    }

    pub fn outcomes(&self) -> Result<Vec<Record<OutcomeRecord>>> {
        self.outcomes.query(&|_| true)
    }

    pub fn risk_events(&self) -> Result<Vec<Record<RiskEvent>>> {
        self.risk_events.query(&|_| true)
    }

    pub fn protocol_history(&self, protocol: &str) -> Result<ProtocolHistory> {
        let needle = protocol.to_lowercase();
        let risk_events = self
            .risk_events
            .query(&|r| r.body.protocol.to_lowercase() == needle)?;
        let outcomes = self
            .outcomes
            .query(&|r| r.body.strategy.target_protocol.to_lowercase() == needle)?;

        let (average_apr, success_rate) = if outcomes.is_empty() {
            (0.0, 0.0)
        } else {
            let n = outcomes.len() as f64;
            let apr = outcomes.iter().map(|r| r.body.outcome.expected_apr).sum::<f64>() / n;
            let ok = outcomes.iter().filter(|r| r.body.outcome.success).count() as f64 / n;
            (apr, ok)
        };

        Ok(ProtocolHistory {
            protocol: protocol.to_string(),
            risk_events,
            outcomes,
            average_apr,
            success_rate,
        })
    }
}

fn tail<T>(mut records: Vec<T>, limit: usize) -> Vec<T> {
    let skip = records.len().saturating_sub(limit);
    records.drain(..skip);
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExpectedOutcome;
    use serde_json::json;

    fn make_strategy(protocol: &str, apr: f64) -> Strategy {
        Strategy {
            strategy_type: "vault_yield_optimization".into(),
            target_protocol: protocol.into(),
            actions: vec![],
            expected_outcome: ExpectedOutcome {
                apr,
                risk_level: "low".into(),
            },
            vault_address: None,
        }
    }

    fn make_outcome(success: bool, apr: f64) -> StrategyOutcome {
        StrategyOutcome {
            success,
            risk_score: 0.3,
            expected_apr: apr,
            deployed_amount: None,
            tx_hashes: vec![],
            error: None,
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("vaultkeeper_test_knowledge_{}", Uuid::new_v4()))
    }

    #[test]
    fn test_memory_log_append_and_query() {
        let log: MemoryLog<u32> = MemoryLog::new();
        for i in 0..5 {
            log.append(Record::new(i)).unwrap();
        }
        let even = log.query(&|r| r.body % 2 == 0).unwrap();
        assert_eq!(even.iter().map(|r| r.body).collect::<Vec<_>>(), vec![0, 2, 4]);
    }

    #[test]
    fn test_jsonl_log_persists_across_handles() {
        let dir = temp_dir();
        let path = dir.join("numbers.jsonl");
        {
            let log: JsonlLog<u32> = JsonlLog::open(&path).unwrap();
            log.append(Record::new(7)).unwrap();
            log.append(Record::new(9)).unwrap();
        }
        let reopened: JsonlLog<u32> = JsonlLog::open(&path).unwrap();
        let all = reopened.query(&|_| true).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].body, 9);
        assert_ne!(all[0].id, all[1].id);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_jsonl_skips_corrupt_lines() {
        let dir = temp_dir();
        let path = dir.join("numbers.jsonl");
        let log: JsonlLog<u32> = JsonlLog::open(&path).unwrap();
        log.append(Record::new(1)).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"garbage\n")
            .unwrap();
        log.append(Record::new(2)).unwrap();
        assert_eq!(log.query(&|_| true).unwrap().len(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_jsonl_missing_file_is_empty() {
        let log: JsonlLog<u32> = JsonlLog::open(temp_dir().join("none.jsonl")).unwrap();
        assert!(log.query(&|_| true).unwrap().is_empty());
    }

    #[test]
    fn test_context_returns_most_recent() {
        let kb = KnowledgeBase::in_memory();
        for i in 0..15 {
            kb.add_market_pattern("best_yield", json!({ "n": i })).unwrap();
        }
        kb.add_outcome(&make_strategy("aave_usdc", 0.06), make_outcome(true, 0.06))
            .unwrap();

        let ctx = kb.get_context(10).unwrap();
        assert_eq!(ctx.patterns.len(), 10);
        assert_eq!(ctx.patterns[0].body.data["n"], 5);
        assert_eq!(ctx.patterns[9].body.data["n"], 14);
        assert_eq!(ctx.outcomes.len(), 1);
        assert!(ctx.risk_events.is_empty());
    }

    #[test]
    fn test_protocol_history() {
        let kb = KnowledgeBase::in_memory();
        kb.add_outcome(&make_strategy("aave_usdc", 0.06), make_outcome(true, 0.06))
            .unwrap();
        kb.add_outcome(&make_strategy("AAVE_USDC", 0.04), make_outcome(false, 0.04))
            .unwrap();
        kb.add_outcome(&make_strategy("compound_usdc", 0.05), make_outcome(true, 0.05))
            .unwrap();
        kb.add_risk_event(RiskEvent {
            event_type: "strategy_rejected".into(),
            protocol: "aave_usdc".into(),
            contract: "0xabc".into(),
            risk_score: 0.8,
            risk_level: RiskLevel::High,
            details: None,
        })
        .unwrap();

        let h = kb.protocol_history("aave_usdc").unwrap();
        assert_eq!(h.outcomes.len(), 2);
        assert_eq!(h.risk_events.len(), 1);
        assert!((h.average_apr - 0.05).abs() < 1e-12);
        assert!((h.success_rate - 0.5).abs() < 1e-12);

        let empty = kb.protocol_history("curve").unwrap();
        assert_eq!(empty.success_rate, 0.0);
    }

    #[test]
    fn test_file_backed_knowledge_base() {
        let dir = temp_dir();
        let kb = KnowledgeBase::open(&dir).unwrap();
        kb.add_outcome(&make_strategy("aave_usdc", 0.06), make_outcome(true, 0.06))
            .unwrap();
        assert!(dir.join("strategy_outcomes.jsonl").exists());

        let reopened = KnowledgeBase::open(&dir).unwrap();
        assert_eq!(reopened.outcomes().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
