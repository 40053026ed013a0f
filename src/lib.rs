//! VAULTKEEPER: risk-gated yield optimizer for a pooled custodial vault.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod chain;
pub mod risk;
pub mod data;
pub mod llm;
pub mod strategy;
pub mod engine;
pub mod storage;
