//! Core engine: contract book, action execution, vault registry and the
//! optimization cycle that ties them together.

pub mod contracts;
pub mod actions;
pub mod executor;
pub mod registry;
pub mod accountant;
pub mod orchestrator;
