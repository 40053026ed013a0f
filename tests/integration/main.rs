//! Integration tests: full optimization cycles over simulated chains.

mod mock_market;
mod registry_flow;
mod simulation;
