//! Scenario-driven test harness.
//!
//! Scenarios are TOML scripts that drive a loaded pipeline through
//! control-plane membership changes and packets, checking PHV outputs,
//! selections and register contents as they go.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- run demos/load_balancer_scenario.toml
//! ```

pub mod scenario;

pub use scenario::{Scenario, ScenarioError, ScenarioResult, ScenarioRunner, Step, StepError, StepOutcome};
