//! Plan execution module
//!
//! Contains the budget, the scheduler that walks the plan DAG, and the
//! result aggregator / synthesis gate. The scheduler is deterministic given
//! fixed agent responses; all non-determinism lives behind the agent
//! invocation boundary.

pub mod aggregator;
pub mod budget;
pub mod scheduler;

pub use aggregator::{CoverageRule, EvidenceBundle, PlanOutcome, RunStats, StepOmission};
pub use budget::Budget;
pub use scheduler::{ExecutorOptions, PlanReport, PlanRunner};
