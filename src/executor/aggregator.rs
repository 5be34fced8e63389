//! Result aggregator / synthesis gate
//!
//! Consumes the full set of terminal step results for a plan and decides
//! whether enough evidence exists to hand to the synthesis stage. An
//! insufficient run is surfaced as a structured outcome enumerating what
//! failed and why, never silently converted into a degraded answer.

use crate::plan::types::{SkipReason, StepKind, StepResult, StepStatus};
use crate::plan::PlanGraph;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Minimum-coverage rule deciding whether synthesis may proceed
///
/// A required kind only binds when the plan actually contains a step of that
/// kind; a plan without calculation steps is not penalized for lacking one.
#[derive(Debug, Clone)]
pub struct CoverageRule {
    /// Step kinds that must have at least one success when present in the plan
    pub required_kinds: Vec<StepKind>,
    /// Minimum number of successful steps overall
    pub min_successes: usize,
}

impl Default for CoverageRule {
    fn default() -> Self {
        Self {
            required_kinds: vec![StepKind::Query, StepKind::Calculation],
            min_successes: 1,
        }
    }
}

/// One step that did not contribute evidence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOmission {
    /// The step that failed or was skipped
    pub step_id: String,
    /// Its kind
    pub kind: StepKind,
    /// Its terminal status
    pub status: StepStatus,
    /// Human-readable reason
    pub reason: String,
}

/// Aggregate statistics for one plan run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Steps in the plan
    pub total_steps: usize,
    /// Steps that reached terminal success
    pub succeeded: usize,
    /// Steps that terminally failed
    pub failed: usize,
    /// Steps skipped (dependency failure or budget exhaustion)
    pub skipped: usize,
    /// Cost units consumed across all steps
    pub cost_units: u64,
}

/// Merged successful payloads, keyed by step id
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceBundle {
    /// The plan this evidence belongs to
    pub plan_id: String,
    /// Successful step payloads by step id
    pub evidence: BTreeMap<String, Value>,
    /// Aggregate run statistics
    pub stats: RunStats,
}

/// What the caller receives for one plan run
///
/// Either a complete bundle, a partial bundle explicitly marked incomplete
/// with per-step reasons, or a structured insufficient-evidence outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlanOutcome {
    /// Every step succeeded
    Complete {
        /// The full evidence set
        bundle: EvidenceBundle,
    },
    /// Coverage was met but some steps did not contribute
    Partial {
        /// The partial evidence set
        bundle: EvidenceBundle,
        /// Steps missing from the bundle, with reasons
        omissions: Vec<StepOmission>,
    },
    /// Coverage was not met; synthesis must not proceed
    InsufficientEvidence {
        /// Steps that failed or were skipped, with reasons
        failures: Vec<StepOmission>,
        /// Aggregate run statistics
        stats: RunStats,
    },
}

fn omission(result: &StepResult) -> StepOmission {
    let reason = match (&result.skip_reason, &result.error) {
        (Some(SkipReason::DependencyFailed { dependency }), _) => {
            format!("dependency '{dependency}' failed")
        }
        (Some(SkipReason::BudgetExhausted), _) => "budget exhausted before dispatch".to_string(),
        (None, Some(error)) => error.clone(),
        (None, None) => "no result produced".to_string(),
    };
    StepOmission {
        step_id: result.step_id.clone(),
        kind: result.kind,
        status: result.status,
        reason,
    }
}

/// Gate the terminal result set against the coverage rule
///
/// # Arguments
/// * `graph` - The validated plan graph that was executed
/// * `results` - Terminal results, one per step
/// * `rule` - The minimum-coverage rule
///
/// # Returns
/// The structured outcome handed to the (external) synthesis stage.
pub fn evaluate(
    graph: &PlanGraph,
    results: &BTreeMap<String, StepResult>,
    rule: &CoverageRule,
) -> PlanOutcome {
    let mut evidence = BTreeMap::new();
    let mut omissions = Vec::new();
    let mut stats = RunStats {
        total_steps: graph.len(),
        ..Default::default()
    };

    // Walk in topological order so omission lists read causally.
    for step_id in graph.topo_order() {
        let Some(result) = results.get(step_id) else {
            continue;
        };
        stats.cost_units += result.cost.cost_units;
        match result.status {
            StepStatus::Succeeded => {
                stats.succeeded += 1;
                if let Some(payload) = &result.payload {
                    evidence.insert(step_id.clone(), payload.clone());
                }
            }
            StepStatus::Failed => {
                stats.failed += 1;
                omissions.push(omission(result));
            }
            StepStatus::Skipped => {
                stats.skipped += 1;
                omissions.push(omission(result));
            }
        }
    }

    let coverage_met = stats.succeeded >= rule.min_successes
        && rule.required_kinds.iter().all(|kind| {
            let present = graph.plan().steps.iter().any(|s| s.kind == *kind);
            if !present {
                return true;
            }
            results
                .values()
                .any(|r| r.kind == *kind && r.is_success())
        });

    if !coverage_met {
        tracing::warn!(
            plan_id = %graph.plan().id,
            failed = stats.failed,
            skipped = stats.skipped,
            "Insufficient evidence to proceed to synthesis"
        );
        return PlanOutcome::InsufficientEvidence {
            failures: omissions,
            stats,
        };
    }

    let bundle = EvidenceBundle {
        plan_id: graph.plan().id.clone(),
        evidence,
        stats,
    };

    if omissions.is_empty() {
        PlanOutcome::Complete { bundle }
    } else {
        PlanOutcome::Partial { bundle, omissions }
    }
}
