//! Plan and step data model
//!
//! These types define the wire shape of an investigation plan (produced by an
//! external planning stage) and the result record each step leaves behind.
//! A `Step` is immutable once created; only its result evolves.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Unique identifier for a step within a plan
pub type StepId = String;

/// The kind of work a step performs
///
/// Each kind maps to one reasoning capability in the agent registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Interpret intermediate results or restate requirements
    Understanding,
    /// Generate a query, ground it against the schema, and execute it
    Query,
    /// Look up external factors or historical context
    ContextLookup,
    /// Perform a numerical/statistical computation over dependency outputs
    Calculation,
    /// Merge evidence into narrative form
    Synthesis,
}

impl StepKind {
    /// Stable lowercase name used in cache keys and agent service paths
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Understanding => "understanding",
            StepKind::Query => "query",
            StepKind::ContextLookup => "context_lookup",
            StepKind::Calculation => "calculation",
            StepKind::Synthesis => "synthesis",
        }
    }
}

/// One input of a step: either a reference to a dependency's output or a
/// literal parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputBinding {
    /// Bind the terminal output payload of a dependency step
    StepOutput {
        /// Step whose output payload is bound; must be a declared dependency
        step: StepId,
    },
    /// Bind a literal JSON value (metrics, time periods, labels, ...)
    Literal {
        /// The literal value
        value: Value,
    },
}

/// Retry policy for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (first try included)
    pub max_attempts: u32,
    /// Base backoff between transient-failure attempts, in milliseconds;
    /// doubles per attempt
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// One unit of work within a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier within the plan (e.g. "step_1")
    pub id: StepId,
    /// What this step does
    pub kind: StepKind,
    /// Named inputs resolved at dispatch time
    #[serde(default)]
    pub inputs: BTreeMap<String, InputBinding>,
    /// Steps that must reach terminal success before this one becomes ready
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    /// Per-invocation timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retry policy for transient failures and grounding feedback
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// An investigation plan: an identifier plus a DAG of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier assigned by the planning stage
    pub id: String,
    /// Ordered step definitions; dependencies may only point backwards
    pub steps: Vec<Step>,
}

/// Terminal status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step produced a payload
    Succeeded,
    /// Step terminally failed after exhausting its retry budget
    Failed,
    /// Step never ran
    Skipped,
}

/// Why a step was skipped without running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A dependency terminally failed or was itself skipped
    DependencyFailed {
        /// The dependency that failed
        dependency: StepId,
    },
    /// The plan's time or cost budget ran out before dispatch
    BudgetExhausted,
}

/// Cost metadata accumulated across a step's attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostMeta {
    /// Wall-clock latency across attempts, in milliseconds
    pub latency_ms: u64,
    /// Cost units consumed by agent invocations
    pub cost_units: u64,
    /// Number of attempts made (0 for cache hits and skips)
    pub attempts: u32,
}

/// Grounding verdict recorded on query-kind steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundingRecord {
    /// Whether a generated query was ultimately approved
    pub approved: bool,
    /// Structured reasons for each rejected attempt, oldest first
    pub rejections: Vec<String>,
}

/// The terminal record a step leaves behind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Owning step
    pub step_id: StepId,
    /// Kind of the owning step
    pub kind: StepKind,
    /// Terminal status
    pub status: StepStatus,
    /// Structured output payload (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Terminal error message (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the step was skipped (present on skips)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Cost metadata for this step
    pub cost: CostMeta,
    /// Grounding verdict (query-kind steps only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounding: Option<GroundingRecord>,
    /// True when the payload was served from the fingerprint cache
    #[serde(default)]
    pub cached: bool,
}

impl StepResult {
    /// Build a success result
    pub fn succeeded(step_id: StepId, kind: StepKind, payload: Value, cost: CostMeta) -> Self {
        Self {
            step_id,
            kind,
            status: StepStatus::Succeeded,
            payload: Some(payload),
            error: None,
            skip_reason: None,
            cost,
            grounding: None,
            cached: false,
        }
    }

    /// Build a terminal failure result
    pub fn failed(step_id: StepId, kind: StepKind, error: String, cost: CostMeta) -> Self {
        Self {
            step_id,
            kind,
            status: StepStatus::Failed,
            payload: None,
            error: Some(error),
            skip_reason: None,
            cost,
            grounding: None,
            cached: false,
        }
    }

    /// Build a skipped result
    pub fn skipped(step_id: StepId, kind: StepKind, reason: SkipReason) -> Self {
        Self {
            step_id,
            kind,
            status: StepStatus::Skipped,
            payload: None,
            error: None,
            skip_reason: Some(reason),
            cost: CostMeta::default(),
            grounding: None,
            cached: false,
        }
    }

    /// True when the step reached terminal success
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}
