//! Agent invocation abstraction
//!
//! A single capability contract implemented once per step kind: given a step
//! kind and resolved inputs, produce a structured output or fail with a
//! classified error. The executor depends only on this contract, never on a
//! specific reasoning backend, so deterministic substitutes can stand in
//! during tests.

pub mod http_client;

pub use http_client::HttpAgent;

use crate::plan::types::{StepId, StepKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Remaining allowance reported to an agent so it can size its own work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    /// Remaining cost units for the plan run
    pub cost_units: i64,
    /// Remaining wall-clock time for the plan run, in milliseconds
    pub time_ms: u64,
}

/// One invocation request
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    /// The step being executed
    pub step_id: StepId,
    /// The capability being invoked
    pub kind: StepKind,
    /// Resolved inputs: literals plus dependency output payloads
    pub inputs: BTreeMap<String, Value>,
    /// Remaining plan budget at dispatch time
    pub budget_remaining: BudgetSnapshot,
}

/// A successful invocation response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentResponse {
    /// Structured output payload, interpreted by downstream steps
    pub payload: Value,
    /// Cost units consumed by this invocation
    #[serde(default)]
    pub cost_units: u64,
    /// Reported latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

/// Classified invocation failure
///
/// Transient failures (timeouts, rate limits) are retried per the step's
/// policy; permanent failures (malformed or unparseable output) terminally
/// fail the step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentFailure {
    /// Worth retrying with backoff
    #[error("transient agent failure: {0}")]
    Transient(String),
    /// Retrying would not help
    #[error("permanent agent failure: {0}")]
    Permanent(String),
}

impl AgentFailure {
    /// True for failures the retry policy applies to
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentFailure::Transient(_))
    }
}

/// The capability contract every reasoning step kind implements
#[async_trait]
pub trait Agent: Send + Sync {
    /// Perform one reasoning invocation
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentFailure>;
}

/// Registry mapping each step kind to its reasoning capability
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<StepKind, Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the capability for a step kind, replacing any previous one
    pub fn register(&mut self, kind: StepKind, agent: Arc<dyn Agent>) {
        self.agents.insert(kind, agent);
    }

    /// Look up the capability for a step kind
    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn Agent>> {
        self.agents.get(&kind).cloned()
    }

    /// Register one shared agent for every step kind
    ///
    /// Used with backends that multiplex capabilities behind one endpoint,
    /// such as [`HttpAgent`].
    pub fn with_shared_agent(agent: Arc<dyn Agent>) -> Self {
        let mut registry = Self::new();
        for kind in [
            StepKind::Understanding,
            StepKind::Query,
            StepKind::ContextLookup,
            StepKind::Calculation,
            StepKind::Synthesis,
        ] {
            registry.register(kind, agent.clone());
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentFailure> {
            Ok(AgentResponse {
                payload: json!({"kind": request.kind.as_str()}),
                cost_units: 1,
                latency_ms: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Calculation, Arc::new(EchoAgent));

        assert!(registry.get(StepKind::Calculation).is_some());
        assert!(registry.get(StepKind::Query).is_none());
    }

    #[tokio::test]
    async fn test_shared_agent_covers_all_kinds() {
        let registry = AgentRegistry::with_shared_agent(Arc::new(EchoAgent));
        for kind in [
            StepKind::Understanding,
            StepKind::Query,
            StepKind::ContextLookup,
            StepKind::Calculation,
            StepKind::Synthesis,
        ] {
            let agent = registry.get(kind).expect("registered");
            let response = agent
                .invoke(AgentRequest {
                    step_id: "s".to_string(),
                    kind,
                    inputs: BTreeMap::new(),
                    budget_remaining: BudgetSnapshot {
                        cost_units: 10,
                        time_ms: 1000,
                    },
                })
                .await
                .unwrap();
            assert_eq!(response.payload["kind"], kind.as_str());
        }
    }

    #[test]
    fn test_failure_classification() {
        assert!(AgentFailure::Transient("rate limited".into()).is_transient());
        assert!(!AgentFailure::Permanent("unparseable".into()).is_transient());
    }
}
