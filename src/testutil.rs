//! Deterministic fixtures for orchestration tests
//!
//! Everything non-deterministic in production (reasoning backends, the
//! analytic store, schema introspection) has a scripted stand-in here, so
//! scheduling, caching, grounding, and aggregation can be tested with fixed
//! responses.

use crate::agents::{Agent, AgentFailure, AgentRequest, AgentResponse};
use crate::grounding::ValidatedQuery;
use crate::plan::types::{Plan, RetryPolicy, Step, StepId, StepKind};
use crate::schema::{ColumnSchema, SchemaError, SchemaProvider, SchemaSnapshot, TableSchema};
use crate::store::{AnalyticStore, QueryOutput, StoreError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Schema used across orchestration tests: a small retail analytic store
pub fn snapshot() -> SchemaSnapshot {
    let table = |name: &str, columns: &[&str]| TableSchema {
        name: name.to_string(),
        columns: columns
            .iter()
            .map(|c| ColumnSchema {
                name: c.to_string(),
                data_type: "TEXT".to_string(),
            })
            .collect(),
        is_view: false,
    };
    SchemaSnapshot::new(vec![
        table(
            "orders",
            &[
                "order_id",
                "order_total",
                "order_date",
                "status",
                "region",
                "product_category",
            ],
        ),
        table("customers", &["customer_id", "name", "segment"]),
    ])
}

/// Schema provider returning a swappable snapshot
pub struct FixtureSchema {
    snapshot: Mutex<SchemaSnapshot>,
}

impl FixtureSchema {
    pub fn new(snapshot: SchemaSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Replace the snapshot, simulating a schema change between runs
    pub fn replace(&self, snapshot: SchemaSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }
}

#[async_trait]
impl SchemaProvider for FixtureSchema {
    async fn snapshot(&self) -> Result<SchemaSnapshot, SchemaError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

/// Analytic store returning preset rows and recording executed SQL
#[derive(Default)]
pub struct FixtureStore {
    rows: Vec<Value>,
    executed: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<StoreError>>,
}

impl FixtureStore {
    pub fn new(rows: Vec<Value>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    /// Queue a failure to return before any success
    pub fn push_failure(&self, failure: StoreError) {
        self.failures.lock().unwrap().push_back(failure);
    }

    /// SQL texts executed so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnalyticStore for FixtureStore {
    async fn execute(
        &self,
        query: &ValidatedQuery,
        row_limit: u64,
    ) -> Result<QueryOutput, StoreError> {
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        self.executed.lock().unwrap().push(query.sql().to_string());
        let rows: Vec<Value> = self.rows.iter().take(row_limit as usize).cloned().collect();
        let columns = rows
            .first()
            .and_then(|r| r.as_object())
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        let row_count = rows.len();
        Ok(QueryOutput {
            columns,
            rows,
            row_count,
        })
    }
}

/// Agent returning scripted responses per step id
///
/// Steps without a script get a generic success payload. Tracks invocation
/// counts, peak concurrency, and every request it received.
#[derive(Default)]
pub struct ScriptedAgent {
    scripts: Mutex<HashMap<StepId, VecDeque<Result<AgentResponse, AgentFailure>>>>,
    requests: Mutex<Vec<AgentRequest>>,
    invocations: AtomicUsize,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every invocation take this long (for concurrency assertions)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Script the responses for one step, consumed in order
    pub fn script(
        self,
        step_id: &str,
        responses: Vec<Result<AgentResponse, AgentFailure>>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(step_id.to_string(), responses.into());
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Requests received for one step, in order
    pub fn requests_for(&self, step_id: &str) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.step_id == step_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentFailure> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(current, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.step_id)
            .and_then(|queue| queue.pop_front());

        self.current.fetch_sub(1, Ordering::SeqCst);

        match scripted {
            Some(response) => response,
            None => Ok(ok_response(json!({"step": request.step_id}))),
        }
    }
}

/// A successful response with fixed cost metadata
pub fn ok_response(payload: Value) -> AgentResponse {
    AgentResponse {
        payload,
        cost_units: 2,
        latency_ms: 5,
    }
}

/// A query-agent response carrying generated SQL
pub fn sql_response(sql: &str) -> AgentResponse {
    ok_response(json!({ "sql": sql }))
}

/// Step builder with defaults matching production plans
pub fn step(id: &str, kind: StepKind, deps: &[&str]) -> Step {
    Step {
        id: id.to_string(),
        kind,
        inputs: Default::default(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        timeout_secs: 30,
        retry: RetryPolicy::default(),
    }
}

/// Plan builder
pub fn plan(id: &str, steps: Vec<Step>) -> Plan {
    Plan {
        id: id.to_string(),
        steps,
    }
}
