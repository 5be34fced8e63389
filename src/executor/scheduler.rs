//! Plan scheduler
//!
//! Walks a validated plan graph, dispatching ready steps with bounded
//! concurrency and feeding completions back into readiness tracking. Each
//! dispatched step consults the fingerprint cache first; on a miss it invokes
//! the agent abstraction, and query-shaped outputs pass through the grounding
//! validator before anything reaches the analytic store.
//!
//! Per-step state machine: Pending -> Ready -> Running ->
//! {Succeeded, Failed, TimedOut} -> (retry while attempts remain) -> Ready.
//! A step becomes ready the instant all dependencies succeed; the instant any
//! dependency terminally fails, the step and its dependents are skipped
//! without blocking sibling branches. Budget exhaustion stops new dispatch
//! and drains in-flight steps to their own timeouts.

use crate::agents::{AgentFailure, AgentRegistry, AgentRequest};
use crate::cache::{query_fingerprint, step_fingerprint, FingerprintCache, Lookup};
use crate::error::AppError;
use crate::executor::aggregator::{evaluate, CoverageRule, PlanOutcome};
use crate::executor::budget::Budget;
use crate::grounding::{GroundingRejection, GroundingValidator, Verdict};
use crate::plan::types::{
    CostMeta, GroundingRecord, InputBinding, Plan, SkipReason, Step, StepId, StepKind, StepResult,
};
use crate::plan::PlanGraph;
use crate::schema::{SchemaProvider, SchemaSnapshot};
use crate::store::AnalyticStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

/// How many rejection reasons accumulate into grounding-retry feedback
const MAX_GROUNDING_FEEDBACK: usize = 3;

/// Reserved input name carrying rejection feedback into a retried
/// query-generation invocation
const GROUNDING_FEEDBACK_INPUT: &str = "grounding_feedback";

/// Scheduler tuning, derived from [`crate::config::Config`]
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Concurrency ceiling for running steps
    pub max_concurrency: usize,
    /// Time allowance per plan run
    pub plan_timeout: Duration,
    /// Cost allowance per plan run
    pub max_cost_units: i64,
    /// Cost units charged up front per dispatch
    pub dispatch_cost: i64,
    /// Hard row cap for query execution
    pub max_query_rows: u64,
    /// Minimum-coverage rule for the synthesis gate
    pub coverage: CoverageRule,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            plan_timeout: Duration::from_secs(300),
            max_cost_units: 100,
            dispatch_cost: 1,
            max_query_rows: 1000,
            coverage: CoverageRule::default(),
        }
    }
}

/// What one plan execution returns to the caller
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    /// Unique id of this run
    pub run_id: String,
    /// The executed plan
    pub plan_id: String,
    /// Schema version the run was validated against
    pub schema_version: String,
    /// Gate decision plus evidence
    pub outcome: PlanOutcome,
    /// Terminal results in topological order
    pub results: Vec<StepResult>,
    /// Wall-clock duration of the run, in milliseconds
    pub elapsed_ms: u64,
    /// When the report was produced
    pub generated_at: DateTime<Utc>,
}

/// Executes plans against a fixed set of collaborators
///
/// The cache and agent registry may be shared across concurrent runs; the
/// budget never is. Each execution creates its own.
pub struct PlanRunner {
    agents: Arc<AgentRegistry>,
    cache: Arc<FingerprintCache>,
    store: Arc<dyn AnalyticStore>,
    schema: Arc<dyn SchemaProvider>,
    validator: Arc<GroundingValidator>,
    options: ExecutorOptions,
}

/// Everything a running step needs, cloned into its task
#[derive(Clone)]
struct StepContext {
    agents: Arc<AgentRegistry>,
    cache: Arc<FingerprintCache>,
    store: Arc<dyn AnalyticStore>,
    validator: Arc<GroundingValidator>,
    snapshot: Arc<SchemaSnapshot>,
    budget: Arc<Budget>,
    semaphore: Arc<Semaphore>,
    max_query_rows: u64,
}

/// Failure modes specific to the query-step pipeline
enum QueryStepError {
    /// The validator rejected the generated query
    Rejected(GroundingRejection),
    /// The agent produced no usable query text
    Malformed(String),
    /// The analytic store failed (already retried once when transient)
    Store(String),
}

impl PlanRunner {
    /// Create a runner over the given collaborators
    pub fn new(
        agents: Arc<AgentRegistry>,
        cache: Arc<FingerprintCache>,
        store: Arc<dyn AnalyticStore>,
        schema: Arc<dyn SchemaProvider>,
        validator: Arc<GroundingValidator>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            agents,
            cache,
            store,
            schema,
            validator,
            options,
        }
    }

    /// Execute a plan with the configured default budget
    pub async fn execute(&self, plan: Plan) -> Result<PlanReport, AppError> {
        self.execute_with_limits(plan, None, None).await
    }

    /// Execute a plan, optionally overriding the budget allowances
    ///
    /// # Arguments
    /// * `plan` - The plan to execute
    /// * `max_cost_units` - Cost allowance override for this run
    /// * `max_duration` - Time allowance override for this run
    ///
    /// # Returns
    /// * `Ok(PlanReport)` - Terminal results plus the synthesis-gate outcome
    /// * `Err(AppError)` - Structural rejection or schema unavailability;
    ///   execution never started
    pub async fn execute_with_limits(
        &self,
        plan: Plan,
        max_cost_units: Option<i64>,
        max_duration: Option<Duration>,
    ) -> Result<PlanReport, AppError> {
        let graph = Arc::new(PlanGraph::build(plan)?);
        let run_id = Uuid::new_v4().to_string();
        let started = std::time::Instant::now();

        // One snapshot per run keeps validation consistent across steps.
        let snapshot = Arc::new(self.schema.snapshot().await?);
        let budget = Arc::new(Budget::new(
            max_cost_units.unwrap_or(self.options.max_cost_units),
            max_duration.unwrap_or(self.options.plan_timeout),
        ));

        tracing::debug!(
            run_id = %run_id,
            plan_id = %graph.plan().id,
            total_steps = graph.len(),
            schema_version = %snapshot.version(),
            "Starting plan execution"
        );

        let context = StepContext {
            agents: self.agents.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            validator: self.validator.clone(),
            snapshot: snapshot.clone(),
            budget: budget.clone(),
            semaphore: Arc::new(Semaphore::new(self.options.max_concurrency)),
            max_query_rows: self.options.max_query_rows,
        };

        let mut in_degree = graph.in_degrees();
        let mut ready: VecDeque<StepId> = graph.roots().into();
        let mut results: BTreeMap<StepId, StepResult> = BTreeMap::new();
        let mut running: JoinSet<StepResult> = JoinSet::new();
        let mut running_ids: HashSet<StepId> = HashSet::new();
        let mut budget_stopped = false;

        loop {
            // Dispatch everything ready, unless the budget ran out first.
            while let Some(step_id) = ready.pop_front() {
                if budget.is_exhausted() {
                    ready.push_front(step_id);
                    break;
                }
                let step = graph
                    .step(&step_id)
                    .expect("ready step exists in validated graph")
                    .clone();
                let inputs = resolve_inputs(&step, &results);
                budget.charge(self.options.dispatch_cost as u64);
                running_ids.insert(step_id.clone());
                let ctx = context.clone();
                running.spawn(async move { run_step(ctx, step, inputs).await });
            }

            // Budget exhaustion: every step not yet dispatched is skipped;
            // running steps are left to drain.
            if !budget_stopped && budget.is_exhausted() {
                budget_stopped = true;
                tracing::warn!(
                    run_id = %run_id,
                    remaining_cost = budget.remaining_cost(),
                    remaining_time_ms = budget.remaining_time().as_millis() as u64,
                    "Budget exhausted; skipping undispatched steps"
                );
                ready.clear();
                for step_id in graph.topo_order() {
                    if results.contains_key(step_id) || running_ids.contains(step_id) {
                        continue;
                    }
                    let step = graph.step(step_id).expect("step in validated graph");
                    results.insert(
                        step_id.clone(),
                        StepResult::skipped(step_id.clone(), step.kind, SkipReason::BudgetExhausted),
                    );
                }
            }

            let Some(joined) = running.join_next().await else {
                if ready.is_empty() {
                    break;
                }
                continue;
            };
            let result = joined.map_err(|e| {
                AppError::PlanExecutionFailed(format!("step task terminated abnormally: {e}"))
            })?;

            budget.charge(result.cost.cost_units);
            running_ids.remove(&result.step_id);
            let step_id = result.step_id.clone();
            let succeeded = result.is_success();
            tracing::debug!(
                run_id = %run_id,
                step_id = %step_id,
                status = ?result.status,
                cached = result.cached,
                "Step reached terminal state"
            );
            results.insert(step_id.clone(), result);

            if budget_stopped {
                continue;
            }

            if succeeded {
                for dependent in graph.dependents(&step_id) {
                    if results.contains_key(dependent) {
                        continue;
                    }
                    let count = in_degree
                        .get_mut(dependent)
                        .expect("dependent in validated graph");
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent.clone());
                    }
                }
            } else {
                cascade_skip(&graph, &step_id, &mut results);
            }
        }

        let outcome = evaluate(&graph, &results, &self.options.coverage);
        let ordered_results: Vec<StepResult> = graph
            .topo_order()
            .iter()
            .filter_map(|id| results.get(id).cloned())
            .collect();

        let report = PlanReport {
            run_id,
            plan_id: graph.plan().id.clone(),
            schema_version: snapshot.version().to_string(),
            outcome,
            results: ordered_results,
            elapsed_ms: started.elapsed().as_millis() as u64,
            generated_at: Utc::now(),
        };

        tracing::info!(
            run_id = %report.run_id,
            plan_id = %report.plan_id,
            elapsed_ms = report.elapsed_ms,
            "Plan execution finished"
        );

        Ok(report)
    }
}

/// Skip every not-yet-terminal transitive dependent of a failed step
fn cascade_skip(
    graph: &PlanGraph,
    failed_id: &str,
    results: &mut BTreeMap<StepId, StepResult>,
) {
    let mut worklist: Vec<(StepId, StepId)> = graph
        .dependents(failed_id)
        .iter()
        .map(|d| (d.clone(), failed_id.to_string()))
        .collect();

    while let Some((step_id, dependency)) = worklist.pop() {
        if results.contains_key(&step_id) {
            continue;
        }
        let step = graph.step(&step_id).expect("step in validated graph");
        results.insert(
            step_id.clone(),
            StepResult::skipped(
                step_id.clone(),
                step.kind,
                SkipReason::DependencyFailed { dependency },
            ),
        );
        for dependent in graph.dependents(&step_id) {
            worklist.push((dependent.clone(), step_id.clone()));
        }
    }
}

/// Resolve a step's input bindings against terminal dependency results
fn resolve_inputs(step: &Step, results: &BTreeMap<StepId, StepResult>) -> BTreeMap<String, Value> {
    step.inputs
        .iter()
        .map(|(name, binding)| {
            let value = match binding {
                InputBinding::Literal { value } => value.clone(),
                InputBinding::StepOutput { step: source } => results
                    .get(source)
                    .and_then(|r| r.payload.clone())
                    .unwrap_or(Value::Null),
            };
            (name.clone(), value)
        })
        .collect()
}

/// Run one step: cache check, agent invocation, grounding, execution
async fn run_step(ctx: StepContext, step: Step, inputs: BTreeMap<String, Value>) -> StepResult {
    let permit = match ctx.semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return StepResult::failed(
                step.id.clone(),
                step.kind,
                "scheduler shut down before dispatch".to_string(),
                CostMeta::default(),
            );
        }
    };

    let fingerprint = step_fingerprint(step.kind, &inputs, ctx.snapshot.version());
    let result = match ctx.cache.lookup(&fingerprint).await {
        Lookup::Hit(mut hit) => {
            tracing::debug!(
                step_id = %step.id,
                fingerprint = %fingerprint,
                "Fingerprint cache hit"
            );
            hit.step_id = step.id.clone();
            hit.cached = true;
            hit.cost = CostMeta::default();
            hit
        }
        Lookup::Miss(guard) => {
            let result = run_step_uncached(&ctx, &step, &inputs).await;
            if result.is_success() {
                // Only validated / successfully executed results are cached.
                guard.complete(&result).await;
            }
            result
        }
    };

    drop(permit);
    result
}

/// The expensive path: invoke the agent with retry/backoff and, for query
/// steps, ground and execute the generated query
async fn run_step_uncached(
    ctx: &StepContext,
    step: &Step,
    inputs: &BTreeMap<String, Value>,
) -> StepResult {
    let Some(agent) = ctx.agents.get(step.kind) else {
        return StepResult::failed(
            step.id.clone(),
            step.kind,
            format!("no agent registered for kind '{}'", step.kind.as_str()),
            CostMeta::default(),
        );
    };

    let step_timeout = Duration::from_secs(step.timeout_secs);
    let max_attempts = step.retry.max_attempts.max(1);
    let started = std::time::Instant::now();
    let mut cost_units: u64 = 0;
    let mut attempts: u32 = 0;
    let mut feedback: VecDeque<GroundingRejection> = VecDeque::new();
    let mut rejection_log: Vec<String> = Vec::new();

    loop {
        attempts += 1;

        let mut effective_inputs = inputs.clone();
        if !feedback.is_empty() {
            // Bounded feedback: the most recent rejection reasons only.
            let reasons: Vec<&GroundingRejection> = feedback.iter().collect();
            effective_inputs.insert(GROUNDING_FEEDBACK_INPUT.to_string(), json!(reasons));
        }

        let request = AgentRequest {
            step_id: step.id.clone(),
            kind: step.kind,
            inputs: effective_inputs,
            budget_remaining: ctx.budget.snapshot(),
        };

        let transient_error = match tokio::time::timeout(step_timeout, agent.invoke(request)).await
        {
            Err(_) => {
                tracing::warn!(
                    step_id = %step.id,
                    attempt = attempts,
                    timeout_secs = step.timeout_secs,
                    "Step invocation timed out"
                );
                format!("invocation timed out after {}s", step.timeout_secs)
            }
            Ok(Err(AgentFailure::Transient(message))) => {
                tracing::warn!(
                    step_id = %step.id,
                    attempt = attempts,
                    error = %message,
                    "Transient agent failure"
                );
                message
            }
            Ok(Err(AgentFailure::Permanent(message))) => {
                return terminal_failure(step, message, started, cost_units, attempts, None);
            }
            Ok(Ok(response)) => {
                cost_units += response.cost_units;

                if step.kind != StepKind::Query {
                    return StepResult::succeeded(
                        step.id.clone(),
                        step.kind,
                        response.payload,
                        CostMeta {
                            latency_ms: started.elapsed().as_millis() as u64,
                            cost_units,
                            attempts,
                        },
                    );
                }

                match ground_and_execute(ctx, step, &response.payload).await {
                    Ok(payload) => {
                        let mut result = StepResult::succeeded(
                            step.id.clone(),
                            step.kind,
                            payload,
                            CostMeta {
                                latency_ms: started.elapsed().as_millis() as u64,
                                cost_units,
                                attempts,
                            },
                        );
                        result.grounding = Some(GroundingRecord {
                            approved: true,
                            rejections: rejection_log,
                        });
                        return result;
                    }
                    Err(QueryStepError::Malformed(message)) => {
                        return terminal_failure(
                            step,
                            message,
                            started,
                            cost_units,
                            attempts,
                            None,
                        );
                    }
                    Err(QueryStepError::Store(message)) => {
                        return terminal_failure(
                            step,
                            message,
                            started,
                            cost_units,
                            attempts,
                            Some(GroundingRecord {
                                approved: true,
                                rejections: rejection_log,
                            }),
                        );
                    }
                    Err(QueryStepError::Rejected(rejection)) => {
                        tracing::warn!(
                            step_id = %step.id,
                            attempt = attempts,
                            rejection = %rejection,
                            "Generated query rejected by grounding"
                        );
                        rejection_log.push(rejection.to_string());
                        feedback.push_back(rejection);
                        while feedback.len() > MAX_GROUNDING_FEEDBACK {
                            feedback.pop_front();
                        }
                        if attempts >= max_attempts {
                            return terminal_failure(
                                step,
                                format!("query grounding rejected after {attempts} attempts"),
                                started,
                                cost_units,
                                attempts,
                                Some(GroundingRecord {
                                    approved: false,
                                    rejections: rejection_log,
                                }),
                            );
                        }
                        // Feedback retries go straight back to the agent; the
                        // rejection is deterministic, waiting would not help.
                        continue;
                    }
                }
            }
        };

        // Transient path: retry with exponential backoff while attempts remain.
        if attempts >= max_attempts {
            return terminal_failure(
                step,
                format!("{transient_error} (after {attempts} attempts)"),
                started,
                cost_units,
                attempts,
                None,
            );
        }
        let backoff = step
            .retry
            .backoff_ms
            .saturating_mul(1u64 << (attempts - 1).min(16));
        tokio::time::sleep(Duration::from_millis(backoff)).await;
    }
}

fn terminal_failure(
    step: &Step,
    error: String,
    started: std::time::Instant,
    cost_units: u64,
    attempts: u32,
    grounding: Option<GroundingRecord>,
) -> StepResult {
    let mut result = StepResult::failed(
        step.id.clone(),
        step.kind,
        error,
        CostMeta {
            latency_ms: started.elapsed().as_millis() as u64,
            cost_units,
            attempts,
        },
    );
    result.grounding = grounding;
    result
}

/// Ground a query-shaped agent output and execute it against the store
///
/// The validated, normalized SQL (never the raw agent text) keys a second
/// cache entry so semantically identical queries from different bindings
/// share one execution.
async fn ground_and_execute(
    ctx: &StepContext,
    step: &Step,
    payload: &Value,
) -> Result<Value, QueryStepError> {
    let Some(sql) = payload.get("sql").and_then(Value::as_str) else {
        return Err(QueryStepError::Malformed(
            "query agent output has no 'sql' field".to_string(),
        ));
    };

    let validated = match ctx.validator.validate(sql, &ctx.snapshot) {
        Verdict::Approved(query) => query,
        Verdict::Rejected(rejection) => return Err(QueryStepError::Rejected(rejection)),
    };

    let fingerprint = query_fingerprint(validated.sql(), ctx.snapshot.version());
    if let Some(hit) = ctx.cache.peek(&fingerprint).await {
        if let Some(payload) = hit.payload {
            tracing::debug!(
                step_id = %step.id,
                fingerprint = %fingerprint,
                "Query fingerprint cache hit"
            );
            return Ok(payload);
        }
    }

    // Transient store failures get exactly one retry.
    let mut retried = false;
    let output = loop {
        match ctx.store.execute(&validated, ctx.max_query_rows).await {
            Ok(output) => break output,
            Err(e) if e.is_transient() && !retried => {
                tracing::warn!(step_id = %step.id, error = %e, "Retrying transient store failure");
                retried = true;
            }
            Err(e) => return Err(QueryStepError::Store(e.to_string())),
        }
    };

    let payload = json!({
        "sql": validated.sql(),
        "columns": output.columns,
        "rows": output.rows,
        "row_count": output.row_count,
    });

    let cache_entry = StepResult::succeeded(
        step.id.clone(),
        StepKind::Query,
        payload.clone(),
        CostMeta::default(),
    );
    ctx.cache.insert(&fingerprint, &cache_entry).await;

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::plan::types::StepStatus;
    use crate::testutil::{
        ok_response, plan, snapshot, sql_response, step, FixtureSchema, FixtureStore,
        ScriptedAgent,
    };
    use serde_json::json;

    fn make_runner(
        registry: AgentRegistry,
        store: Arc<FixtureStore>,
        schema: Arc<FixtureSchema>,
        options: ExecutorOptions,
    ) -> (PlanRunner, Arc<FingerprintCache>) {
        let cache = Arc::new(FingerprintCache::new(
            Arc::new(InMemoryCacheStore::new()),
            Duration::from_secs(600),
        ));
        let runner = PlanRunner::new(
            Arc::new(registry),
            cache.clone(),
            store,
            schema,
            Arc::new(GroundingValidator::default()),
            options,
        );
        (runner, cache)
    }

    fn result<'a>(report: &'a PlanReport, step_id: &str) -> &'a StepResult {
        report
            .results
            .iter()
            .find(|r| r.step_id == step_id)
            .unwrap_or_else(|| panic!("no result for step '{step_id}'"))
    }

    #[tokio::test]
    async fn test_dependency_outputs_visible_downstream() {
        let agent = Arc::new(ScriptedAgent::new());
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Understanding, agent.clone());
        registry.register(StepKind::Calculation, agent.clone());
        registry.register(StepKind::Synthesis, agent.clone());

        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let store = Arc::new(FixtureStore::new(vec![]));
        let (runner, _) = make_runner(registry, store, schema, ExecutorOptions::default());

        let mut b = step("b", StepKind::Calculation, &["a"]);
        b.inputs.insert(
            "data".to_string(),
            InputBinding::StepOutput {
                step: "a".to_string(),
            },
        );
        let mut c = step("c", StepKind::Synthesis, &["b"]);
        c.inputs.insert(
            "analysis".to_string(),
            InputBinding::StepOutput {
                step: "b".to_string(),
            },
        );

        let report = runner
            .execute(plan(
                "plan_chain",
                vec![step("a", StepKind::Understanding, &[]), b, c],
            ))
            .await
            .unwrap();

        // Each step saw exactly its dependency's terminal payload.
        assert_eq!(
            agent.requests_for("b")[0].inputs["data"],
            json!({"step": "a"})
        );
        assert_eq!(
            agent.requests_for("c")[0].inputs["analysis"],
            json!({"step": "b"})
        );
        assert!(matches!(report.outcome, PlanOutcome::Complete { .. }));
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_is_respected() {
        let agent = Arc::new(ScriptedAgent::new().with_delay(Duration::from_millis(25)));
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Understanding, agent.clone());

        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let store = Arc::new(FixtureStore::new(vec![]));
        let options = ExecutorOptions {
            max_concurrency: 2,
            ..Default::default()
        };
        let (runner, _) = make_runner(registry, store, schema, options);

        let steps = (0..4)
            .map(|i| step(&format!("s{i}"), StepKind::Understanding, &[]))
            .collect();
        let report = runner.execute(plan("plan_fanout", steps)).await.unwrap();

        assert_eq!(report.results.len(), 4);
        assert!(report.results.iter().all(|r| r.is_success()));
        assert_eq!(agent.invocations(), 4);
        assert!(
            agent.max_concurrent() <= 2,
            "ceiling exceeded: {}",
            agent.max_concurrent()
        );
        assert_eq!(agent.max_concurrent(), 2, "independent steps should overlap");
    }

    #[tokio::test]
    async fn test_grounding_rejection_feedback_retry_scenario() {
        // A is rejected twice by grounding then approved on the third
        // attempt; B consumes A's approved result; C runs independently.
        let query_agent = Arc::new(ScriptedAgent::new().script(
            "fetch",
            vec![
                Ok(sql_response("SELECT revenue FROM invoices")),
                Ok(sql_response("SELECT profit FROM orders")),
                Ok(sql_response("SELECT region, order_total FROM orders")),
            ],
        ));
        let calc_agent = Arc::new(ScriptedAgent::new());
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Query, query_agent.clone());
        registry.register(StepKind::Calculation, calc_agent.clone());

        let store = Arc::new(FixtureStore::new(vec![
            json!({"region": "emea", "order_total": 120.0}),
        ]));
        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let (runner, _) = make_runner(
            registry,
            store.clone(),
            schema,
            ExecutorOptions::default(),
        );

        let mut fetch = step("fetch", StepKind::Query, &[]);
        fetch.retry.max_attempts = 3;
        let mut compare = step("compare", StepKind::Calculation, &["fetch"]);
        compare.inputs.insert(
            "data".to_string(),
            InputBinding::StepOutput {
                step: "fetch".to_string(),
            },
        );
        let baseline = step("baseline", StepKind::Calculation, &[]);

        let report = runner
            .execute(plan("plan_scenario", vec![fetch, compare, baseline]))
            .await
            .unwrap();

        // A: three attempts, approved on the last, rejections recorded.
        assert_eq!(query_agent.invocations(), 3);
        let fetch_result = result(&report, "fetch");
        assert!(fetch_result.is_success());
        let grounding = fetch_result.grounding.as_ref().unwrap();
        assert!(grounding.approved);
        assert_eq!(grounding.rejections.len(), 2);
        assert!(grounding.rejections[0].contains("invoices"));
        assert!(grounding.rejections[1].contains("profit"));

        // Rejection feedback was threaded into retries, bounded and ordered.
        let requests = query_agent.requests_for("fetch");
        assert!(!requests[0].inputs.contains_key("grounding_feedback"));
        assert_eq!(
            requests[1].inputs["grounding_feedback"]
                .as_array()
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            requests[2].inputs["grounding_feedback"]
                .as_array()
                .unwrap()
                .len(),
            2
        );
        assert!(requests[1].inputs["grounding_feedback"]
            .to_string()
            .contains("invoices"));

        // B executed once with A's approved execution result.
        let compare_requests = calc_agent.requests_for("compare");
        assert_eq!(compare_requests.len(), 1);
        let data = &compare_requests[0].inputs["data"];
        assert_eq!(data["row_count"], 1);
        assert!(data["sql"].as_str().unwrap().contains("FROM orders"));

        // Only the approved query crossed the store boundary, limit-capped.
        let executed = store.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("FROM orders"));
        assert!(executed[0].ends_with("LIMIT 1000"));

        // Final aggregation includes both B and C.
        match report.outcome {
            PlanOutcome::Complete { bundle } => {
                assert!(bundle.evidence.contains_key("compare"));
                assert!(bundle.evidence.contains_key("baseline"));
            }
            other => panic!("expected complete outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dependency_failure_cascades_without_blocking_siblings() {
        let agent = Arc::new(ScriptedAgent::new().script(
            "a",
            vec![Err(AgentFailure::Permanent("unparseable output".into()))],
        ));
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Understanding, agent.clone());
        registry.register(StepKind::Calculation, agent.clone());
        registry.register(StepKind::Synthesis, agent.clone());

        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let store = Arc::new(FixtureStore::new(vec![]));
        let (runner, _) = make_runner(registry, store, schema, ExecutorOptions::default());

        let report = runner
            .execute(plan(
                "plan_cascade",
                vec![
                    step("a", StepKind::Understanding, &[]),
                    step("b", StepKind::Calculation, &["a"]),
                    step("d", StepKind::Synthesis, &["b"]),
                    step("c", StepKind::Calculation, &[]),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(result(&report, "a").status, StepStatus::Failed);
        assert_eq!(
            result(&report, "b").skip_reason,
            Some(SkipReason::DependencyFailed {
                dependency: "a".to_string()
            })
        );
        assert_eq!(
            result(&report, "d").skip_reason,
            Some(SkipReason::DependencyFailed {
                dependency: "b".to_string()
            })
        );
        // The independent branch still completed.
        assert!(result(&report, "c").is_success());

        // Permanent failures are not retried.
        assert_eq!(agent.requests_for("a").len(), 1);

        match report.outcome {
            PlanOutcome::Partial { bundle, omissions } => {
                assert!(bundle.evidence.contains_key("c"));
                assert_eq!(omissions.len(), 3);
            }
            other => panic!("expected partial outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_budget_exhaustion_stops_dispatch_and_drains() {
        let agent = Arc::new(ScriptedAgent::new());
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Understanding, agent.clone());

        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let store = Arc::new(FixtureStore::new(vec![]));
        let options = ExecutorOptions {
            // Two dispatches (1 each) plus two completions (2 each) spend it.
            max_cost_units: 6,
            ..Default::default()
        };
        let (runner, _) = make_runner(registry, store, schema, options);

        let report = runner
            .execute(plan(
                "plan_budget",
                vec![
                    step("a", StepKind::Understanding, &[]),
                    step("b", StepKind::Understanding, &["a"]),
                    step("c", StepKind::Understanding, &["b"]),
                ],
            ))
            .await
            .unwrap();

        // Every step has a terminal status; nothing is abandoned.
        assert_eq!(report.results.len(), 3);
        assert!(result(&report, "a").is_success());
        assert!(result(&report, "b").is_success());
        assert_eq!(
            result(&report, "c").skip_reason,
            Some(SkipReason::BudgetExhausted)
        );
        // No dispatch happened after exhaustion.
        assert_eq!(agent.invocations(), 2);
    }

    #[tokio::test]
    async fn test_cache_idempotence_across_runs() {
        let agent = Arc::new(ScriptedAgent::new());
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Understanding, agent.clone());

        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let store = Arc::new(FixtureStore::new(vec![]));
        let (runner, _) = make_runner(registry, store, schema, ExecutorOptions::default());

        let first = runner
            .execute(plan("plan_a", vec![step("only", StepKind::Understanding, &[])]))
            .await
            .unwrap();
        assert_eq!(agent.invocations(), 1);
        assert!(!result(&first, "only").cached);

        let second = runner
            .execute(plan("plan_b", vec![step("only", StepKind::Understanding, &[])]))
            .await
            .unwrap();

        // The expensive path ran exactly once; the second caller was served
        // from cache.
        assert_eq!(agent.invocations(), 1);
        let cached = result(&second, "only");
        assert!(cached.cached);
        assert!(cached.is_success());
        assert_eq!(cached.payload, result(&first, "only").payload);
    }

    #[tokio::test]
    async fn test_schema_version_change_invalidates_cached_results() {
        let agent = Arc::new(ScriptedAgent::new());
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Understanding, agent.clone());

        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let store = Arc::new(FixtureStore::new(vec![]));
        let (runner, _) = make_runner(
            registry,
            store,
            schema.clone(),
            ExecutorOptions::default(),
        );

        let single_step_plan =
            |id: &str| plan(id, vec![step("only", StepKind::Understanding, &[])]);

        runner.execute(single_step_plan("plan_a")).await.unwrap();
        assert_eq!(agent.invocations(), 1);

        // The schema changes between sessions; old entries become unreachable.
        let mut altered = crate::schema::TableSchema {
            name: "orders".to_string(),
            columns: vec![crate::schema::ColumnSchema {
                name: "order_id".to_string(),
                data_type: "INTEGER".to_string(),
            }],
            is_view: false,
        };
        altered.columns.push(crate::schema::ColumnSchema {
            name: "discount".to_string(),
            data_type: "REAL".to_string(),
        });
        schema.replace(crate::schema::SchemaSnapshot::new(vec![altered]));

        let report = runner.execute(single_step_plan("plan_b")).await.unwrap();
        assert_eq!(agent.invocations(), 2);
        assert!(!result(&report, "only").cached);
    }

    #[tokio::test]
    async fn test_concurrent_runs_share_one_flight_per_fingerprint() {
        let agent = Arc::new(ScriptedAgent::new().with_delay(Duration::from_millis(20)));
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Understanding, agent.clone());

        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let store = Arc::new(FixtureStore::new(vec![]));
        let (runner, _) = make_runner(registry, store, schema, ExecutorOptions::default());

        let make_plan = |id: &str| plan(id, vec![step("shared", StepKind::Understanding, &[])]);
        let (first, second) = tokio::join!(
            runner.execute(make_plan("plan_one")),
            runner.execute(make_plan("plan_two"))
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        // Both executions received the same result from one invocation.
        assert_eq!(agent.invocations(), 1);
        assert!(result(&first, "shared").is_success());
        assert!(result(&second, "shared").is_success());
        assert_eq!(
            result(&first, "shared").payload,
            result(&second, "shared").payload
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_with_backoff() {
        let agent = Arc::new(ScriptedAgent::new().script(
            "a",
            vec![
                Err(AgentFailure::Transient("rate limited".into())),
                Ok(ok_response(json!({"v": 1}))),
            ],
        ));
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Understanding, agent.clone());

        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let store = Arc::new(FixtureStore::new(vec![]));
        let (runner, _) = make_runner(registry, store, schema, ExecutorOptions::default());

        let report = runner
            .execute(plan("plan_retry", vec![step("a", StepKind::Understanding, &[])]))
            .await
            .unwrap();

        let a = result(&report, "a");
        assert!(a.is_success());
        assert_eq!(a.cost.attempts, 2);
        assert_eq!(agent.invocations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invocation_timeout_exhausts_retries() {
        // Every invocation sleeps past the step timeout.
        let agent = Arc::new(ScriptedAgent::new().with_delay(Duration::from_secs(5)));
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Understanding, agent.clone());

        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let store = Arc::new(FixtureStore::new(vec![]));
        let (runner, _) = make_runner(registry, store, schema, ExecutorOptions::default());

        let mut slow = step("slow", StepKind::Understanding, &[]);
        slow.timeout_secs = 1;
        slow.retry.max_attempts = 2;

        let report = runner
            .execute(plan("plan_timeout", vec![slow]))
            .await
            .unwrap();

        let result = result(&report, "slow");
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.as_ref().unwrap().contains("timed out"));
        assert_eq!(result.cost.attempts, 2);
        assert_eq!(agent.invocations(), 2);
    }

    #[tokio::test]
    async fn test_query_agent_output_without_sql_is_permanent() {
        let agent = Arc::new(
            ScriptedAgent::new().script("q", vec![Ok(ok_response(json!({"text": "no sql"})))]),
        );
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Query, agent.clone());

        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let store = Arc::new(FixtureStore::new(vec![]));
        let (runner, _) = make_runner(registry, store, schema, ExecutorOptions::default());

        let report = runner
            .execute(plan("plan_malformed", vec![step("q", StepKind::Query, &[])]))
            .await
            .unwrap();

        let q = result(&report, "q");
        assert_eq!(q.status, StepStatus::Failed);
        assert!(q.error.as_ref().unwrap().contains("no 'sql'"));
        // Malformed output is permanent; no retry happened.
        assert_eq!(agent.invocations(), 1);
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_retried_once() {
        let agent = Arc::new(ScriptedAgent::new().script(
            "q",
            vec![Ok(sql_response("SELECT region FROM orders LIMIT 10"))],
        ));
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Query, agent.clone());

        let store = Arc::new(FixtureStore::new(vec![json!({"region": "emea"})]));
        store.push_failure(crate::store::StoreError::Timeout("pool busy".into()));
        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let (runner, _) = make_runner(registry, store.clone(), schema, ExecutorOptions::default());

        let report = runner
            .execute(plan("plan_store_retry", vec![step("q", StepKind::Query, &[])]))
            .await
            .unwrap();

        assert!(result(&report, "q").is_success());
        assert_eq!(store.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_store_failure_terminates_step() {
        let agent = Arc::new(ScriptedAgent::new().script(
            "q",
            vec![Ok(sql_response("SELECT region FROM orders LIMIT 10"))],
        ));
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Query, agent.clone());

        let store = Arc::new(FixtureStore::new(vec![]));
        store.push_failure(crate::store::StoreError::Execution("bad aggregate".into()));
        let schema = Arc::new(FixtureSchema::new(snapshot()));
        let (runner, _) = make_runner(registry, store.clone(), schema, ExecutorOptions::default());

        let report = runner
            .execute(plan("plan_store_fail", vec![step("q", StepKind::Query, &[])]))
            .await
            .unwrap();

        let q = result(&report, "q");
        assert_eq!(q.status, StepStatus::Failed);
        assert!(q.error.as_ref().unwrap().contains("execution failure"));
        assert!(store.executed().is_empty());
    }
}
