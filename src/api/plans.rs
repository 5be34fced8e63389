//! Plan intake handlers
//!
//! The structured plan arrives from an external planning stage; this handler
//! only validates its shape, executes it, and returns the report. Plan
//! generation never happens here.

use crate::error::AppError;
use crate::executor::PlanReport;
use crate::plan::types::Plan;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Request body for plan execution
#[derive(Debug, Deserialize)]
pub struct ExecutePlanRequest {
    /// The plan to execute
    pub plan: Plan,
    /// Cost allowance override for this run
    #[serde(default)]
    pub max_cost_units: Option<i64>,
    /// Time allowance override for this run, in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// POST /api/plans/execute - Execute an investigation plan
///
/// # Arguments
/// * `State(state)` - Application state
/// * `Json(request)` - The plan plus optional budget overrides
///
/// # Returns
/// * `Ok(Json<PlanReport>)` - Terminal step results and the gate outcome
/// * `Err(AppError)` - Structural rejection (`InvalidPlan`) or schema
///   unavailability; nothing executed
pub async fn execute_plan(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecutePlanRequest>,
) -> Result<Json<PlanReport>, AppError> {
    tracing::info!(
        plan_id = %request.plan.id,
        total_steps = request.plan.steps.len(),
        "Received plan for execution"
    );

    let report = state
        .runner
        .execute_with_limits(
            request.plan,
            request.max_cost_units,
            request.timeout_secs.map(Duration::from_secs),
        )
        .await?;

    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRegistry;
    use crate::config::Config;
    use crate::executor::PlanOutcome;
    use crate::plan::types::StepKind;
    use crate::testutil::{plan, snapshot, step, FixtureSchema, FixtureStore, ScriptedAgent};
    use serde_json::json;

    fn test_state() -> Arc<AppState> {
        let agent = Arc::new(ScriptedAgent::new());
        let mut registry = AgentRegistry::new();
        registry.register(StepKind::Understanding, agent);
        Arc::new(AppState::assemble(
            Config::from_env(),
            Arc::new(registry),
            Arc::new(FixtureStore::new(vec![])),
            Arc::new(FixtureSchema::new(snapshot())),
        ))
    }

    #[tokio::test]
    async fn test_execute_plan_returns_report() {
        let state = test_state();
        let request = ExecutePlanRequest {
            plan: plan("plan_api", vec![step("a", StepKind::Understanding, &[])]),
            max_cost_units: None,
            timeout_secs: None,
        };

        let Json(report) = execute_plan(State(state), Json(request)).await.unwrap();
        assert_eq!(report.plan_id, "plan_api");
        assert!(matches!(report.outcome, PlanOutcome::Complete { .. }));
        assert_eq!(report.results.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_plan_is_rejected_before_execution() {
        let state = test_state();
        let request = ExecutePlanRequest {
            plan: plan("plan_bad", vec![step("a", StepKind::Understanding, &["ghost"])]),
            max_cost_units: None,
            timeout_secs: None,
        };

        let err = execute_plan(State(state), Json(request)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidPlan(_)));
    }

    #[test]
    fn test_request_body_shape() {
        let request: ExecutePlanRequest = serde_json::from_value(json!({
            "plan": {
                "id": "plan_wire",
                "steps": [
                    {"id": "fetch", "kind": "query"},
                    {
                        "id": "calc",
                        "kind": "calculation",
                        "dependencies": ["fetch"],
                        "inputs": {
                            "data": {"type": "step_output", "step": "fetch"},
                            "comparison_type": {"type": "literal", "value": "percentage_change"}
                        }
                    }
                ]
            },
            "max_cost_units": 50
        }))
        .unwrap();

        assert_eq!(request.plan.steps.len(), 2);
        assert_eq!(request.max_cost_units, Some(50));
        assert!(request.timeout_secs.is_none());
    }
}
