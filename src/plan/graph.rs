//! Plan graph builder
//!
//! Converts a plan description into a validated execution DAG. Validation and
//! topological ordering happen once here; the executor consumes the result as
//! a partial order (in-degree counts plus a dependents map) so independent
//! branches can run concurrently.

use crate::error::AppError;
use crate::plan::types::{InputBinding, Plan, Step, StepId};
use std::collections::{HashMap, HashSet, VecDeque};

/// A validated, topologically ordered execution DAG
///
/// Construction fails with `AppError::InvalidPlan` when the plan is empty,
/// contains a duplicate step id, a dependency references an unknown or
/// later-defined step, an input binding references a non-dependency, or a
/// cycle exists.
#[derive(Debug, Clone)]
pub struct PlanGraph {
    plan: Plan,
    steps: HashMap<StepId, Step>,
    dependents: HashMap<StepId, Vec<StepId>>,
    topo_order: Vec<StepId>,
}

impl PlanGraph {
    /// Validate a plan and build its execution DAG
    ///
    /// # Arguments
    /// * `plan` - The plan to validate
    ///
    /// # Returns
    /// * `Ok(PlanGraph)` - The validated DAG
    /// * `Err(AppError::InvalidPlan)` - If any structural invariant is violated
    pub fn build(plan: Plan) -> Result<Self, AppError> {
        if plan.steps.is_empty() {
            return Err(AppError::InvalidPlan("plan has no steps".to_string()));
        }

        let mut steps: HashMap<StepId, Step> = HashMap::new();
        let mut seen_order: HashMap<StepId, usize> = HashMap::new();

        for (position, step) in plan.steps.iter().enumerate() {
            if steps.insert(step.id.clone(), step.clone()).is_some() {
                return Err(AppError::InvalidPlan(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            seen_order.insert(step.id.clone(), position);
        }

        // Dependencies must reference existing, earlier-defined steps.
        for step in &plan.steps {
            let mut unique_deps = HashSet::new();
            for dep in &step.dependencies {
                if !unique_deps.insert(dep.clone()) {
                    return Err(AppError::InvalidPlan(format!(
                        "step '{}' lists dependency '{}' more than once",
                        step.id, dep
                    )));
                }
                match seen_order.get(dep) {
                    None => {
                        return Err(AppError::InvalidPlan(format!(
                            "step '{}' depends on unknown step '{}'",
                            step.id, dep
                        )));
                    }
                    Some(dep_pos) if *dep_pos >= seen_order[&step.id] => {
                        return Err(AppError::InvalidPlan(format!(
                            "step '{}' depends on later-defined step '{}'",
                            step.id, dep
                        )));
                    }
                    Some(_) => {}
                }
            }

            // Input bindings may only read outputs of declared dependencies.
            for (name, binding) in &step.inputs {
                if let InputBinding::StepOutput { step: source } = binding {
                    if !step.dependencies.contains(source) {
                        return Err(AppError::InvalidPlan(format!(
                            "step '{}' input '{}' reads from '{}' which is not a declared dependency",
                            step.id, name, source
                        )));
                    }
                }
            }
        }

        let mut dependents: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();
        for step in &plan.steps {
            in_degree.insert(step.id.clone(), step.dependencies.len());
            dependents.entry(step.id.clone()).or_default();
        }
        for step in &plan.steps {
            for dep in &step.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }

        // Kahn's algorithm: detects cycles and yields the topological order.
        let mut queue: VecDeque<StepId> = plan
            .steps
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .map(|s| s.id.clone())
            .collect();
        let mut remaining = in_degree.clone();
        let mut topo_order = Vec::with_capacity(plan.steps.len());

        while let Some(id) = queue.pop_front() {
            topo_order.push(id.clone());
            for dependent in &dependents[&id] {
                let count = remaining
                    .get_mut(dependent)
                    .expect("dependent registered in in-degree map");
                *count -= 1;
                if *count == 0 {
                    queue.push_back(dependent.clone());
                }
            }
        }

        if topo_order.len() != plan.steps.len() {
            return Err(AppError::InvalidPlan(
                "circular dependency detected".to_string(),
            ));
        }

        // Multiple sinks are legal: the result aggregator is the fan-in that
        // merges terminal branches into one evidence set.
        let sink_count = dependents.values().filter(|deps| deps.is_empty()).count();
        if sink_count > 1 {
            tracing::debug!(
                plan_id = %plan.id,
                sink_count = sink_count,
                "Plan has multiple terminal steps; aggregator will fan them in"
            );
        }

        Ok(Self {
            plan,
            steps,
            dependents,
            topo_order,
        })
    }

    /// The validated plan
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Look up a step definition by id
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    /// Steps that directly depend on the given step
    pub fn dependents(&self, id: &str) -> &[StepId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fresh in-degree map for one execution of this graph
    pub fn in_degrees(&self) -> HashMap<StepId, usize> {
        self.plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.dependencies.len()))
            .collect()
    }

    /// Step ids with no dependencies, in definition order
    pub fn roots(&self) -> Vec<StepId> {
        self.plan
            .steps
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .map(|s| s.id.clone())
            .collect()
    }

    /// Topological order computed at build time
    pub fn topo_order(&self) -> &[StepId] {
        &self.topo_order
    }

    /// Number of steps in the plan
    pub fn len(&self) -> usize {
        self.plan.steps.len()
    }

    /// True when the plan has no steps (never observed after `build`)
    pub fn is_empty(&self) -> bool {
        self.plan.steps.is_empty()
    }
}
