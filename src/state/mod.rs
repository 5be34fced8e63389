//! Application state management
//!
//! Wires the per-process collaborators (agent registry, fingerprint cache,
//! analytic store, schema provider, validator) and builds a plan runner over
//! them. The cache and registry are shared across concurrent plan runs;
//! per-run state (budget, snapshot) is created inside the runner.

use crate::agents::{AgentRegistry, HttpAgent};
use crate::cache::{FingerprintCache, InMemoryCacheStore};
use crate::config::Config;
use crate::executor::{CoverageRule, ExecutorOptions, PlanRunner};
use crate::grounding::{GroundingConfig, GroundingValidator};
use crate::schema::SchemaProvider;
use crate::store::{AnalyticStore, SqliteAnalyticStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Shared application state
pub struct AppState {
    /// Application configuration
    pub config: Config,
    /// Plan runner over the wired collaborators
    pub runner: PlanRunner,
}

impl AppState {
    /// Wire production collaborators from configuration
    ///
    /// Connects the SQLite analytic store (which also serves schema
    /// introspection) and points the agent registry at the HTTP agent
    /// service.
    pub async fn from_config(config: Config) -> Result<Self, StoreError> {
        let store = SqliteAnalyticStore::connect(&config.store.database_url).await?;
        let store = Arc::new(store);
        let agent = Arc::new(HttpAgent::new(
            reqwest::Client::new(),
            config.agent_service.base_url.clone(),
        ));
        let registry = Arc::new(AgentRegistry::with_shared_agent(agent));
        Ok(Self::assemble(config, registry, store.clone(), store))
    }

    /// Wire explicit collaborators (used by tests and embedders)
    pub fn assemble(
        config: Config,
        agents: Arc<AgentRegistry>,
        store: Arc<dyn AnalyticStore>,
        schema: Arc<dyn SchemaProvider>,
    ) -> Self {
        let cache = Arc::new(FingerprintCache::new(
            Arc::new(InMemoryCacheStore::new()),
            Duration::from_secs(config.cache.result_ttl_secs),
        ));
        let validator = Arc::new(GroundingValidator::new(GroundingConfig {
            max_rows: config.execution.max_query_rows,
            ..Default::default()
        }));
        let options = ExecutorOptions {
            max_concurrency: config.execution.max_concurrency,
            plan_timeout: Duration::from_secs(config.execution.plan_timeout_secs),
            max_cost_units: config.budget.max_cost_units,
            dispatch_cost: config.budget.dispatch_cost,
            max_query_rows: config.execution.max_query_rows,
            coverage: CoverageRule::default(),
        };
        let runner = PlanRunner::new(agents, cache, store, schema, validator, options);
        Self { config, runner }
    }
}
