//! Application configuration
//!
//! Centralized configuration management with environment variable support
//! and sensible defaults.

use std::env;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Plan execution configuration
    pub execution: ExecutionConfig,
    /// Per-plan-run budget defaults
    pub budget: BudgetConfig,
    /// Result cache configuration
    pub cache: CacheConfig,
    /// External agent service configuration
    pub agent_service: AgentServiceConfig,
    /// Analytic store configuration
    pub store: StoreConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind the server to
    pub port: u16,
    /// Host address to bind to
    pub host: String,
}

/// Plan execution configuration
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Maximum number of steps running concurrently per plan
    pub max_concurrency: usize,
    /// Default timeout for a single step invocation (in seconds)
    pub default_step_timeout_secs: u64,
    /// Timeout for an entire plan execution (in seconds)
    pub plan_timeout_secs: u64,
    /// Row-limit ceiling injected into validated queries
    pub max_query_rows: u64,
}

/// Per-plan-run budget defaults
///
/// A plan run stops dispatching new steps once either its cost allowance or
/// its time allowance is spent. In-flight steps drain to their own timeouts.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Cost units available to one plan run
    pub max_cost_units: i64,
    /// Cost units charged up front per dispatched step
    pub dispatch_cost: i64,
}

/// Result cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live for cached step results (in seconds)
    pub result_ttl_secs: u64,
}

/// External agent service configuration
#[derive(Debug, Clone)]
pub struct AgentServiceConfig {
    /// Base URL of the reasoning agent service
    pub base_url: String,
}

/// Analytic store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database connection URL for the analytic store
    pub database_url: String,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                port: env::var("PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8080),
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            },
            execution: ExecutionConfig {
                max_concurrency: env::var("MAX_CONCURRENCY")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|v| *v > 0)
                    .unwrap_or(4),
                default_step_timeout_secs: env::var("STEP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
                plan_timeout_secs: env::var("PLAN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
                max_query_rows: env::var("MAX_QUERY_ROWS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1000),
            },
            budget: BudgetConfig {
                max_cost_units: env::var("MAX_COST_UNITS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(100),
                dispatch_cost: 1,
            },
            cache: CacheConfig {
                result_ttl_secs: env::var("RESULT_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(600),
            },
            agent_service: AgentServiceConfig {
                base_url: env::var("AGENT_SERVICE_URL")
                    .unwrap_or_else(|_| "http://localhost:8090".to_string()),
            },
            store: StoreConfig {
                database_url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite::memory:".to_string()),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
