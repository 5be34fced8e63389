//! Schema snapshot model and introspection boundary
//!
//! A `SchemaSnapshot` is fetched once per plan execution and treated as
//! immutable for the duration of that run, so every grounding decision within
//! a run sees the same schema. The version token feeds cache keys: a new
//! version makes all entries computed under the old one unreachable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from the schema introspection boundary
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Introspection query failed
    #[error("schema introspection failed: {0}")]
    Introspection(String),
    /// The analytic store is unreachable
    #[error("schema source unavailable: {0}")]
    Unavailable(String),
}

/// A column of an analytic table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name
    pub name: String,
    /// Declared data type (store-specific spelling)
    pub data_type: String,
}

/// A table or read-only view of the analytic store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table/view name
    pub name: String,
    /// Columns in ordinal position
    pub columns: Vec<ColumnSchema>,
    /// True for views
    pub is_view: bool,
}

/// Immutable schema snapshot for one plan execution
///
/// Lookups are case-insensitive, matching how the analytic store resolves
/// identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    version: String,
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaSnapshot {
    /// Build a snapshot from introspected tables, deriving the version token
    ///
    /// The version token is a digest of the canonical schema content, so two
    /// identical schemas always carry the same token and any structural change
    /// produces a new one.
    pub fn new(tables: Vec<TableSchema>) -> Self {
        let mut map = BTreeMap::new();
        for table in tables {
            map.insert(table.name.to_lowercase(), table);
        }

        let canonical = json!(map
            .values()
            .map(|t| {
                json!({
                    "name": t.name.to_lowercase(),
                    "view": t.is_view,
                    "columns": t.columns
                        .iter()
                        .map(|c| json!([c.name.to_lowercase(), c.data_type.to_lowercase()]))
                        .collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>());

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        let digest = hasher.finalize();
        let version = format!("{:x}", digest)[..16].to_string();

        Self {
            version,
            tables: map,
        }
    }

    /// The version token identifying this schema's content
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Look up a table or view by name (case-insensitive)
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&name.to_lowercase())
    }

    /// True when `column` exists on `table` (both case-insensitive)
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .map(|t| {
                t.columns
                    .iter()
                    .any(|c| c.name.eq_ignore_ascii_case(column))
            })
            .unwrap_or(false)
    }

    /// All table/view names, sorted
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.values().map(|t| t.name.as_str()).collect()
    }

    /// Number of tables and views in the snapshot
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// True when the snapshot holds no tables
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Schema introspection boundary
///
/// The executor fetches one snapshot per plan execution, never per step, so
/// validation stays consistent within a run.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Return the current schema snapshot
    async fn snapshot(&self) -> Result<SchemaSnapshot, SchemaError>;
}
