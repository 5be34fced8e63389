//! SQLite adapter for the analytic store and schema boundaries
//!
//! Backs both `AnalyticStore` (validated query execution) and
//! `SchemaProvider` (introspection of tables, views, and columns from
//! `sqlite_master`). The same pool serves both so one run sees one database.

use crate::grounding::ValidatedQuery;
use crate::schema::{ColumnSchema, SchemaError, SchemaProvider, SchemaSnapshot, TableSchema};
use crate::store::{AnalyticStore, QueryOutput, StoreError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo};

/// SQLite-backed analytic store
#[derive(Clone)]
pub struct SqliteAnalyticStore {
    pool: SqlitePool,
}

impl SqliteAnalyticStore {
    /// Wrap an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `url`
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        // An in-memory database exists per connection; pooling more than one
        // would hand each acquire a different empty database.
        let is_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqlitePoolOptions::new();
        options = if is_memory {
            options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options.max_connections(5)
        };
        let pool = options
            .connect(url)
            .await
            .map_err(|e| StoreError::Connection(format!("failed to connect to '{url}': {e}")))?;
        Ok(Self { pool })
    }

    /// The underlying pool (used by fixtures and migrations)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn classify(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut => StoreError::Timeout(e.to_string()),
        sqlx::Error::PoolClosed | sqlx::Error::Io(_) => StoreError::Connection(e.to_string()),
        other => StoreError::Execution(other.to_string()),
    }
}

/// Decode a row into a JSON object keyed by column name
///
/// SQLite's dynamic typing means the declared column type is advisory; decode
/// by the value's runtime type and fall back to text.
fn row_to_json(row: &SqliteRow) -> Value {
    let mut object = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => row
                .try_get::<Option<i64>, _>(i)
                .ok()
                .flatten()
                .map(Value::from)
                .unwrap_or(Value::Null),
            "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => row
                .try_get::<Option<f64>, _>(i)
                .ok()
                .flatten()
                .map(Value::from)
                .unwrap_or(Value::Null),
            "TEXT" | "VARCHAR" | "DATETIME" | "DATE" => row
                .try_get::<Option<String>, _>(i)
                .ok()
                .flatten()
                .map(Value::from)
                .unwrap_or(Value::Null),
            "NULL" => Value::Null,
            // Expression columns may carry no declared type; probe decodes.
            _ => {
                if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(i) {
                    Value::from(v)
                } else if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(i) {
                    Value::from(v)
                } else if let Ok(Some(v)) = row.try_get::<Option<String>, _>(i) {
                    Value::from(v)
                } else {
                    Value::Null
                }
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

#[async_trait]
impl AnalyticStore for SqliteAnalyticStore {
    async fn execute(
        &self,
        query: &ValidatedQuery,
        row_limit: u64,
    ) -> Result<QueryOutput, StoreError> {
        tracing::debug!(
            sql = %query.sql(),
            row_limit = row_limit,
            "Executing validated query"
        );

        let rows = sqlx::query(query.sql())
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows: Vec<Value> = rows
            .iter()
            .take(row_limit as usize)
            .map(row_to_json)
            .collect();

        let row_count = rows.len();
        tracing::debug!(row_count = row_count, "Query returned rows");

        Ok(QueryOutput {
            columns,
            rows,
            row_count,
        })
    }
}

#[async_trait]
impl SchemaProvider for SqliteAnalyticStore {
    async fn snapshot(&self) -> Result<SchemaSnapshot, SchemaError> {
        let relations: Vec<(String, String)> = sqlx::query_as(
            "SELECT name, type FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SchemaError::Introspection(e.to_string()))?;

        let mut tables = Vec::with_capacity(relations.len());
        for (name, relation_type) in relations {
            // PRAGMA does not accept bind parameters; the name comes from
            // sqlite_master, not from user input.
            let pragma = format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\""));
            let columns: Vec<SqliteRow> = sqlx::query(&pragma)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| SchemaError::Introspection(e.to_string()))?;

            let columns = columns
                .iter()
                .map(|row| {
                    Ok(ColumnSchema {
                        name: row
                            .try_get::<String, _>("name")
                            .map_err(|e| SchemaError::Introspection(e.to_string()))?,
                        data_type: row
                            .try_get::<String, _>("type")
                            .map_err(|e| SchemaError::Introspection(e.to_string()))?,
                    })
                })
                .collect::<Result<Vec<_>, SchemaError>>()?;

            tables.push(TableSchema {
                name,
                columns,
                is_view: relation_type == "view",
            });
        }

        let snapshot = SchemaSnapshot::new(tables);
        tracing::debug!(
            schema_version = %snapshot.version(),
            table_count = snapshot.len(),
            "Fetched schema snapshot"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grounding::{GroundingValidator, Verdict};

    async fn seeded_store() -> SqliteAnalyticStore {
        let store = SqliteAnalyticStore::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::query(
            "CREATE TABLE orders (
                order_id INTEGER PRIMARY KEY,
                order_total REAL,
                order_date TEXT,
                status TEXT,
                region TEXT
            )",
        )
        .execute(store.pool())
        .await
        .unwrap();
        for (total, status, region) in [
            (120.0, "completed", "emea"),
            (80.5, "completed", "amer"),
            (42.0, "cancelled", "emea"),
        ] {
            sqlx::query("INSERT INTO orders (order_total, status, region) VALUES (?, ?, ?)")
                .bind(total)
                .bind(status)
                .bind(region)
                .execute(store.pool())
                .await
                .unwrap();
        }
        store
    }

    async fn validated(store: &SqliteAnalyticStore, sql: &str) -> ValidatedQuery {
        let snapshot = store.snapshot().await.unwrap();
        match GroundingValidator::default().validate(sql, &snapshot) {
            Verdict::Approved(query) => query,
            Verdict::Rejected(rejection) => panic!("fixture query rejected: {rejection}"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_introspects_tables_and_columns() {
        let store = seeded_store().await;
        let snapshot = store.snapshot().await.unwrap();

        assert_eq!(snapshot.table_names(), vec!["orders"]);
        assert!(snapshot.has_column("orders", "order_total"));
        assert!(snapshot.has_column("orders", "region"));
        assert!(!snapshot.has_column("orders", "missing"));
        assert!(!snapshot.version().is_empty());
    }

    #[tokio::test]
    async fn test_execute_returns_typed_rows() {
        let store = seeded_store().await;
        let query = validated(
            &store,
            "SELECT region, SUM(order_total) AS revenue FROM orders \
             WHERE status = 'completed' GROUP BY region ORDER BY revenue DESC",
        )
        .await;

        let output = store.execute(&query, 1000).await.unwrap();
        assert_eq!(output.columns, vec!["region", "revenue"]);
        assert_eq!(output.row_count, 2);
        assert_eq!(output.rows[0]["region"], "emea");
        assert_eq!(output.rows[0]["revenue"], 120.0);
    }

    #[tokio::test]
    async fn test_row_limit_is_a_hard_cap() {
        let store = seeded_store().await;
        let query = validated(&store, "SELECT order_id FROM orders ORDER BY order_id").await;

        let output = store.execute(&query, 2).await.unwrap();
        assert_eq!(output.row_count, 2);
        assert_eq!(output.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_schema_version_changes_with_schema() {
        let store = seeded_store().await;
        let before = store.snapshot().await.unwrap();

        sqlx::query("ALTER TABLE orders ADD COLUMN discount REAL")
            .execute(store.pool())
            .await
            .unwrap();

        let after = store.snapshot().await.unwrap();
        assert_ne!(before.version(), after.version());
        assert!(after.has_column("orders", "discount"));
    }
}
