// Database Adapter Module
// Purpose: Provide a unified SQL interface for the supported engines
// (PostgreSQL, MySQL). Adapters own their connections; nothing outside this
// module touches raw database handles.

mod mysql;
mod postgres;

pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;

use crate::config::DatabaseConfig;
use crate::models::{ColumnValue, DatabaseKind, Source};
use crate::utils::{CollectorError, CollectorResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Typed result of one query: column names plus rows of decoded cells
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ColumnValue>>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index and value of the first numeric column in a row.
    /// Booleans count as numeric (0/1).
    pub fn first_numeric(row: &[ColumnValue]) -> Option<(usize, f64)> {
        row.iter().enumerate().find_map(|(i, c)| c.as_numeric().map(|v| (i, v)))
    }
}

/// Database adapter trait - unified interface for PostgreSQL and MySQL
///
/// The collector performs authenticated SELECTs only; adapters never issue
/// DDL or DML.
#[async_trait]
pub trait DbAdapter: Send + Sync {
    /// Get database kind
    fn kind(&self) -> DatabaseKind;

    /// Get the source this adapter is attached to
    fn source(&self) -> &Source;

    /// Run one query with a bounded timeout and decode rows into ColumnValues
    async fn query(&self, sql: &str, timeout: Duration) -> CollectorResult<QueryResult>;

    /// Lightweight liveness probe
    async fn ping(&self) -> CollectorResult<()>;

    /// Close pooled connections; idempotent
    async fn close(&self);
}

/// Create adapter based on configured kind (factory method)
pub async fn create_adapter(config: &DatabaseConfig) -> CollectorResult<Arc<dyn DbAdapter>> {
    match config.kind.as_str() {
        "postgres" => Ok(Arc::new(PostgresAdapter::connect(config).await?)),
        "mysql" => Ok(Arc::new(MySqlAdapter::new(config)?)),
        other => Err(CollectorError::config(format!("unsupported database kind '{}'", other))),
    }
}
