use thiserror::Error;

/// Result alias used throughout the collector
pub type CollectorResult<T> = Result<T, CollectorError>;

/// Collector error taxonomy
///
/// Startup-time configuration errors are fatal; everything else is local to
/// a scrape cycle, a query, or a record and is counted rather than propagated.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Invalid configuration detected at startup (fatal, exit code 1)
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to reach or authenticate against a database endpoint
    #[error("connection error ({endpoint}): {message}")]
    Connection { endpoint: String, message: String },

    /// A single query failed within a scrape cycle
    #[error("query error ({query}): {message}")]
    Query { query: String, message: String },

    /// A result row did not conform to the expected column shape
    #[error("schema mismatch in {query}: {message}")]
    Schema { query: String, message: String },

    /// Feature detection could not establish an initial connection
    #[error("feature detection failed: {0}")]
    Detection(String),

    /// An exporter send failed after retries were exhausted
    #[error("export error ({exporter}): {message}")]
    Export { exporter: String, message: String },

    /// Operation refused because the circuit breaker for the source is open
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Pipeline is back-pressuring; the caller should pause and retry
    #[error("pipeline busy")]
    Busy,

    /// Channel or component has shut down
    #[error("shutdown in progress")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CollectorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn connection_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection { endpoint: endpoint.into(), message: message.into() }
    }

    pub fn query_failed(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query { query: query.into(), message: message.into() }
    }

    pub fn schema_mismatch(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema { query: query.into(), message: message.into() }
    }

    pub fn export_failed(exporter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Export { exporter: exporter.into(), message: message.into() }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error should count as a connection-class failure
    /// for circuit breaker purposes
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Detection(_))
    }

    /// Stable label for the `collector_errors_total{kind}` counter
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connection { .. } => "connection",
            Self::Query { .. } => "query",
            Self::Schema { .. } => "schema",
            Self::Detection(_) => "detection",
            Self::Export { .. } => "export",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Busy => "busy",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels_are_stable() {
        let e = CollectorError::connection_failed("db1:5432", "refused");
        assert_eq!(e.kind_label(), "connection");
        assert!(e.is_connection_error());

        let e = CollectorError::query_failed("pg.metrics.db_size", "timeout");
        assert_eq!(e.kind_label(), "query");
        assert!(!e.is_connection_error());
    }

    #[test]
    fn test_display_includes_context() {
        let e = CollectorError::schema_mismatch("mysql.logs.slow", "expected numeric first column");
        let s = e.to_string();
        assert!(s.contains("mysql.logs.slow"));
        assert!(s.contains("numeric"));
    }
}
