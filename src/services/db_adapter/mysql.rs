//! MySQL adapter over mysql_async
//!
//! mysql_async ships its own pool; this adapter configures it from the
//! endpoint's pool tunables and decodes wire values into `ColumnValue`.

use super::{DbAdapter, QueryResult};
use crate::config::DatabaseConfig;
use crate::models::{ColumnValue, DatabaseKind, Source};
use crate::utils::{CollectorError, CollectorResult};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mysql_async::{Opts, OptsBuilder, Pool, SslOpts, prelude::Queryable};
use std::time::Duration;

pub struct MySqlAdapter {
    pool: Pool,
    source: Source,
}

impl MySqlAdapter {
    pub fn new(config: &DatabaseConfig) -> CollectorResult<Self> {
        let constraints = mysql_async::PoolConstraints::new(
            config.pool.max_idle.max(1),
            config.pool.max_open.max(1),
        )
        .ok_or_else(|| {
            CollectorError::config(format!(
                "database '{}': invalid pool constraints (idle {} / open {})",
                config.display_name(),
                config.pool.max_idle,
                config.pool.max_open
            ))
        })?;

        let ssl_opts = if config.tls { Some(SslOpts::default()) } else { None };

        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(&config.host)
            .tcp_port(config.port)
            .user(Some(&config.username))
            .pass(Some(&config.password))
            .db_name(Some(&config.database))
            .prefer_socket(false)
            .ssl_opts(ssl_opts)
            .tcp_keepalive(Some(30_000_u32))
            .tcp_nodelay(true)
            .pool_opts(
                mysql_async::PoolOpts::default()
                    .with_constraints(constraints)
                    .with_inactive_connection_ttl(Duration::from_secs(config.pool.max_lifetime_secs))
                    .with_ttl_check_interval(Duration::from_secs(60)),
            )
            .into();

        let source = Source::new(DatabaseKind::MySql, config.endpoint(), config.database.clone());

        tracing::info!("Created MySQL connection pool for {}", source);

        Ok(Self { pool: Pool::new(opts), source })
    }
}

#[async_trait]
impl DbAdapter for MySqlAdapter {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::MySql
    }

    fn source(&self) -> &Source {
        &self.source
    }

    async fn query(&self, sql: &str, timeout: Duration) -> CollectorResult<QueryResult> {
        let mut conn = tokio::time::timeout(timeout, self.pool.get_conn())
            .await
            .map_err(|_| CollectorError::connection_failed(&self.source.endpoint, "pool acquire timed out"))?
            .map_err(|e| CollectorError::connection_failed(&self.source.endpoint, e.to_string()))?;

        // exec() uses the binary protocol, so numeric cells arrive typed
        // instead of as text
        let rows: Vec<mysql_async::Row> = tokio::time::timeout(timeout, conn.exec(sql, ()))
            .await
            .map_err(|_| CollectorError::query_failed(sql, "query timed out"))?
            .map_err(|e| CollectorError::query_failed(sql, e.to_string()))?;

        drop(conn);

        Ok(process_rows(rows))
    }

    async fn ping(&self) -> CollectorResult<()> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| CollectorError::connection_failed(&self.source.endpoint, e.to_string()))?;
        conn.query_drop("SELECT 1")
            .await
            .map_err(|e| CollectorError::connection_failed(&self.source.endpoint, e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pool.clone().disconnect().await {
            tracing::warn!("Error disconnecting MySQL pool for {}: {}", self.source, e);
        }
    }
}

fn process_rows(rows: Vec<mysql_async::Row>) -> QueryResult {
    if rows.is_empty() {
        return QueryResult::default();
    }

    let columns: Vec<String> =
        rows[0].columns_ref().iter().map(|c| c.name_str().to_string()).collect();
    let decimal: Vec<bool> = rows[0]
        .columns_ref()
        .iter()
        .map(|c| {
            matches!(
                c.column_type(),
                mysql_async::consts::ColumnType::MYSQL_TYPE_DECIMAL
                    | mysql_async::consts::ColumnType::MYSQL_TYPE_NEWDECIMAL
            )
        })
        .collect();

    let decoded = rows
        .iter()
        .map(|row| (0..columns.len()).map(|i| decode_value(&row[i], decimal[i])).collect())
        .collect();

    QueryResult { columns, rows: decoded }
}

fn decode_value(value: &mysql_async::Value, is_decimal: bool) -> ColumnValue {
    match value {
        mysql_async::Value::NULL => ColumnValue::Null,
        // DECIMAL travels as text on the wire even in the binary protocol
        mysql_async::Value::Bytes(bytes) if is_decimal => {
            match std::str::from_utf8(bytes).ok().and_then(|s| s.parse::<f64>().ok()) {
                Some(v) => ColumnValue::Float(v),
                None => ColumnValue::Null,
            }
        },
        mysql_async::Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => ColumnValue::Text(s.to_string()),
            Err(_) => ColumnValue::Text(String::from_utf8_lossy(bytes).to_string()),
        },
        mysql_async::Value::Int(i) => ColumnValue::Int(*i),
        mysql_async::Value::UInt(u) => {
            if *u <= i64::MAX as u64 {
                ColumnValue::Int(*u as i64)
            } else {
                ColumnValue::Float(*u as f64)
            }
        },
        mysql_async::Value::Float(f) => ColumnValue::Float(*f as f64),
        mysql_async::Value::Double(d) => ColumnValue::Float(*d),
        mysql_async::Value::Date(year, month, day, hour, minute, second, micro) => {
            match Utc
                .with_ymd_and_hms(*year as i32, *month as u32, *day as u32, *hour as u32, *minute as u32, *second as u32)
                .single()
            {
                Some(ts) => ColumnValue::Timestamp(ts + chrono::Duration::microseconds(*micro as i64)),
                None => ColumnValue::Null,
            }
        },
        mysql_async::Value::Time(neg, days, hours, minutes, seconds, micro) => {
            // Durations surface as fractional seconds
            let total = (*days as f64) * 86_400.0
                + (*hours as f64) * 3600.0
                + (*minutes as f64) * 60.0
                + (*seconds as f64)
                + (*micro as f64) / 1_000_000.0;
            ColumnValue::Float(if *neg { -total } else { total })
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scalar_values() {
        assert_eq!(decode_value(&mysql_async::Value::Int(-3), false), ColumnValue::Int(-3));
        assert_eq!(decode_value(&mysql_async::Value::UInt(7), false), ColumnValue::Int(7));
        assert_eq!(decode_value(&mysql_async::Value::Double(2.5), false), ColumnValue::Float(2.5));
        assert_eq!(decode_value(&mysql_async::Value::NULL, false), ColumnValue::Null);
        assert_eq!(
            decode_value(&mysql_async::Value::Bytes(b"active".to_vec()), false),
            ColumnValue::Text("active".into())
        );
        assert_eq!(
            decode_value(&mysql_async::Value::Bytes(b"12.50".to_vec()), true),
            ColumnValue::Float(12.5)
        );
    }

    #[test]
    fn test_decode_negative_time_as_seconds() {
        let v = mysql_async::Value::Time(true, 0, 1, 0, 30, 0);
        assert_eq!(decode_value(&v, false), ColumnValue::Float(-3630.0));
    }
}
