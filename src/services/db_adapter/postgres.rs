//! PostgreSQL adapter over tokio-postgres
//!
//! tokio-postgres has no built-in pool, so the adapter keeps a small one:
//! bounded by `max_open` via a semaphore, idle clients kept up to `max_idle`,
//! clients retired after `max_lifetime`.

use super::{DbAdapter, QueryResult};
use crate::config::DatabaseConfig;
use crate::models::{ColumnValue, DatabaseKind, Source};
use crate::utils::{CollectorError, CollectorResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, Row};

struct PooledClient {
    client: Client,
    created: Instant,
}

pub struct PostgresAdapter {
    pg_config: tokio_postgres::Config,
    source: Source,
    idle: Mutex<Vec<PooledClient>>,
    permits: Arc<Semaphore>,
    max_idle: usize,
    max_lifetime: Duration,
}

impl PostgresAdapter {
    /// Connect once up front so startup surfaces credential and address
    /// problems immediately.
    pub async fn connect(config: &DatabaseConfig) -> CollectorResult<Self> {
        if config.tls {
            // Plaintext negotiation still applies; see DESIGN.md on TLS connectors
            tracing::warn!(
                "database '{}': TLS requested but this build negotiates plaintext for PostgreSQL",
                config.display_name()
            );
        }

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .user(&config.username)
            .password(&config.password)
            .dbname(&config.database)
            .application_name("dbpulse")
            .connect_timeout(Duration::from_secs(10));

        let source = Source::new(DatabaseKind::Postgres, config.endpoint(), config.database.clone());

        let adapter = Self {
            pg_config,
            source,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(config.pool.max_open.max(1))),
            max_idle: config.pool.max_idle,
            max_lifetime: Duration::from_secs(config.pool.max_lifetime_secs),
        };

        let first = adapter.open_client().await?;
        adapter.idle.lock().await.push(first);

        tracing::info!("Created PostgreSQL connection pool for {}", adapter.source);

        Ok(adapter)
    }

    async fn open_client(&self) -> CollectorResult<PooledClient> {
        let (client, connection) = self
            .pg_config
            .connect(NoTls)
            .await
            .map_err(|e| CollectorError::connection_failed(&self.source.endpoint, e.to_string()))?;

        let source = self.source.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("PostgreSQL connection for {} terminated: {}", source, e);
            }
        });

        Ok(PooledClient { client, created: Instant::now() })
    }

    async fn checkout(&self) -> CollectorResult<PooledClient> {
        let mut idle = self.idle.lock().await;
        while let Some(pooled) = idle.pop() {
            if pooled.created.elapsed() < self.max_lifetime && !pooled.client.is_closed() {
                return Ok(pooled);
            }
            // Expired or broken; fall through and open a fresh client
        }
        drop(idle);
        self.open_client().await
    }

    async fn checkin(&self, pooled: PooledClient) {
        if pooled.client.is_closed() || pooled.created.elapsed() >= self.max_lifetime {
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push(pooled);
        }
    }
}

#[async_trait]
impl DbAdapter for PostgresAdapter {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    fn source(&self) -> &Source {
        &self.source
    }

    async fn query(&self, sql: &str, timeout: Duration) -> CollectorResult<QueryResult> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CollectorError::Shutdown)?;

        let pooled = self.checkout().await?;

        let rows = match tokio::time::timeout(timeout, pooled.client.query(sql, &[])).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                // Connection-level errors poison the client; do not check it back in
                if e.is_closed() {
                    return Err(CollectorError::connection_failed(&self.source.endpoint, e.to_string()));
                }
                self.checkin(pooled).await;
                return Err(CollectorError::query_failed(sql, e.to_string()));
            },
            Err(_) => return Err(CollectorError::query_failed(sql, "query timed out")),
        };

        self.checkin(pooled).await;

        Ok(process_rows(&rows))
    }

    async fn ping(&self) -> CollectorResult<()> {
        self.query("SELECT 1", Duration::from_secs(5)).await.map(|_| ())
    }

    async fn close(&self) {
        self.idle.lock().await.clear();
    }
}

fn process_rows(rows: &[Row]) -> QueryResult {
    let Some(first) = rows.first() else {
        return QueryResult::default();
    };

    let columns: Vec<String> = first.columns().iter().map(|c| c.name().to_string()).collect();

    let decoded = rows
        .iter()
        .map(|row| (0..columns.len()).map(|i| decode_cell(row, i)).collect())
        .collect();

    QueryResult { columns, rows: decoded }
}

fn decode_cell(row: &Row, idx: usize) -> ColumnValue {
    let ty = row.columns()[idx].type_().clone();

    if ty == Type::BOOL {
        return opt(row.try_get::<_, Option<bool>>(idx), ColumnValue::Bool);
    }
    if ty == Type::INT2 {
        return opt(row.try_get::<_, Option<i16>>(idx), |v| ColumnValue::Int(v as i64));
    }
    if ty == Type::INT4 {
        return opt(row.try_get::<_, Option<i32>>(idx), |v| ColumnValue::Int(v as i64));
    }
    if ty == Type::INT8 {
        return opt(row.try_get::<_, Option<i64>>(idx), ColumnValue::Int);
    }
    if ty == Type::OID {
        return opt(row.try_get::<_, Option<u32>>(idx), |v| ColumnValue::Int(v as i64));
    }
    if ty == Type::FLOAT4 {
        return opt(row.try_get::<_, Option<f32>>(idx), |v| ColumnValue::Float(v as f64));
    }
    if ty == Type::FLOAT8 {
        return opt(row.try_get::<_, Option<f64>>(idx), ColumnValue::Float);
    }
    if ty == Type::TIMESTAMPTZ {
        return opt(row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx), ColumnValue::Timestamp);
    }
    if ty == Type::TIMESTAMP {
        return opt(row.try_get::<_, Option<chrono::NaiveDateTime>>(idx), |v| {
            ColumnValue::Timestamp(v.and_utc())
        });
    }
    if ty == Type::TEXT || ty == Type::VARCHAR || ty == Type::NAME || ty == Type::BPCHAR {
        return opt(row.try_get::<_, Option<String>>(idx), ColumnValue::Text);
    }

    // Catalog queries cast NUMERIC and friends to float8/text, so anything
    // else is decoded as text on a best-effort basis.
    match row.try_get::<_, Option<String>>(idx) {
        Ok(Some(s)) => ColumnValue::Text(s),
        Ok(None) => ColumnValue::Null,
        Err(_) => ColumnValue::Null,
    }
}

fn opt<T>(res: Result<Option<T>, tokio_postgres::Error>, f: impl FnOnce(T) -> ColumnValue) -> ColumnValue {
    match res {
        Ok(Some(v)) => f(v),
        _ => ColumnValue::Null,
    }
}
