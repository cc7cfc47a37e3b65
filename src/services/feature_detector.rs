//! Feature Detector
//!
//! Probes a database endpoint for its server version, installed extensions,
//! usable system views, and cloud-provider fingerprint, and caches the
//! result as an immutable `FeatureSet`. Each probe is independent: one
//! failing probe records a detection error and marks its feature
//! unavailable, it never aborts the battery and never guesses `true`.

use crate::config::FeatureDetectionConfig;
use crate::models::{
    AttrValue, DatabaseKind, DetectionError, ExtensionInfo, FeatureSet, Record, Source,
};
use crate::services::db_adapter::{DbAdapter, QueryResult};
use crate::utils::{CollectorError, CollectorResult};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Extensions probed on PostgreSQL endpoints
const PG_EXTENSIONS: [&str; 3] = ["pg_stat_statements", "pg_wait_sampling", "pg_stat_monitor"];

pub struct FeatureDetector {
    adapter: Arc<dyn DbAdapter>,
    config: FeatureDetectionConfig,
    /// Swapped wholesale on refresh; readers clone the Arc and keep a
    /// consistent snapshot for the duration of a call
    current: RwLock<Arc<FeatureSet>>,
    last_detection: Mutex<Option<Instant>>,
    healthy: AtomicBool,
}

impl FeatureDetector {
    pub fn new(adapter: Arc<dyn DbAdapter>, config: FeatureDetectionConfig) -> Self {
        let empty = Arc::new(FeatureSet::empty(adapter.kind()));
        Self {
            adapter,
            config,
            current: RwLock::new(empty),
            last_detection: Mutex::new(None),
            healthy: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &Source {
        self.adapter.source()
    }

    /// Current cached feature set (atomic snapshot)
    pub fn current(&self) -> Arc<FeatureSet> {
        self.current.read().expect("feature set lock poisoned").clone()
    }

    /// Whether the last detection round reached the database at all
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Run the probe battery and atomically replace the cached set.
    ///
    /// Fails only when the initial connection probe fails; individual probe
    /// errors are recorded in `detection_errors` on the returned set.
    pub async fn detect(&self) -> CollectorResult<Arc<FeatureSet>> {
        // The connection probe gates the whole battery
        if let Err(e) = self.adapter.ping().await {
            self.healthy.store(false, Ordering::Relaxed);
            return Err(CollectorError::Detection(e.to_string()));
        }

        let mut features = FeatureSet::empty(self.adapter.kind());
        features.detected_at = Utc::now();

        match self.adapter.kind() {
            DatabaseKind::Postgres => self.detect_postgres(&mut features).await,
            DatabaseKind::MySql => self.detect_mysql(&mut features).await,
        }

        if !self.config.skip_cloud_detection {
            self.detect_cloud(&mut features).await;
        }

        let errors = features.detection_errors.len();
        let set = Arc::new(features);
        *self.current.write().expect("feature set lock poisoned") = set.clone();
        *self.last_detection.lock().expect("last detection lock poisoned") = Some(Instant::now());
        self.healthy.store(true, Ordering::Relaxed);

        tracing::info!(
            "Feature detection for {} completed: {} extensions, {} capabilities, {} probe error(s)",
            self.adapter.source(),
            set.extensions.len(),
            set.capabilities.len(),
            errors
        );

        Ok(set)
    }

    /// Refresh when the cache has outlived `cache_duration`; returns whether
    /// a refresh ran
    pub async fn refresh_if_stale(&self) -> CollectorResult<bool> {
        let stale = {
            let last = self.last_detection.lock().expect("last detection lock poisoned");
            match *last {
                Some(at) => at.elapsed() >= Duration::from_secs(self.config.cache_duration_secs),
                None => true,
            }
        };
        if stale {
            self.detect().await?;
        }
        Ok(stale)
    }

    /// Availability gauges for the current set, one data point per
    /// extension / capability
    pub fn feature_records(&self) -> Vec<Record> {
        let set = self.current();
        let source = self.adapter.source().clone();
        let mut records = Vec::with_capacity(set.extensions.len() + set.capabilities.len());

        for (name, info) in &set.extensions {
            let mut rec = Record::gauge(
                source.clone(),
                "db.feature.extension.available",
                if info.available { 1.0 } else { 0.0 },
            );
            rec.set_attribute("extension", name.as_str());
            if let Some(version) = &info.version {
                rec.set_attribute("version", version.as_str());
            }
            records.push(rec);
        }

        for (name, available) in &set.capabilities {
            let mut rec = Record::gauge(
                source.clone(),
                "db.feature.capability.available",
                if *available { 1.0 } else { 0.0 },
            );
            rec.set_attribute("capability", name.as_str());
            records.push(rec);
        }

        records
    }

    async fn detect_postgres(&self, features: &mut FeatureSet) {
        if let Some(result) = self.probe(features, "server_version", "SELECT version()").await {
            features.server_version = first_cell_text(&result);
        }

        // Installed extensions in one pass; individual names checked against it
        let installed = self
            .probe(features, "pg_extension", "SELECT extname, extversion FROM pg_extension")
            .await;
        for name in PG_EXTENSIONS {
            let info = installed
                .as_ref()
                .and_then(|r| {
                    r.rows.iter().find(|row| {
                        matches!(row.first(), Some(crate::models::ColumnValue::Text(n)) if n == name)
                    })
                })
                .map(|row| ExtensionInfo {
                    available: true,
                    version: row.get(1).and_then(|v| v.to_attr()).and_then(|a| match a {
                        AttrValue::Str(s) => Some(s),
                        _ => None,
                    }),
                });
            features
                .extensions
                .insert(name.to_string(), info.unwrap_or(ExtensionInfo { available: false, version: None }));
        }

        // auto_explain is a preload library, not a CREATE EXTENSION artifact
        let auto_explain = self
            .probe(features, "auto_explain", "SHOW shared_preload_libraries")
            .await
            .map(|r| first_cell_text(&r).contains("auto_explain"))
            .unwrap_or(false);
        features
            .extensions
            .insert("auto_explain".to_string(), ExtensionInfo { available: auto_explain, version: None });

        for (capability, sql) in [
            ("pg_stat_database", "SELECT 1 FROM pg_stat_database LIMIT 1"),
            ("pg_stat_bgwriter", "SELECT 1 FROM pg_stat_bgwriter LIMIT 1"),
            // query_id exists on PG >= 14 with compute_query_id enabled
            ("activity_query_id", "SELECT query_id FROM pg_stat_activity LIMIT 1"),
            ("blocking_pids", "SELECT pg_blocking_pids(pg_backend_pid())"),
        ] {
            let available = self.probe(features, capability, sql).await.is_some();
            features.capabilities.insert(capability.to_string(), available);
        }
    }

    async fn detect_mysql(&self, features: &mut FeatureSet) {
        if let Some(result) = self.probe(features, "server_version", "SELECT VERSION()").await {
            features.server_version = first_cell_text(&result);
        }

        let ps_enabled = self
            .probe(features, "performance_schema", "SELECT @@performance_schema")
            .await
            .and_then(|r| r.rows.first().and_then(|row| QueryResult::first_numeric(row)))
            .map(|(_, v)| v > 0.0)
            .unwrap_or(false);
        features.capabilities.insert("performance_schema".to_string(), ps_enabled);

        for (capability, sql) in [
            (
                "events_statements_summary_by_digest",
                "SELECT 1 FROM performance_schema.events_statements_summary_by_digest LIMIT 1",
            ),
            ("events_waits_current", "SELECT 1 FROM performance_schema.events_waits_current LIMIT 1"),
        ] {
            // Tables exist but stay empty unless the instrument is enabled,
            // so gate on the performance_schema switch as well
            let available = ps_enabled && self.probe(features, capability, sql).await.is_some();
            features.capabilities.insert(capability.to_string(), available);
        }
    }

    async fn detect_cloud(&self, features: &mut FeatureSet) {
        let probes: &[(&str, &str)] = match self.adapter.kind() {
            DatabaseKind::Postgres => &[
                ("aws-rds", "SELECT 1 FROM pg_settings WHERE name LIKE 'rds.%' LIMIT 1"),
                ("gcp-cloudsql", "SELECT 1 FROM pg_settings WHERE name LIKE 'cloudsql.%' LIMIT 1"),
                ("azure-database", "SELECT 1 FROM pg_settings WHERE name LIKE 'azure.%' LIMIT 1"),
            ],
            DatabaseKind::MySql => &[
                ("aws-aurora", "SELECT @@aurora_version"),
                ("aws-rds", "SELECT 1 FROM performance_schema.global_variables WHERE variable_name LIKE 'rds\\_%' LIMIT 1"),
            ],
        };

        // Cloud misses are expected on self-hosted databases; they are not
        // detection errors
        for (provider, sql) in probes {
            let hit = self
                .run_probe(sql)
                .await
                .map(|r| !r.rows.is_empty())
                .unwrap_or(false);
            if hit {
                features.cloud_provider = provider.to_string();
                return;
            }
        }
    }

    /// Run one probe with timeout and fixed-delay retries. `None` marks the
    /// probe failed and appends a detection error.
    async fn probe(&self, features: &mut FeatureSet, name: &str, sql: &str) -> Option<QueryResult> {
        match self.run_probe(sql).await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::debug!("Probe '{}' failed for {}: {}", name, self.adapter.source(), e);
                features
                    .detection_errors
                    .push(DetectionError { probe: name.to_string(), message: e.to_string() });
                None
            },
        }
    }

    async fn run_probe(&self, sql: &str) -> CollectorResult<QueryResult> {
        let timeout = Duration::from_millis(self.config.timeout_per_check_ms);
        let mut last_err = CollectorError::internal_error("probe never ran");

        for attempt in 0..=self.config.retry_attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
            match self.adapter.query(sql, timeout).await {
                Ok(result) => return Ok(result),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

fn first_cell_text(result: &QueryResult) -> String {
    result
        .rows
        .first()
        .and_then(|row| row.first())
        .map(|c| c.render())
        .unwrap_or_default()
}
