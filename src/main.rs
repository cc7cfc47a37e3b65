use axum::{Router, routing::get, routing::post};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbpulse::config::Config;
use dbpulse::services::background::{FeatureRefreshTask, PlanCleanupTask, spawn_feedback_drainer};
use dbpulse::services::exporters::{
    DebugExporter, Exporter, FileExporter, OtlpExporter, RetryPolicy, SpoolQueue,
    spawn_exporter_worker,
};
use dbpulse::services::pipeline::{
    AdaptiveSampler, BreakerStage, CostController, MemoryCheckTask, MemoryLimiter, MemoryState,
    Pipeline, PlanExtractor, Processor, QueryCorrelator, SourceBreaker, VerificationProcessor,
    spawn_pipeline_runtime,
};
use dbpulse::services::{
    AdapterManager, AshEmitTask, AshSampleTask, AshSampler, FeatureDetector, Health,
    HealthRegistry, InternalMetrics, QuerySelector, SqlScraper, start_scraper,
};
use dbpulse::utils::ScheduledExecutor;
use dbpulse::{CollectorState, handlers};

/// How long the memory limiter may sit at critical before the process gives
/// up with exit code 2
const MEMORY_RECOVERY_DEADLINE: Duration = Duration::from_secs(120);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    // Pick up a .env if one sits next to the binary (development)
    let _ = dotenvy::dotenv();

    // Configuration errors are fatal before any database connection opens
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        },
    };

    init_tracing(&config.logging);
    tracing::info!("dbpulse starting with {} database(s)", config.databases.len());

    // ------------------------------------------------------------------
    // Shared stores, each owned by exactly one stage
    // ------------------------------------------------------------------
    let internal_metrics = Arc::new(InternalMetrics::new());
    let memory_limiter = Arc::new(MemoryLimiter::new(&config.memory_limiter));
    let breaker = Arc::new(SourceBreaker::new(config.breaker.clone()));
    let health = HealthRegistry::new();
    let adapter_manager = Arc::new(AdapterManager::new());

    // ------------------------------------------------------------------
    // Processor chain
    // ------------------------------------------------------------------
    let plan_extractor = Arc::new(PlanExtractor::new(config.plans.clone()));
    let (verification, findings_rx) = VerificationProcessor::new(config.verification.clone());
    let stages: Vec<Arc<dyn Processor>> = vec![
        Arc::new(BreakerStage::new(breaker.clone())),
        plan_extractor.clone(),
        Arc::new(verification),
        Arc::new(AdaptiveSampler::new(config.sampler.clone())),
        Arc::new(CostController::new(&config.cost_control)),
        Arc::new(QueryCorrelator::new(&config.correlation)),
    ];
    let pipeline = Arc::new(Pipeline::new(stages, internal_metrics.clone()));

    // ------------------------------------------------------------------
    // Exporters
    // ------------------------------------------------------------------
    let mut exporter_handles = Vec::new();
    let mut exporter_joins = Vec::new();

    if config.exporters.otlp.enabled {
        let otlp_config = config.exporters.otlp.clone();
        let spool = if otlp_config.spool_dir.is_empty() {
            None
        } else {
            match SpoolQueue::open(&otlp_config.spool_dir, otlp_config.spool_max_segments) {
                Ok(spool) => Some(Arc::new(spool)),
                Err(e) => {
                    eprintln!("Cannot open exporter spool: {e}");
                    std::process::exit(1);
                },
            }
        };
        match OtlpExporter::new(otlp_config.clone()) {
            Ok(exporter) => {
                let (handle, join) = spawn_exporter_worker(
                    Arc::new(exporter),
                    otlp_config.queue_size,
                    RetryPolicy::new(otlp_config.retry_initial_ms, otlp_config.retry_max_elapsed_secs),
                    spool,
                    internal_metrics.clone(),
                );
                exporter_handles.push(handle);
                exporter_joins.push(join);
            },
            Err(e) => {
                eprintln!("Cannot build OTLP exporter: {e}");
                std::process::exit(1);
            },
        }
    }

    if config.exporters.file.enabled {
        let exporter: Arc<dyn Exporter> = Arc::new(FileExporter::new(&config.exporters.file));
        let (handle, join) = spawn_exporter_worker(
            exporter,
            config.exporters.file.queue_size,
            RetryPolicy::new(200, 10),
            None,
            internal_metrics.clone(),
        );
        exporter_handles.push(handle);
        exporter_joins.push(join);
    }

    if config.exporters.debug.enabled {
        let (handle, join) = spawn_exporter_worker(
            Arc::new(DebugExporter::new()),
            32,
            RetryPolicy::new(100, 2),
            None,
            internal_metrics.clone(),
        );
        exporter_handles.push(handle);
        exporter_joins.push(join);
    }

    if exporter_handles.is_empty() {
        tracing::warn!("No exporter enabled; telemetry will be processed and discarded");
    }

    // ------------------------------------------------------------------
    // Pipeline runtime
    // ------------------------------------------------------------------
    let (pipeline_handle, pipeline_shutdown, pipeline_join) = spawn_pipeline_runtime(
        pipeline.clone(),
        &config.batch,
        memory_limiter.clone(),
        exporter_handles,
        internal_metrics.clone(),
    );

    let feedback_join = spawn_feedback_drainer(findings_rx, pipeline_handle.clone());

    // ------------------------------------------------------------------
    // OTLP/gRPC receiver
    // ------------------------------------------------------------------
    let grpc_addr = match format!("{}:{}", config.server.host, config.server.grpc_port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid gRPC bind address: {}", e);
            std::process::exit(1);
        },
    };
    let (grpc_stop, grpc_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let grpc_join = {
        let handle = pipeline_handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handlers::otlp_grpc::serve(grpc_addr, handle, grpc_stop_rx).await {
                tracing::error!("OTLP/gRPC receiver failed: {}", e);
            }
        })
    };

    // ------------------------------------------------------------------
    // Per-database collection workers
    // ------------------------------------------------------------------
    let mut shutdown_flags: Vec<Arc<AtomicBool>> = Vec::new();

    for db_config in &config.databases {
        let adapter = match adapter_manager.get_adapter(db_config).await {
            Ok(adapter) => adapter,
            Err(e) => {
                // Connection errors are never fatal: the endpoint is skipped
                // and can be picked up again on restart
                tracing::error!("Skipping database '{}': {}", db_config.display_name(), e);
                internal_metrics.record_error("startup", "connection");
                continue;
            },
        };

        let detector =
            Arc::new(FeatureDetector::new(adapter.clone(), config.feature_detection.clone()));
        let selector = Arc::new(QuerySelector::new(adapter.kind(), Vec::new()));

        // Initial detection failure leaves a degraded (empty) feature set;
        // the refresh task keeps trying
        match detector.detect().await {
            Ok(_) => {
                let _ = pipeline_handle.submit(detector.feature_records()).await;
            },
            Err(e) => {
                tracing::warn!("Initial feature detection for {} failed: {}", adapter.source(), e)
            },
        }

        {
            let detector = detector.clone();
            health.register(format!("feature_detector/{}", adapter.source()), move || {
                if detector.is_healthy() { Health::Healthy } else { Health::Degraded }
            });
        }

        let scraper = Arc::new(SqlScraper::new(
            adapter.clone(),
            selector.clone(),
            detector.clone(),
            breaker.clone(),
            pipeline_handle.clone(),
            internal_metrics.clone(),
        ));
        shutdown_flags.push(start_scraper(scraper, db_config));

        if db_config.ash_enabled {
            let sampler = Arc::new(AshSampler::new(
                adapter.clone(),
                selector.clone(),
                detector.clone(),
                breaker.clone(),
                pipeline_handle.clone(),
                config.ash.clone(),
            ));
            shutdown_flags.push(sampler.shutdown_handle());

            let sample_executor = ScheduledExecutor::new(
                format!("ash-sample-{}", db_config.display_name()),
                Duration::from_millis(config.ash.sampling_interval_ms),
            );
            shutdown_flags.push(sample_executor.shutdown_handle());
            let sample_task = AshSampleTask::new(sampler.clone());
            tokio::spawn(async move { sample_executor.start(sample_task).await });

            let emit_executor = ScheduledExecutor::new(
                format!("ash-emit-{}", db_config.display_name()),
                Duration::from_secs(config.ash.emission_interval_secs),
            );
            shutdown_flags.push(emit_executor.shutdown_handle());
            let emit_task = AshEmitTask::new(sampler.clone());
            tokio::spawn(async move { emit_executor.start(emit_task).await });
        }

        // Feature refresh worker
        let refresh_task = FeatureRefreshTask::new(detector.clone(), pipeline_handle.clone());
        shutdown_flags.push(refresh_task.shutdown_handle());
        let refresh_executor = ScheduledExecutor::new(
            format!("feature-refresh-{}", db_config.display_name()),
            Duration::from_secs(config.feature_detection.refresh_interval_secs),
        );
        tokio::spawn(async move { refresh_executor.start(refresh_task).await });
    }

    {
        let breaker = breaker.clone();
        health.register("circuit_breakers", move || {
            if breaker.all_closed() { Health::Healthy } else { Health::Degraded }
        });
    }
    {
        let limiter = memory_limiter.clone();
        health.register("memory_limiter", move || match limiter.state() {
            MemoryState::Normal => Health::Healthy,
            MemoryState::Busy => Health::Degraded,
            MemoryState::Critical => Health::Unhealthy,
        });
    }

    // ------------------------------------------------------------------
    // Maintenance workers
    // ------------------------------------------------------------------
    let cleanup_task = PlanCleanupTask::new(plan_extractor.clone());
    shutdown_flags.push(cleanup_task.shutdown_handle());
    let cleanup_executor = ScheduledExecutor::new("plan-cleanup", Duration::from_secs(3600));
    tokio::spawn(async move { cleanup_executor.start(cleanup_task).await });

    let memory_executor = ScheduledExecutor::new(
        "memory-check",
        Duration::from_secs(config.memory_limiter.check_interval_secs),
    );
    shutdown_flags.push(memory_executor.shutdown_handle());
    let memory_task = MemoryCheckTask::new(memory_limiter.clone());
    tokio::spawn(async move { memory_executor.start(memory_task).await });

    // Unrecoverable-memory watchdog: exit code 2 when shedding cannot bring
    // RSS back under the limit
    {
        let limiter = memory_limiter.clone();
        tokio::spawn(async move {
            let mut critical_since: Option<std::time::Instant> = None;
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                if limiter.state() == MemoryState::Critical {
                    let since = critical_since.get_or_insert_with(std::time::Instant::now);
                    if since.elapsed() >= MEMORY_RECOVERY_DEADLINE {
                        tracing::error!(
                            "Memory limiter could not recover within {:?}; exiting",
                            MEMORY_RECOVERY_DEADLINE
                        );
                        std::process::exit(2);
                    }
                } else {
                    critical_since = None;
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // HTTP surface: health, internal metrics, OTLP/HTTP receiver
    // ------------------------------------------------------------------
    let state = Arc::new(CollectorState {
        config: config.clone(),
        adapter_manager: adapter_manager.clone(),
        breaker: breaker.clone(),
        pipeline: pipeline.clone(),
        pipeline_handle: pipeline_handle.clone(),
        memory_limiter: memory_limiter.clone(),
        internal_metrics: internal_metrics.clone(),
        health: health.clone(),
    });

    let app = Router::new()
        .route("/health", get(handlers::health::get_health))
        .route("/metrics", get(handlers::metrics::get_metrics))
        .route("/v1/metrics", post(handlers::otlp_receiver::post_metrics))
        .route("/v1/logs", post(handlers::otlp_receiver::post_logs))
        .route("/v1/traces", post(handlers::otlp_receiver::post_traces))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Cannot bind {}: {}", addr, e);
            std::process::exit(1);
        },
    };
    tracing::info!("dbpulse listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        tracing::error!("Server error: {}", e);
    }

    // ------------------------------------------------------------------
    // Graceful shutdown: stop receivers, drain, flush, close pools
    // ------------------------------------------------------------------
    tracing::info!("Shutting down: stopping collection workers");
    for flag in &shutdown_flags {
        flag.store(true, Ordering::Relaxed);
    }

    let _ = grpc_stop.send(());
    if tokio::time::timeout(SHUTDOWN_GRACE, grpc_join).await.is_err() {
        tracing::warn!("OTLP/gRPC receiver did not stop within {:?}", SHUTDOWN_GRACE);
    }

    let _ = pipeline_shutdown.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, pipeline_join).await.is_err() {
        tracing::warn!("Pipeline did not drain within {:?}", SHUTDOWN_GRACE);
    }
    drop(pipeline_handle);
    feedback_join.abort();

    for join in exporter_joins {
        if tokio::time::timeout(SHUTDOWN_GRACE, join).await.is_err() {
            tracing::warn!("An exporter did not flush within {:?}", SHUTDOWN_GRACE);
        }
    }

    adapter_manager.close_all().await;
    tracing::info!("dbpulse stopped");
}

fn init_tracing(logging: &dbpulse::config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file_layer = logging.file.as_ref().map(|path| {
        let path = std::path::Path::new(path);
        let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "dbpulse.log".to_string());
        let appender = tracing_appender::rolling::daily(directory, file_name);
        tracing_subscriber::fmt::layer().json().with_ansi(false).with_writer(appender)
    });

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => tracing::warn!("Cannot install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
