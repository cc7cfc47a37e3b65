use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    #[serde(rename = "database")]
    pub databases: Vec<DatabaseConfig>,
    pub feature_detection: FeatureDetectionConfig,
    pub ash: AshConfig,
    pub sampler: SamplerConfig,
    pub breaker: BreakerConfig,
    pub plans: PlanConfig,
    pub verification: VerificationConfig,
    pub cost_control: CostControlConfig,
    pub correlation: CorrelationConfig,
    pub memory_limiter: MemoryLimiterConfig,
    pub batch: BatchConfig,
    pub exporters: ExportersConfig,
}

/// Bind address for the health / internal-metrics / OTLP-HTTP surface
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// OTLP/gRPC receiver bind port
    pub grpc_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080, grpc_port: 4317 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" in production, "pretty" for development
    pub format: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "json".to_string(), file: None }
    }
}

/// One monitored database endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Display name; defaults to host:port/database when empty
    pub name: String,
    /// "postgres" or "mysql"
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub tls: bool,
    pub pool: PoolConfig,
    /// How often the metrics/logs scraper cycles, in seconds
    pub collection_interval_secs: u64,
    /// Whether the active-session sampler runs for this endpoint
    pub ash_enabled: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: "postgres".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            username: String::new(),
            password: String::new(),
            database: "postgres".to_string(),
            tls: false,
            pool: PoolConfig::default(),
            collection_interval_secs: 30,
            ash_enabled: true,
        }
    }
}

impl DatabaseConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{}/{}", self.endpoint(), self.database)
        } else {
            self.name.clone()
        }
    }
}

/// Connection pool tunables, sized well below the server's max_connections
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub max_open: usize,
    pub max_idle: usize,
    pub max_lifetime_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_open: 5, max_idle: 2, max_lifetime_secs: 300 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureDetectionConfig {
    pub cache_duration_secs: u64,
    pub refresh_interval_secs: u64,
    pub timeout_per_check_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub skip_cloud_detection: bool,
}

impl Default for FeatureDetectionConfig {
    fn default() -> Self {
        Self {
            cache_duration_secs: 300,
            refresh_interval_secs: 300,
            timeout_per_check_ms: 3000,
            retry_attempts: 2,
            retry_delay_ms: 500,
            skip_cloud_detection: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AshConfig {
    pub sampling_interval_ms: u64,
    /// How long the in-memory ring keeps samples
    pub retention_secs: u64,
    pub aggregation_windows_secs: Vec<u64>,
    pub max_queries_per_window: usize,
    pub top_n: usize,
    /// Coarser schedule on which sample-derived metrics are emitted
    pub emission_interval_secs: u64,
}

impl Default for AshConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 1000,
            retention_secs: 3600,
            aggregation_windows_secs: vec![60, 300, 900],
            max_queries_per_window: 100,
            top_n: 10,
            emission_interval_secs: 10,
        }
    }
}

/// One adaptive-sampler rule: first match wins
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamplerRuleConfig {
    /// Attribute key the rule matches on
    pub attribute: String,
    /// Value the attribute must render to; absent = any value
    #[serde(default)]
    pub equals: Option<String>,
    pub sample_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplerConfig {
    pub default_sampling_rate: f64,
    pub rules: Vec<SamplerRuleConfig>,
    pub dedup_max_size: usize,
    pub dedup_ttl_secs: u64,
    /// Fixed RNG seed; decisions are reproducible for a given record stream
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            default_sampling_rate: 1.0,
            rules: Vec::new(),
            dedup_max_size: 10_000,
            dedup_ttl_secs: 300,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Consecutive-failure streaks older than this restart from zero
    pub failure_window_secs: u64,
    pub open_timeout_secs: u64,
    pub query_error_threshold: u32,
    pub connection_failure_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            open_timeout_secs: 30,
            query_error_threshold: 10,
            connection_failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanConfig {
    pub retention_period_secs: u64,
    pub max_plans_per_query: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self { retention_period_secs: 86_400, max_plans_per_query: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerificationConfig {
    /// Attribute keys containing any of these substrings are PII by name
    pub pii_field_names: Vec<String>,
    /// Keys that pass through untouched even when they match
    pub excluded_fields: Vec<String>,
    pub redaction_text: String,
    pub required_fields: Vec<String>,
    /// Per-field distinct-value limits
    pub cardinality_limits: HashMap<String, usize>,
    pub feedback_buffer: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            pii_field_names: vec![
                "email".to_string(),
                "phone".to_string(),
                "ssn".to_string(),
                "credit_card".to_string(),
                "password".to_string(),
                "token".to_string(),
                "api_key".to_string(),
                "secret".to_string(),
            ],
            excluded_fields: Vec::new(),
            redaction_text: "[REDACTED]".to_string(),
            required_fields: Vec::new(),
            cardinality_limits: HashMap::new(),
            feedback_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostControlConfig {
    pub max_data_points_per_minute: u64,
    pub max_distinct_series: u64,
    /// "warn", "throttle", or "drop"
    pub enforcement_mode: String,
}

impl Default for CostControlConfig {
    fn default() -> Self {
        Self {
            max_data_points_per_minute: 60_000,
            max_distinct_series: 50_000,
            enforcement_mode: "throttle".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorrelationConfig {
    pub window_secs: u64,
    pub max_records_per_key: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self { window_secs: 30, max_records_per_key: 100 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryLimiterConfig {
    pub limit_mib: u64,
    pub spike_limit_mib: u64,
    pub check_interval_secs: u64,
}

impl Default for MemoryLimiterConfig {
    fn default() -> Self {
        Self { limit_mib: 512, spike_limit_mib: 128, check_interval_secs: 5 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub send_batch_size: usize,
    pub send_batch_max_size: usize,
    pub timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { send_batch_size: 512, send_batch_max_size: 2048, timeout_ms: 2000 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ExportersConfig {
    pub otlp: OtlpExporterConfig,
    pub file: FileExporterConfig,
    pub debug: DebugExporterConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OtlpExporterConfig {
    pub enabled: bool,
    pub endpoint: String,
    /// "grpc" or "http"
    pub protocol: String,
    /// Auth and routing headers attached to every request (gRPC metadata
    /// or HTTP headers, per protocol)
    pub headers: HashMap<String, String>,
    pub compression: bool,
    pub retry_initial_ms: u64,
    pub retry_max_elapsed_secs: u64,
    pub queue_size: usize,
    /// Spool directory for the file-backed sending queue; empty disables spooling
    pub spool_dir: String,
    pub spool_max_segments: usize,
}

impl Default for OtlpExporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:4317".to_string(),
            protocol: "grpc".to_string(),
            headers: HashMap::new(),
            compression: true,
            retry_initial_ms: 500,
            retry_max_elapsed_secs: 120,
            queue_size: 256,
            spool_dir: String::new(),
            spool_max_segments: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileExporterConfig {
    pub enabled: bool,
    pub path: String,
    pub rotate_max_bytes: u64,
    pub rotate_max_age_secs: u64,
    pub queue_size: usize,
}

impl Default for FileExporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "telemetry.jsonl".to_string(),
            rotate_max_bytes: 64 * 1024 * 1024,
            rotate_max_age_secs: 3600,
            queue_size: 256,
        }
    }
}

/// Development only
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct DebugExporterConfig {
    pub enabled: bool,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "dbpulse")]
#[command(version, about = "dbpulse - Database Telemetry Collector")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Logging level (overrides config file, e.g., "info,dbpulse=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Logging format: "json" or "pretty" (overrides config file)
    #[arg(long, value_name = "FORMAT")]
    pub log_format: Option<String>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with DBPULSE_)
    /// 3. Configuration file (config.toml, with ${VAR} expansion)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        Self::load_with_args(cli_args)
    }

    pub fn load_with_args(cli_args: CommandLineArgs) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - DBPULSE_SERVER_HOST: Server host (default: 0.0.0.0)
    /// - DBPULSE_SERVER_PORT: Server port (default: 8080)
    /// - DBPULSE_LOG_LEVEL: Logging level (e.g., "info,dbpulse=debug")
    /// - DBPULSE_LOG_FORMAT: "json" or "pretty"
    /// - DBPULSE_OTLP_ENDPOINT: OTLP exporter endpoint
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("DBPULSE_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("DBPULSE_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
            tracing::info!("Override server.port from env: {}", self.server.port);
        }

        if let Ok(level) = std::env::var("DBPULSE_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(format) = std::env::var("DBPULSE_LOG_FORMAT") {
            self.logging.format = format;
            tracing::info!("Override logging.format from env: {}", self.logging.format);
        }

        if let Ok(endpoint) = std::env::var("DBPULSE_OTLP_ENDPOINT") {
            self.exporters.otlp.endpoint = endpoint;
            tracing::info!("Override exporters.otlp.endpoint from env");
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(format) = &args.log_format {
            self.logging.format = format.clone();
            tracing::info!("Override logging.format from CLI: {}", self.logging.format);
        }
    }

    /// Validate configuration; rejects unsafe combinations at startup
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("server.port cannot be 0");
        }

        for db in &self.databases {
            if db.kind != "postgres" && db.kind != "mysql" {
                anyhow::bail!("database '{}': kind must be 'postgres' or 'mysql'", db.display_name());
            }
            if db.host.is_empty() {
                anyhow::bail!("database '{}': host cannot be empty", db.display_name());
            }
            if db.username.is_empty() {
                anyhow::bail!("database '{}': username cannot be empty", db.display_name());
            }
            if db.pool.max_open == 0 || db.pool.max_open > 50 {
                anyhow::bail!(
                    "database '{}': pool.max_open must be in 1..=50 (keep the pool far below the server's max_connections)",
                    db.display_name()
                );
            }
            if db.pool.max_idle > db.pool.max_open {
                anyhow::bail!("database '{}': pool.max_idle cannot exceed pool.max_open", db.display_name());
            }
            if db.collection_interval_secs == 0 {
                anyhow::bail!("database '{}': collection_interval_secs must be > 0", db.display_name());
            }
        }

        if self.ash.sampling_interval_ms == 0 {
            anyhow::bail!("ash.sampling_interval_ms must be > 0");
        }
        if self.ash.retention_secs * 1000 < self.ash.sampling_interval_ms {
            anyhow::bail!("ash.retention_secs must cover at least one sampling interval");
        }
        if self.ash.max_queries_per_window == 0 {
            anyhow::bail!("ash.max_queries_per_window must be > 0");
        }

        if !(0.0..=1.0).contains(&self.sampler.default_sampling_rate) {
            anyhow::bail!("sampler.default_sampling_rate must be within [0, 1]");
        }
        for rule in &self.sampler.rules {
            if !(0.0..=1.0).contains(&rule.sample_rate) {
                anyhow::bail!("sampler rule '{}': sample_rate must be within [0, 1]", rule.attribute);
            }
        }

        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be > 0");
        }

        match self.cost_control.enforcement_mode.as_str() {
            "warn" | "throttle" | "drop" => {},
            other => anyhow::bail!("cost_control.enforcement_mode '{}' is not one of warn/throttle/drop", other),
        }
        if self.cost_control.max_data_points_per_minute == 0 {
            anyhow::bail!("cost_control.max_data_points_per_minute must be > 0");
        }

        if self.memory_limiter.spike_limit_mib >= self.memory_limiter.limit_mib {
            anyhow::bail!("memory_limiter.spike_limit_mib must be below memory_limiter.limit_mib");
        }

        if self.batch.send_batch_size == 0 || self.batch.send_batch_max_size < self.batch.send_batch_size {
            anyhow::bail!("batch.send_batch_max_size must be >= batch.send_batch_size > 0");
        }

        if self.exporters.otlp.enabled && self.exporters.otlp.endpoint.is_empty() {
            anyhow::bail!("exporters.otlp.endpoint cannot be empty when the exporter is enabled");
        }
        match self.exporters.otlp.protocol.as_str() {
            "grpc" | "http" => {},
            other => anyhow::bail!("exporters.otlp.protocol '{}' is not one of grpc/http", other),
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    pub fn collection_interval(db: &DatabaseConfig) -> Duration {
        Duration::from_secs(db.collection_interval_secs)
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references in the raw config text
/// before TOML parsing. Unset variables without a default expand to "".
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let expr = &after[..end];
                let (name, default) = match expr.split_once(":-") {
                    Some((n, d)) => (n, Some(d)),
                    None => (expr, None),
                };
                match std::env::var(name) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(default.unwrap_or("")),
                }
                rest = &after[end + 1..];
            },
            None => {
                // Unterminated reference; keep the text as-is
                out.push_str(&rest[start..]);
                rest = "";
            },
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_expansion() {
        // Unique names to avoid cross-test interference
        unsafe {
            std::env::set_var("DBPULSE_TEST_HOST", "db.internal");
        }
        let raw = r#"host = "${DBPULSE_TEST_HOST}" port = "${DBPULSE_TEST_MISSING:-5432}" gone = "${DBPULSE_TEST_MISSING}""#;
        let expanded = expand_env_vars(raw);
        assert!(expanded.contains(r#"host = "db.internal""#));
        assert!(expanded.contains(r#"port = "5432""#));
        assert!(expanded.contains(r#"gone = """#));
    }

    #[test]
    fn test_unsafe_pool_size_rejected() {
        let mut config = Config::default();
        config.databases.push(DatabaseConfig {
            username: "monitor".into(),
            pool: PoolConfig { max_open: 200, max_idle: 2, max_lifetime_secs: 300 },
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_enforcement_mode_rejected() {
        let mut config = Config::default();
        config.cost_control.enforcement_mode = "panic".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let raw = r#"
[server]
host = "0.0.0.0"
not_a_key = true
"#;
        let parsed: Result<Config, _> = toml::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_database_toml_section_parses() {
        let raw = r#"
[[database]]
name = "orders-primary"
kind = "postgres"
host = "db1"
port = 5432
username = "monitor"
password = "s3cret"
database = "orders"
collection_interval_secs = 15
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.databases.len(), 1);
        assert_eq!(config.databases[0].display_name(), "orders-primary");
        assert_eq!(config.databases[0].endpoint(), "db1:5432");
    }

    #[test]
    fn test_spike_limit_must_be_below_hard_limit() {
        let mut config = Config::default();
        config.memory_limiter.limit_mib = 100;
        config.memory_limiter.spike_limit_mib = 100;
        assert!(config.validate().is_err());
    }
}
