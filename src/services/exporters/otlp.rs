//! OTLP exporter
//!
//! Speaks both OTLP transports from the same record batches: gRPC through
//! the generated collector service clients, and OTLP/HTTP carrying the
//! protobuf encoding. One request per signal (metrics, logs, traces);
//! retries are handled by the exporter worker, this type performs a single
//! send.

use super::Exporter;
use crate::config::OtlpExporterConfig;
use crate::models::Record;
use crate::services::otlp_transform;
use crate::utils::{CollectorError, CollectorResult};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_client::LogsServiceClient;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use prost::Message;
use std::io::Write;
use std::time::Duration;
use tonic::codec::CompressionEncoding;
use tonic::metadata::{Ascii, MetadataKey, MetadataValue};
use tonic::transport::{Channel, Endpoint};

enum Transport {
    Grpc {
        metrics: MetricsServiceClient<Channel>,
        logs: LogsServiceClient<Channel>,
        traces: TraceServiceClient<Channel>,
        metadata: Vec<(MetadataKey<Ascii>, MetadataValue<Ascii>)>,
    },
    Http {
        client: reqwest::Client,
    },
}

pub struct OtlpExporter {
    transport: Transport,
    config: OtlpExporterConfig,
}

impl OtlpExporter {
    pub fn new(config: OtlpExporterConfig) -> CollectorResult<Self> {
        let transport = match config.protocol.as_str() {
            "grpc" => {
                let endpoint = Endpoint::from_shared(config.endpoint.clone())
                    .map_err(|e| CollectorError::config(format!("otlp endpoint: {}", e)))?
                    .timeout(Duration::from_secs(30));
                // Lazy connect: the worker's retry policy owns reconnection
                let channel = endpoint.connect_lazy();

                let mut metrics = MetricsServiceClient::new(channel.clone());
                let mut logs = LogsServiceClient::new(channel.clone());
                let mut traces = TraceServiceClient::new(channel);
                if config.compression {
                    metrics = metrics.send_compressed(CompressionEncoding::Gzip);
                    logs = logs.send_compressed(CompressionEncoding::Gzip);
                    traces = traces.send_compressed(CompressionEncoding::Gzip);
                }

                let metadata = parse_metadata(&config)?;
                Transport::Grpc { metrics, logs, traces, metadata }
            },
            _ => {
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build()
                    .map_err(|e| CollectorError::internal_error(format!("otlp client: {}", e)))?;
                Transport::Http { client }
            },
        };

        Ok(Self { transport, config })
    }

    async fn send_grpc(&self, batch: &[Record]) -> CollectorResult<()> {
        let Transport::Grpc { metrics, logs, traces, metadata } = &self.transport else {
            return Err(CollectorError::internal_error("grpc transport not configured"));
        };

        let metrics_request = otlp_transform::metrics_request(batch);
        if !metrics_request.resource_metrics.is_empty() {
            // Clients are thin handles over the channel; clone per call for
            // the &mut the generated API wants
            let mut client = metrics.clone();
            client
                .export(with_metadata(metrics_request, metadata))
                .await
                .map_err(|status| CollectorError::export_failed("otlp", status.to_string()))?;
        }

        let logs_request = otlp_transform::logs_request(batch);
        if !logs_request.resource_logs.is_empty() {
            let mut client = logs.clone();
            client
                .export(with_metadata(logs_request, metadata))
                .await
                .map_err(|status| CollectorError::export_failed("otlp", status.to_string()))?;
        }

        let traces_request = otlp_transform::traces_request(batch);
        if !traces_request.resource_spans.is_empty() {
            let mut client = traces.clone();
            client
                .export(with_metadata(traces_request, metadata))
                .await
                .map_err(|status| CollectorError::export_failed("otlp", status.to_string()))?;
        }

        Ok(())
    }

    async fn send_http(&self, batch: &[Record]) -> CollectorResult<()> {
        let metrics_request = otlp_transform::metrics_request(batch);
        if !metrics_request.resource_metrics.is_empty() {
            self.post_proto("/v1/metrics", metrics_request.encode_to_vec()).await?;
        }

        let logs_request = otlp_transform::logs_request(batch);
        if !logs_request.resource_logs.is_empty() {
            self.post_proto("/v1/logs", logs_request.encode_to_vec()).await?;
        }

        let traces_request = otlp_transform::traces_request(batch);
        if !traces_request.resource_spans.is_empty() {
            self.post_proto("/v1/traces", traces_request.encode_to_vec()).await?;
        }

        Ok(())
    }

    async fn post_proto(&self, path: &str, body: Vec<u8>) -> CollectorResult<()> {
        let Transport::Http { client } = &self.transport else {
            return Err(CollectorError::internal_error("http transport not configured"));
        };

        let url = format!("{}{}", self.config.endpoint.trim_end_matches('/'), path);
        let mut request = client.post(&url).header("content-type", "application/x-protobuf");
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let request = if self.config.compression {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&body)
                .and_then(|_| encoder.finish())
                .map(|compressed| request.header("content-encoding", "gzip").body(compressed))
                .map_err(|e| CollectorError::internal_error(format!("otlp gzip: {}", e)))?
        } else {
            request.body(body)
        };

        let response = request
            .send()
            .await
            .map_err(|e| CollectorError::export_failed("otlp", e.to_string()))?;

        if !response.status().is_success() {
            return Err(CollectorError::export_failed(
                "otlp",
                format!("{} returned {}", url, response.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Exporter for OtlpExporter {
    fn name(&self) -> &'static str {
        "otlp"
    }

    async fn export(&self, batch: &[Record]) -> CollectorResult<()> {
        match self.transport {
            Transport::Grpc { .. } => self.send_grpc(batch).await,
            Transport::Http { .. } => self.send_http(batch).await,
        }
    }
}

fn with_metadata<T>(
    message: T,
    metadata: &[(MetadataKey<Ascii>, MetadataValue<Ascii>)],
) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    for (key, value) in metadata {
        request.metadata_mut().insert(key.clone(), value.clone());
    }
    request
}

fn parse_metadata(
    config: &OtlpExporterConfig,
) -> CollectorResult<Vec<(MetadataKey<Ascii>, MetadataValue<Ascii>)>> {
    let mut metadata = Vec::with_capacity(config.headers.len());
    for (key, value) in &config.headers {
        let key: MetadataKey<Ascii> = key
            .to_lowercase()
            .parse()
            .map_err(|_| CollectorError::config(format!("invalid otlp header name '{}'", key)))?;
        let value: MetadataValue<Ascii> = value.parse().map_err(|_| {
            CollectorError::config(format!("invalid otlp header value for '{}'", key.as_str()))
        })?;
        metadata.push((key, value));
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(protocol: &str, endpoint: &str) -> OtlpExporterConfig {
        OtlpExporterConfig {
            enabled: true,
            endpoint: endpoint.to_string(),
            protocol: protocol.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_grpc_transport_builds_from_valid_endpoint() {
        let exporter = OtlpExporter::new(config("grpc", "http://localhost:4317")).unwrap();
        assert!(matches!(exporter.transport, Transport::Grpc { .. }));
    }

    #[test]
    fn test_http_transport_is_the_fallback_protocol() {
        let exporter = OtlpExporter::new(config("http", "http://localhost:4318")).unwrap();
        assert!(matches!(exporter.transport, Transport::Http { .. }));
    }

    #[test]
    fn test_invalid_grpc_endpoint_rejected() {
        assert!(OtlpExporter::new(config("grpc", "not a uri")).is_err());
    }

    #[test]
    fn test_header_names_normalized_for_grpc_metadata() {
        let mut cfg = config("grpc", "http://localhost:4317");
        cfg.headers.insert("Api-Key".to_string(), "secret".to_string());
        let metadata = parse_metadata(&cfg).unwrap();
        assert_eq!(metadata[0].0.as_str(), "api-key");
    }
}
