//! OTLP/gRPC receiver
//!
//! Serves the three OTLP collector services on the configured gRPC port.
//! Ingested payloads are converted to records and flow through the same
//! pipeline as scraped telemetry; memory back-pressure surfaces as
//! RESOURCE_EXHAUSTED so well-behaved peers retry later.

use crate::services::otlp_transform;
use crate::services::pipeline::PipelineHandle;
use crate::utils::CollectorError;
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::{
    LogsService, LogsServiceServer,
};
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::{
    TraceService, TraceServiceServer,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use std::net::SocketAddr;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::models::Record;

async fn accept(handle: &PipelineHandle, records: Vec<Record>) -> Result<(), Status> {
    if records.is_empty() {
        return Ok(());
    }
    match handle.submit(records).await {
        Ok(()) => Ok(()),
        Err(CollectorError::Busy) => Err(Status::resource_exhausted("collector is busy, retry later")),
        Err(_) => Err(Status::unavailable("collector is shutting down")),
    }
}

struct MetricsReceiver {
    handle: PipelineHandle,
}

#[tonic::async_trait]
impl MetricsService for MetricsReceiver {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let records = otlp_transform::records_from_metrics(request.into_inner());
        accept(&self.handle, records).await?;
        Ok(Response::new(ExportMetricsServiceResponse::default()))
    }
}

struct LogsReceiver {
    handle: PipelineHandle,
}

#[tonic::async_trait]
impl LogsService for LogsReceiver {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let records = otlp_transform::records_from_logs(request.into_inner());
        accept(&self.handle, records).await?;
        Ok(Response::new(ExportLogsServiceResponse::default()))
    }
}

struct TraceReceiver {
    handle: PipelineHandle,
}

#[tonic::async_trait]
impl TraceService for TraceReceiver {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let records = otlp_transform::records_from_traces(request.into_inner());
        accept(&self.handle, records).await?;
        Ok(Response::new(ExportTraceServiceResponse::default()))
    }
}

/// Serve the OTLP/gRPC receiver until the shutdown signal fires
pub async fn serve(
    addr: SocketAddr,
    handle: PipelineHandle,
    shutdown: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), tonic::transport::Error> {
    tracing::info!("OTLP/gRPC receiver listening on {}", addr);

    Server::builder()
        .add_service(MetricsServiceServer::new(MetricsReceiver { handle: handle.clone() }))
        .add_service(LogsServiceServer::new(LogsReceiver { handle: handle.clone() }))
        .add_service(TraceServiceServer::new(TraceReceiver { handle }))
        .serve_with_shutdown(addr, async {
            let _ = shutdown.await;
            tracing::info!("OTLP/gRPC receiver shutting down");
        })
        .await
}
