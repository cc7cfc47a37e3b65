pub mod health;
pub mod metrics;
pub mod otlp_grpc;
pub mod otlp_receiver;
