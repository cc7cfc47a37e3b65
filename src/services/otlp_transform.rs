//! Record <-> OTLP protobuf conversion
//!
//! Both OTLP surfaces share this module: the exporter builds
//! `Export*ServiceRequest` messages from record batches, and the gRPC/HTTP
//! receivers turn incoming requests back into records. Records are grouped
//! per source so each OTLP resource carries its database identity
//! (`db.system`, `server.address`, `db.name`) next to the envelope's own
//! resource attributes.

use crate::models::{
    AttrValue, DatabaseKind, Envelope, EventRecord, HistogramBucket, MetricKind, MetricRecord,
    Record, Source, TraceRecord,
};
use chrono::{TimeZone, Utc};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue, any_value};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::metrics::v1::{
    AggregationTemporality, Gauge, Histogram, HistogramDataPoint, Metric, NumberDataPoint,
    ResourceMetrics, ScopeMetrics, Sum, metric, number_data_point,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use std::collections::BTreeMap;

const SCOPE_NAME: &str = "dbpulse";

// ---------------------------------------------------------------------------
// Export direction: records -> OTLP requests
// ---------------------------------------------------------------------------

pub fn metrics_request(records: &[Record]) -> ExportMetricsServiceRequest {
    let resource_metrics = group_by_source(records, |r| matches!(r, Record::Metric(_)))
        .into_values()
        .map(|(source, group)| ResourceMetrics {
            resource: Some(resource_of(&source, group[0].envelope())),
            scope_metrics: vec![ScopeMetrics {
                scope: Some(scope()),
                metrics: group
                    .iter()
                    .filter_map(|r| match r {
                        Record::Metric(m) => Some(metric_of(m)),
                        _ => None,
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .collect();

    ExportMetricsServiceRequest { resource_metrics }
}

pub fn logs_request(records: &[Record]) -> ExportLogsServiceRequest {
    let resource_logs = group_by_source(records, |r| matches!(r, Record::Event(_)))
        .into_values()
        .map(|(source, group)| ResourceLogs {
            resource: Some(resource_of(&source, group[0].envelope())),
            scope_logs: vec![ScopeLogs {
                scope: Some(scope()),
                log_records: group
                    .iter()
                    .filter_map(|r| match r {
                        Record::Event(e) => Some(log_of(e)),
                        _ => None,
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .collect();

    ExportLogsServiceRequest { resource_logs }
}

pub fn traces_request(records: &[Record]) -> ExportTraceServiceRequest {
    let resource_spans = group_by_source(records, |r| matches!(r, Record::Trace(_)))
        .into_values()
        .map(|(source, group)| ResourceSpans {
            resource: Some(resource_of(&source, group[0].envelope())),
            scope_spans: vec![ScopeSpans {
                scope: Some(scope()),
                spans: group
                    .iter()
                    .filter_map(|r| match r {
                        Record::Trace(t) => Some(span_of(t)),
                        _ => None,
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .collect();

    ExportTraceServiceRequest { resource_spans }
}

fn group_by_source<'a>(
    records: &'a [Record],
    shape: impl Fn(&Record) -> bool,
) -> BTreeMap<String, (Source, Vec<&'a Record>)> {
    let mut groups: BTreeMap<String, (Source, Vec<&'a Record>)> = BTreeMap::new();
    for record in records.iter().filter(|r| shape(r)) {
        groups
            .entry(record.source().key())
            .or_insert_with(|| (record.source().clone(), Vec::new()))
            .1
            .push(record);
    }
    groups
}

fn scope() -> InstrumentationScope {
    InstrumentationScope { name: SCOPE_NAME.to_string(), ..Default::default() }
}

fn resource_of(source: &Source, envelope: &Envelope) -> Resource {
    let mut attributes = vec![
        kv("db.system", &AttrValue::Str(source.kind.to_string())),
        kv("server.address", &AttrValue::Str(source.endpoint.clone())),
        kv("db.name", &AttrValue::Str(source.database.clone())),
    ];
    for (key, value) in &envelope.resource_attributes {
        attributes.push(kv(key, value));
    }
    Resource { attributes, ..Default::default() }
}

fn metric_of(m: &MetricRecord) -> Metric {
    let time = nanos_of(&m.envelope);
    let data = match m.kind {
        MetricKind::Gauge => metric::Data::Gauge(Gauge {
            data_points: vec![number_point(m, time)],
        }),
        MetricKind::Sum => metric::Data::Sum(Sum {
            data_points: vec![number_point(m, time)],
            aggregation_temporality: AggregationTemporality::Cumulative as i32,
            is_monotonic: true,
        }),
        MetricKind::Histogram => metric::Data::Histogram(Histogram {
            data_points: vec![histogram_point(m, time)],
            aggregation_temporality: AggregationTemporality::Cumulative as i32,
        }),
    };

    Metric {
        name: m.name.clone(),
        unit: m.unit.clone(),
        data: Some(data),
        ..Default::default()
    }
}

fn number_point(m: &MetricRecord, time_unix_nano: u64) -> NumberDataPoint {
    NumberDataPoint {
        attributes: attr_list(&m.attributes),
        time_unix_nano,
        value: Some(number_data_point::Value::AsDouble(m.value)),
        ..Default::default()
    }
}

fn histogram_point(m: &MetricRecord, time_unix_nano: u64) -> HistogramDataPoint {
    // OTLP wants one more bucket count than bounds (the overflow bucket)
    let explicit_bounds: Vec<f64> = m.histogram_buckets.iter().map(|b| b.upper_bound).collect();
    let mut bucket_counts: Vec<u64> = m.histogram_buckets.iter().map(|b| b.count).collect();
    bucket_counts.push(0);

    HistogramDataPoint {
        attributes: attr_list(&m.attributes),
        time_unix_nano,
        count: m.histogram_buckets.iter().map(|b| b.count).sum(),
        sum: Some(m.value),
        bucket_counts,
        explicit_bounds,
        ..Default::default()
    }
}

fn log_of(e: &EventRecord) -> LogRecord {
    let time = nanos_of(&e.envelope);
    LogRecord {
        time_unix_nano: time,
        observed_time_unix_nano: time,
        severity_number: i32::from(e.envelope.severity.unwrap_or(9)),
        body: Some(AnyValue { value: Some(any_value::Value::StringValue(e.body.clone())) }),
        attributes: attr_list(&e.attributes),
        ..Default::default()
    }
}

fn span_of(t: &TraceRecord) -> Span {
    let time = nanos_of(&t.envelope);
    let trace_id = t
        .attributes
        .get("trace_id")
        .and_then(|v| v.as_str())
        .map(|s| id_bytes(s, 16))
        .unwrap_or_else(|| vec![0; 16]);

    Span {
        trace_id,
        span_id: id_bytes(&t.span_id, 8),
        parent_span_id: t
            .parent_span_id
            .as_deref()
            .map(|s| id_bytes(s, 8))
            .unwrap_or_default(),
        name: SCOPE_NAME.to_string(),
        start_time_unix_nano: time,
        end_time_unix_nano: time,
        attributes: attr_list(&t.attributes),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Receive direction: OTLP requests -> records
// ---------------------------------------------------------------------------

pub fn records_from_metrics(request: ExportMetricsServiceRequest) -> Vec<Record> {
    let mut records = Vec::new();
    for resource in request.resource_metrics {
        let (source, resource_attrs) = source_of(resource.resource.as_ref());
        for scope in resource.scope_metrics {
            for metric in scope.metrics {
                records.extend(records_of_metric(metric, &source, &resource_attrs));
            }
        }
    }
    records
}

pub fn records_from_logs(request: ExportLogsServiceRequest) -> Vec<Record> {
    let mut records = Vec::new();
    for resource in request.resource_logs {
        let (source, resource_attrs) = source_of(resource.resource.as_ref());
        for scope in resource.scope_logs {
            for log in scope.log_records {
                let mut envelope = Envelope::at(source.clone(), time_of(log.time_unix_nano));
                envelope.resource_attributes = resource_attrs.clone();
                envelope.severity = u8::try_from(log.severity_number).ok().filter(|s| *s > 0);
                records.push(Record::Event(EventRecord {
                    envelope,
                    body: log
                        .body
                        .and_then(|b| b.value)
                        .map(render_any_value)
                        .unwrap_or_default(),
                    attributes: attr_map(log.attributes),
                }));
            }
        }
    }
    records
}

pub fn records_from_traces(request: ExportTraceServiceRequest) -> Vec<Record> {
    let mut records = Vec::new();
    for resource in request.resource_spans {
        let (source, resource_attrs) = source_of(resource.resource.as_ref());
        for scope in resource.scope_spans {
            for span in scope.spans {
                let mut envelope = Envelope::at(source.clone(), time_of(span.start_time_unix_nano));
                envelope.resource_attributes = resource_attrs.clone();
                let mut attributes = attr_map(span.attributes);
                if span.trace_id.iter().any(|b| *b != 0) {
                    attributes.insert("trace_id".to_string(), AttrValue::Str(hex_of(&span.trace_id)));
                }
                records.push(Record::Trace(TraceRecord {
                    envelope,
                    span_id: hex_of(&span.span_id),
                    parent_span_id: if span.parent_span_id.is_empty() {
                        None
                    } else {
                        Some(hex_of(&span.parent_span_id))
                    },
                    attributes,
                }));
            }
        }
    }
    records
}

fn records_of_metric(
    metric: Metric,
    source: &Source,
    resource_attrs: &BTreeMap<String, AttrValue>,
) -> Vec<Record> {
    let mut records = Vec::new();
    let name = metric.name;
    let unit = metric.unit;
    let Some(data) = metric.data else {
        return records;
    };

    match data {
        metric::Data::Gauge(gauge) => {
            for point in gauge.data_points {
                records.push(number_record(&name, &unit, MetricKind::Gauge, point, source, resource_attrs));
            }
        },
        metric::Data::Sum(sum) => {
            for point in sum.data_points {
                records.push(number_record(&name, &unit, MetricKind::Sum, point, source, resource_attrs));
            }
        },
        metric::Data::Histogram(histogram) => {
            for point in histogram.data_points {
                let buckets: Vec<HistogramBucket> = point
                    .explicit_bounds
                    .iter()
                    .zip(&point.bucket_counts)
                    .map(|(upper_bound, count)| HistogramBucket { upper_bound: *upper_bound, count: *count })
                    .collect();
                let mut envelope = Envelope::at(source.clone(), time_of(point.time_unix_nano));
                envelope.resource_attributes = resource_attrs.clone();
                records.push(Record::Metric(MetricRecord {
                    envelope,
                    name: name.clone(),
                    unit: unit.clone(),
                    kind: MetricKind::Histogram,
                    value: point.sum.unwrap_or(0.0),
                    histogram_buckets: buckets,
                    attributes: attr_map(point.attributes),
                }));
            }
        },
        // Exponential histograms and summaries are not produced by any
        // monitored source; skipped rather than guessed at
        _ => {},
    }

    records
}

fn number_record(
    name: &str,
    unit: &str,
    kind: MetricKind,
    point: NumberDataPoint,
    source: &Source,
    resource_attrs: &BTreeMap<String, AttrValue>,
) -> Record {
    let value = match point.value {
        Some(number_data_point::Value::AsDouble(v)) => v,
        Some(number_data_point::Value::AsInt(v)) => v as f64,
        None => 0.0,
    };
    let mut envelope = Envelope::at(source.clone(), time_of(point.time_unix_nano));
    envelope.resource_attributes = resource_attrs.clone();
    Record::Metric(MetricRecord {
        envelope,
        name: name.to_string(),
        unit: unit.to_string(),
        kind,
        value,
        histogram_buckets: Vec::new(),
        attributes: attr_map(point.attributes),
    })
}

/// Ingested telemetry keeps its resource attributes; the source is derived
/// from the standard db.* / server.* attributes where present
fn source_of(resource: Option<&Resource>) -> (Source, BTreeMap<String, AttrValue>) {
    let attrs = resource
        .map(|r| attr_map(r.attributes.clone()))
        .unwrap_or_default();

    let kind = match attrs.get("db.system").and_then(|v| v.as_str()) {
        Some("mysql") => DatabaseKind::MySql,
        _ => DatabaseKind::Postgres,
    };
    let endpoint = attrs
        .get("server.address")
        .and_then(|v| v.as_str())
        .unwrap_or("otlp-ingest")
        .to_string();
    let database = attrs.get("db.name").and_then(|v| v.as_str()).unwrap_or("ingest").to_string();

    (Source::new(kind, endpoint, database), attrs)
}

// ---------------------------------------------------------------------------
// Value plumbing
// ---------------------------------------------------------------------------

fn kv(key: &str, value: &AttrValue) -> KeyValue {
    let typed = match value {
        AttrValue::Int(v) => any_value::Value::IntValue(*v),
        AttrValue::Double(v) => any_value::Value::DoubleValue(*v),
        AttrValue::Str(v) => any_value::Value::StringValue(v.clone()),
        AttrValue::Bool(v) => any_value::Value::BoolValue(*v),
    };
    KeyValue { key: key.to_string(), value: Some(AnyValue { value: Some(typed) }) }
}

fn attr_list(attrs: &BTreeMap<String, AttrValue>) -> Vec<KeyValue> {
    attrs.iter().map(|(k, v)| kv(k, v)).collect()
}

fn attr_map(attrs: Vec<KeyValue>) -> BTreeMap<String, AttrValue> {
    let mut out = BTreeMap::new();
    for attr in attrs {
        let Some(value) = attr.value.and_then(|v| v.value) else {
            continue;
        };
        let parsed = match value {
            any_value::Value::StringValue(s) => AttrValue::Str(s),
            any_value::Value::IntValue(i) => AttrValue::Int(i),
            any_value::Value::DoubleValue(d) => AttrValue::Double(d),
            any_value::Value::BoolValue(b) => AttrValue::Bool(b),
            // Arrays, maps and raw bytes have no attribute representation
            _ => continue,
        };
        out.insert(attr.key, parsed);
    }
    out
}

fn render_any_value(value: any_value::Value) -> String {
    match value {
        any_value::Value::StringValue(s) => s,
        any_value::Value::IntValue(i) => i.to_string(),
        any_value::Value::DoubleValue(d) => d.to_string(),
        any_value::Value::BoolValue(b) => b.to_string(),
        _ => String::new(),
    }
}

fn nanos_of(envelope: &Envelope) -> u64 {
    envelope.timestamp.timestamp_nanos_opt().unwrap_or_default().max(0) as u64
}

fn time_of(nanos: u64) -> chrono::DateTime<Utc> {
    if nanos == 0 {
        Utc::now()
    } else {
        Utc.timestamp_nanos(nanos as i64)
    }
}

fn hex_of(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Fixed-width id from a hex string; short or malformed input zero-pads
fn id_bytes(hex: &str, width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width];
    for (i, chunk) in hex.as_bytes().chunks(2).take(width).enumerate() {
        if let Ok(s) = std::str::from_utf8(chunk)
            && let Ok(b) = u8::from_str_radix(s, 16)
        {
            out[i] = b;
        }
    }
    out
}
