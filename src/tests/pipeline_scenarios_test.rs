//! End-to-end scenarios run through the fully wired processor chain

use super::common::{build_full_pipeline, gauge, mysql_source, pg_source};
use crate::config::BreakerConfig;
use crate::models::{AttrValue, Record};
use crate::services::pipeline::circuit_breaker::Outcome;
use crate::services::pipeline::{CircuitState, SourceBreaker};
use std::time::Duration;

#[test]
fn test_envelope_preserved_end_to_end() {
    let t = build_full_pipeline();

    let mut rec = gauge(pg_source(), "db.connections.active", 3.0);
    rec.set_attribute("state", "active");
    let timestamp = rec.timestamp();
    let source = rec.source().clone();

    let out = t.pipeline.process(vec![rec]);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].timestamp(), timestamp);
    assert_eq!(out[0].source(), &source);
}

#[test]
fn test_breaker_open_source_contributes_zero_records() {
    let t = build_full_pipeline();
    let bad = pg_source();
    let good = mysql_source();

    // Trip the breaker for the postgres source
    for _ in 0..BreakerConfig::default().connection_failure_threshold {
        t.breaker.record(&bad, Outcome::ConnectionFailure);
    }
    assert_eq!(t.breaker.state(&bad), CircuitState::Open);

    let batch = vec![
        gauge(bad.clone(), "db.size", 1.0),
        gauge(good.clone(), "db.size", 2.0),
        gauge(bad.clone(), "db.connections", 3.0),
    ];
    let out = t.pipeline.process(batch);

    // Nothing from the open source survives; the transition event and the
    // healthy source's record do
    assert!(out.iter().all(|r| r.source() != &bad || matches!(r, Record::Event(_))));
    assert!(
        out.iter()
            .any(|r| r.source() == &good && r.metric_name() == Some("db.size"))
    );
}

#[test]
fn test_pii_redacted_through_chain_with_feedback() {
    let mut t = build_full_pipeline();

    let mut rec = Record::event(pg_source(), "user lookup");
    rec.set_attribute("user_email", "alice@example.com");

    let out = t.pipeline.process(vec![rec]);
    assert_eq!(out.len(), 1);
    assert_eq!(
        out[0].get_attribute("user_email").map(|v| v.render()),
        Some("[REDACTED]".to_string())
    );

    let finding = t.findings.try_recv().expect("pii finding posted");
    assert_eq!(finding.severity, 8);
    let feedback = finding.into_record();
    assert_eq!(
        feedback.get_attribute("event.name").map(|v| v.render()),
        Some("pii_detected".to_string())
    );
}

#[test]
fn test_quality_score_attached_to_every_record() {
    let t = build_full_pipeline();
    let out = t.pipeline.process(vec![gauge(pg_source(), "db.size", 10.0)]);
    match out[0].get_attribute("quality_score") {
        Some(AttrValue::Double(score)) => assert!((0.0..=1.0).contains(score)),
        other => panic!("missing quality score: {:?}", other),
    }
}

#[test]
fn test_query_text_anonymized_and_correlated_through_chain() {
    let t = build_full_pipeline();

    // Two sources so the sampler's dedup window does not collapse the pair;
    // correlation links them through the shared fingerprint key
    let mut a = gauge(pg_source(), "db.statements.mean_time", 12.5);
    a.set_attribute("query_text", "SELECT * FROM users WHERE id = 7");
    let mut b = Record::event(mysql_source(), "slow query");
    b.set_attribute("query_text", "SELECT * FROM users WHERE id = 99");

    let out = t.pipeline.process(vec![a, b]);
    assert_eq!(out.len(), 2);

    for rec in &out {
        assert_eq!(
            rec.get_attribute("query_text").map(|v| v.render()),
            Some("SELECT * FROM users WHERE id = ?".to_string())
        );
    }

    // Same fingerprint -> same correlation id
    let id_a = out[0].get_attribute("correlation_id").unwrap().render();
    let id_b = out[1].get_attribute("correlation_id").unwrap().render();
    assert_eq!(id_a, id_b);
}

/// Breaker lifecycle: threshold trips it open, the open window refuses,
/// then a single half-open probe and one success close it again
#[tokio::test]
async fn test_breaker_lifecycle_timing() {
    let breaker = SourceBreaker::new(BreakerConfig {
        failure_threshold: 3,
        failure_window_secs: 3600,
        open_timeout_secs: 1,
        query_error_threshold: u32::MAX,
        connection_failure_threshold: u32::MAX,
    });
    let source = pg_source();

    breaker.record(&source, Outcome::QueryFailure);
    breaker.record(&source, Outcome::QueryFailure);
    assert_eq!(breaker.state(&source), CircuitState::Closed, "k-1 failures stay closed");
    breaker.record(&source, Outcome::QueryFailure);
    assert_eq!(breaker.state(&source), CircuitState::Open, "k-th failure opens");

    // Still inside the open window
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!breaker.allow(&source));

    // Past the window: exactly one probe is admitted
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(breaker.allow(&source));
    assert_eq!(breaker.state(&source), CircuitState::HalfOpen);
    assert!(!breaker.allow(&source), "second probe refused while one is in flight");

    breaker.record(&source, Outcome::Success);
    assert_eq!(breaker.state(&source), CircuitState::Closed);
}

#[test]
fn test_regression_event_survives_zero_rate_sampling() {
    // Regression-flagged events must pass the sampler even at rate zero,
    // because the full pipeline maps them to an always-keep rule
    use crate::config::SamplerConfig;
    use crate::services::pipeline::{AdaptiveSampler, Processor};

    let sampler = AdaptiveSampler::new(SamplerConfig { default_sampling_rate: 0.0, ..Default::default() });
    let mut event = Record::event(pg_source(), "plan regression detected");
    event.set_attribute("plan.regression", true);

    let kept = sampler.process(vec![event]).unwrap();
    assert_eq!(kept.len(), 1);
}
