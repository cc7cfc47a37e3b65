//! Debug exporter (development only): pretty-prints every record to the log

use super::Exporter;
use crate::models::Record;
use crate::utils::CollectorResult;
use async_trait::async_trait;

#[derive(Default)]
pub struct DebugExporter;

impl DebugExporter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Exporter for DebugExporter {
    fn name(&self) -> &'static str {
        "debug"
    }

    async fn export(&self, batch: &[Record]) -> CollectorResult<()> {
        for record in batch {
            match record {
                Record::Metric(m) => tracing::info!(
                    "[debug exporter] metric {} = {} ({}) attrs={:?}",
                    m.name,
                    m.value,
                    m.envelope.source,
                    m.attributes
                ),
                Record::Event(e) => tracing::info!(
                    "[debug exporter] event sev={:?} ({}) {}",
                    e.envelope.severity,
                    e.envelope.source,
                    e.body
                ),
                Record::Trace(t) => tracing::info!(
                    "[debug exporter] span {} parent={:?} ({})",
                    t.span_id,
                    t.parent_span_id,
                    t.envelope.source
                ),
            }
        }
        Ok(())
    }
}
