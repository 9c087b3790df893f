use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::ledger::HashChainLedger;
use crate::models::TelemetryEvent;
use crate::telemetry::AuditSink;
use crate::Result;

/// Writes each audit-critical event to the hash-chained ledger.
pub struct LedgerRecorder {
    ledger: Arc<HashChainLedger>,
}

impl LedgerRecorder {
    pub fn new(ledger: Arc<HashChainLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl AuditSink for LedgerRecorder {
    async fn record(&self, event: &TelemetryEvent) -> Result<()> {
        let payload = serde_json::to_value(event)?;
        let entry = self
            .ledger
            .append(&event.ledger_event_type(), &payload)
            .await?;
        debug!(
            "Recorded {} for {} at sequence {}",
            entry.event_type, event.correlation_id, entry.sequence_no
        );
        Ok(())
    }
}
