//! Reasoning trace reconstruction
//!
//! A trace is every telemetry event recorded for one request, ordered by
//! event id. Persisted telemetry is the primary source; ledger entries fill
//! in audit-critical events the store may have missed.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::PipelineError;
use crate::ledger::HashChainLedger;
use crate::models::{ReasoningTrace, TelemetryEvent};
use crate::telemetry::TelemetryStore;
use crate::Result;

pub struct TraceAggregator {
    store: Arc<dyn TelemetryStore>,
    ledger: Option<Arc<HashChainLedger>>,
}

impl TraceAggregator {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self {
            store,
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<HashChainLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Trace for `request_id`; `complete` once the run has finished or failed.
    ///
    /// Queries while a run is still streaming return the events so far.
    pub async fn get_trace(&self, request_id: &str) -> Result<ReasoningTrace> {
        let mut events = self.store.events_for(request_id).await?;

        if let Some(ledger) = &self.ledger {
            let mut seen: HashSet<_> = events.iter().map(|e| e.event_id).collect();
            for entry in ledger.entries_for_correlation(request_id).await? {
                if !entry.event_type.starts_with("telemetry.") {
                    continue;
                }
                match serde_json::from_str::<TelemetryEvent>(entry.payload.get()) {
                    Ok(event) if seen.insert(event.event_id) => events.push(event),
                    Ok(_) => {}
                    Err(e) => debug!(
                        "Skipping ledger entry {} in trace: {}",
                        entry.sequence_no, e
                    ),
                }
            }
        }

        if events.is_empty() {
            return Err(PipelineError::NotFound(format!(
                "no telemetry recorded for request {}",
                request_id
            )));
        }

        // UUIDv7 byte order is generation order.
        events.sort_by_key(|event| event.event_id);
        let complete = events.iter().any(|event| event.kind.is_terminal());

        Ok(ReasoningTrace {
            request_id: request_id.to_string(),
            complete,
            events,
        })
    }
}
