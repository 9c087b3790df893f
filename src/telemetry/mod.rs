//! Telemetry fan-out, audit recording and persistence

pub mod bus;
pub mod recorder;
pub mod store;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::models::{AuditClass, TelemetryEvent};
use crate::Result;

pub use bus::{EventBus, EventBusBuilder, Subscription};
pub use recorder::LedgerRecorder;
pub use store::{build_telemetry_store, InMemoryTelemetryStore, PgTelemetryStore, TelemetryStore};

/// Durable destination for audit-critical events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &TelemetryEvent) -> Result<()>;
}

/// What `publish` does when the audit sink cannot record an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Refuse the event; the caller sees the error.
    Block,
    /// Deliver the event anyway and flag the bus as degraded.
    Degrade,
}

impl FromStr for FailureMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "block" => Ok(FailureMode::Block),
            "degrade" => Ok(FailureMode::Degrade),
            other => Err(PipelineError::Config(format!(
                "unknown audit failure mode '{}', expected block or degrade",
                other
            ))),
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureMode::Block => write!(f, "block"),
            FailureMode::Degrade => write!(f, "degrade"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditPolicy {
    pub trade_execution: FailureMode,
    pub informational: FailureMode,
}

impl AuditPolicy {
    pub fn mode_for(&self, class: AuditClass) -> FailureMode {
        match class {
            AuditClass::TradeExecution => self.trade_execution,
            AuditClass::Informational => self.informational,
            AuditClass::Ephemeral => FailureMode::Degrade,
        }
    }
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self {
            trade_execution: FailureMode::Block,
            informational: FailureMode::Degrade,
        }
    }
}
