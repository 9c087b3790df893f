//! Financial Agent Audit Pipeline
//!
//! The accountable and observable core of a multi-agent financial analysis
//! service:
//! - Canonical JSON serialization for every audited payload
//! - Append-only SHA-256 hash-chained ledger with sealed epochs
//! - Offline integrity verification against published tip commitments
//! - In-process telemetry bus with bounded, lossy subscribers
//! - SSE run streams driven by specialist agents
//! - Reasoning trace reconstruction per request
//!
//! FLOW:
//! AGENT → EVENT BUS → (LEDGER, TELEMETRY STORE, SUBSCRIBERS) → SSE FRAMES

pub mod agents;
pub mod api;
pub mod canonical;
pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod stream;
pub mod telemetry;
pub mod trace;
pub mod verify;

pub use error::{PipelineError, Result};

// Re-export common types
pub use canonical::Canonicalizer;
pub use ledger::HashChainLedger;
pub use models::*;
pub use stream::SseStreamGenerator;
pub use telemetry::EventBus;
pub use trace::TraceAggregator;
pub use verify::IntegrityVerifier;
