//! Core data models for the audit ledger and telemetry pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

//
// ================= Event Ids =================
//

static LAST_EVENT_ID: Mutex<u128> = Mutex::new(0);

/// Next time-ordered event id (UUIDv7).
///
/// Ids are strictly increasing within the process: when two ids land in the
/// same millisecond and the random tail would sort backwards, the previous id
/// plus one is issued instead. Sorting ids lexicographically therefore yields
/// generation order.
pub fn next_event_id() -> Uuid {
    let candidate = Uuid::now_v7().as_u128();
    let mut last = LAST_EVENT_ID.lock().unwrap_or_else(PoisonError::into_inner);
    let next = if candidate > *last { candidate } else { *last + 1 };
    *last = next;
    Uuid::from_u128(next)
}

/// Millisecond timestamp embedded in a UUIDv7.
pub fn event_time(id: &Uuid) -> DateTime<Utc> {
    let millis = (id.as_u128() >> 80) as i64;
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

//
// ================= Ledger =================
//

/// A single, immutable record of the hash-chained ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence_no: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    /// Canonical JSON, stored byte-for-byte as hashed.
    pub payload: Box<RawValue>,
    pub prev_hash: String,
    pub this_hash: String,
}

impl AuditEntry {
    /// `prev_hash` of the very first entry.
    pub const GENESIS_HASH: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";

    pub fn payload_value(&self) -> crate::Result<Value> {
        Ok(serde_json::from_str(self.payload.get())?)
    }

    /// Correlation id of the telemetry event recorded in this entry, if any.
    pub fn correlation_id(&self) -> Option<String> {
        self.payload_value()
            .ok()?
            .get("correlation_id")?
            .as_str()
            .map(str::to_string)
    }
}

/// Tip of the ledger, suitable for publishing as an external commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipCommitment {
    pub sequence_no: u64,
    pub hash: String,
    pub epoch: u64,
}

//
// ================= Telemetry =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Started,
    Working,
    Ready,
    Error,
}

/// What a telemetry event means structurally.
///
/// `Progress` and `Token` originate from specialist agents; every other kind
/// is emitted by the stream generator around the agents' work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    RunStarted,
    StepStarted,
    Progress,
    Token,
    StepFinished,
    StateDelta,
    RunFinished,
    RunFailed,
}

impl TelemetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::RunStarted => "run_started",
            TelemetryKind::StepStarted => "step_started",
            TelemetryKind::Progress => "progress",
            TelemetryKind::Token => "token",
            TelemetryKind::StepFinished => "step_finished",
            TelemetryKind::StateDelta => "state_delta",
            TelemetryKind::RunFinished => "run_finished",
            TelemetryKind::RunFailed => "run_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TelemetryKind::RunFinished | TelemetryKind::RunFailed)
    }

    pub fn is_agent_originated(&self) -> bool {
        matches!(self, TelemetryKind::Progress | TelemetryKind::Token)
    }
}

/// How an event is treated by the audit path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditClass {
    /// Droppable, never written to the ledger.
    #[default]
    Ephemeral,
    Informational,
    /// Decisions that move money; blocked when the ledger is unavailable.
    TradeExecution,
}

impl AuditClass {
    pub fn is_audit_critical(&self) -> bool {
        !matches!(self, AuditClass::Ephemeral)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub action: String,
    pub content: Value,
}

impl Step {
    pub fn new(action: impl Into<String>, content: Value) -> Self {
        Self {
            action: action.into(),
            content,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    pub event_id: Uuid,
    pub correlation_id: String,
    pub agent_name: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Step>,
    pub kind: TelemetryKind,
    #[serde(default)]
    pub audit_class: AuditClass,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(
        correlation_id: impl Into<String>,
        agent_name: impl Into<String>,
        status: AgentStatus,
        kind: TelemetryKind,
        step: Option<Step>,
        audit_class: AuditClass,
    ) -> Self {
        let event_id = next_event_id();
        Self {
            event_id,
            correlation_id: correlation_id.into(),
            agent_name: agent_name.into(),
            status,
            step,
            kind,
            audit_class,
            timestamp: event_time(&event_id),
        }
    }

    /// Ledger `event_type` under which this event is recorded.
    pub fn ledger_event_type(&self) -> String {
        format!("telemetry.{}", self.kind.as_str())
    }
}

//
// ================= SSE Frames =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    RunStarted,
    StepStarted,
    Data,
    StepFinished,
    RunFinished,
    StateDelta,
    Error,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::RunStarted => "RUN_STARTED",
            FrameType::StepStarted => "STEP_STARTED",
            FrameType::Data => "DATA",
            FrameType::StepFinished => "STEP_FINISHED",
            FrameType::RunFinished => "RUN_FINISHED",
            FrameType::StateDelta => "STATE_DELTA",
            FrameType::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameType::RunFinished | FrameType::Error)
    }
}

/// Outcome reported in a `STEP_FINISHED` frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Error,
    Timeout,
}

/// One frame of one request's stream. Never shared across requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SseFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl SseFrame {
    pub fn new(frame_type: FrameType, data: Value) -> Self {
        Self {
            frame_type,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>, recoverable: bool, retry_after_ms: Option<u64>) -> Self {
        Self::new(
            FrameType::Error,
            serde_json::json!({
                "message": message.into(),
                "recoverable": recoverable,
                "retry_after_ms": retry_after_ms,
            }),
        )
    }
}

/// Aggregates carried by the terminal metadata frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    pub token_count: u64,
    pub dropped_events: u64,
    pub elapsed_ms: u64,
    pub agents_invoked: Vec<String>,
}

//
// ================= Trace =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub request_id: String,
    pub complete: bool,
    pub events: Vec<TelemetryEvent>,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Started => "started",
            AgentStatus::Working => "working",
            AgentStatus::Ready => "ready",
            AgentStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
