//! Per-request server-sent event streams
//!
//! [`SseStreamGenerator::start`] spawns a driver task for one request. The
//! driver runs the requested agents in order, turns their telemetry into
//! frames, and hands the frames to the returned [`FrameStream`]. Dropping the
//! stream or calling [`FrameStream::cancel`] stops the agent currently
//! running.
//!
//! A correlation id has at most one live run per generator.

pub mod machine;
pub mod wire;

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::agents::{wait_for_stop, AgentContext, SpecialistAgent, StepOutcome};
use crate::error::PipelineError;
use crate::models::{
    AgentStatus, AuditClass, FrameType, RunMetadata, SseFrame, Step, StepStatus, TelemetryEvent,
    TelemetryKind,
};
use crate::telemetry::{EventBus, Subscription};
use crate::Result;

pub use machine::{FrameSequencer, RunPhase};
pub use wire::encode_frame;

/// Agent name used for events the generator itself emits.
pub const ORCHESTRATOR: &str = "orchestrator";

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Longest a single agent step may run.
    pub step_timeout: Duration,
    /// Frames buffered ahead of a slow client.
    pub channel_capacity: usize,
    /// Advertised in recoverable ERROR frames.
    pub retry_after_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_millis(15_000),
            channel_capacity: 64,
            retry_after_ms: 2_000,
        }
    }
}

pub struct RunRequest {
    pub correlation_id: String,
    pub input: Value,
    pub agents: Vec<Arc<dyn SpecialistAgent>>,
}

type LiveRuns = Arc<Mutex<HashSet<String>>>;

/// Holds a correlation id in the live set until the driver is gone.
struct LiveRun {
    correlation_id: String,
    live: LiveRuns,
}

impl Drop for LiveRun {
    fn drop(&mut self) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.correlation_id);
    }
}

pub struct SseStreamGenerator {
    bus: EventBus,
    config: StreamConfig,
    live: LiveRuns,
}

impl SseStreamGenerator {
    pub fn new(bus: EventBus, config: StreamConfig) -> Self {
        Self {
            bus,
            config,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn is_live(&self, correlation_id: &str) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(correlation_id)
    }

    /// Start a run. Frames are produced as the run progresses.
    ///
    /// Fails with [`PipelineError::RunInProgress`] while another run with the
    /// same correlation id is still live.
    pub fn start(&self, request: RunRequest) -> Result<FrameStream> {
        let inserted = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.correlation_id.clone());
        if !inserted {
            warn!("Rejected second live run for {}", request.correlation_id);
            return Err(PipelineError::RunInProgress(request.correlation_id));
        }
        let live_run = LiveRun {
            correlation_id: request.correlation_id.clone(),
            live: self.live.clone(),
        };

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let correlation_id = request.correlation_id.clone();
        let filter_id = correlation_id.clone();
        // Registered before the driver starts so no agent event is missed.
        let subscription = self.bus.subscribe(move |event| {
            event.correlation_id == filter_id && event.kind.is_agent_originated()
        });

        let driver = RunDriver {
            _live_run: live_run,
            bus: self.bus.clone(),
            config: self.config.clone(),
            request,
            tx,
            cancel: cancel_rx,
            subscription,
            sequencer: FrameSequencer::new(),
            started: Instant::now(),
            token_count: 0,
            agents_invoked: Vec::new(),
        };
        tokio::spawn(driver.run());

        Ok(FrameStream {
            rx,
            cancel: cancel_tx,
            correlation_id,
        })
    }
}

/// Frames of one request, in emission order.
pub struct FrameStream {
    rx: mpsc::Receiver<SseFrame>,
    cancel: watch::Sender<bool>,
    correlation_id: String,
}

impl FrameStream {
    pub async fn next(&mut self) -> Option<SseFrame> {
        self.rx.recv().await
    }

    /// Stop the run. Remaining frames end with ERROR.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Drain every remaining frame.
    pub async fn collect(mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next().await {
            frames.push(frame);
        }
        frames
    }

    /// Encoded frames for an HTTP response body.
    pub fn into_wire_stream(self) -> impl Stream<Item = std::result::Result<String, Infallible>> {
        // Disconnect is detected from the closed channel once the body drops.
        let FrameStream { rx, .. } = self;
        ReceiverStream::new(rx).map(|frame| Ok(encode_frame(&frame)))
    }
}

enum Halt {
    /// Client went away; nobody to send frames to.
    Disconnected,
    Cancelled,
    Failed(PipelineError),
}

enum StepEnd {
    Finished(std::result::Result<Result<StepOutcome>, JoinError>),
    TimedOut,
}

struct RunDriver {
    // Dropped before `tx`, so the id is free again once the stream ends.
    _live_run: LiveRun,
    bus: EventBus,
    config: StreamConfig,
    request: RunRequest,
    tx: mpsc::Sender<SseFrame>,
    cancel: watch::Receiver<bool>,
    subscription: Subscription,
    sequencer: FrameSequencer,
    started: Instant,
    token_count: u64,
    agents_invoked: Vec<String>,
}

impl RunDriver {
    async fn run(mut self) {
        let correlation_id = self.request.correlation_id.clone();
        info!("Run {} started with {} agents", correlation_id, self.request.agents.len());

        match self.drive().await {
            Ok(()) => {
                info!(
                    "Run {} finished in {} ms",
                    correlation_id,
                    self.started.elapsed().as_millis()
                );
            }
            Err(Halt::Disconnected) => {
                info!("Client disconnected from run {}", correlation_id);
                self.record_failure("client disconnected").await;
            }
            Err(Halt::Cancelled) => {
                info!("Run {} cancelled", correlation_id);
                self.record_failure("cancelled").await;
                let frame = SseFrame::error("run cancelled", true, Some(self.config.retry_after_ms));
                self.send_terminal(frame).await;
            }
            Err(Halt::Failed(e)) => {
                error!("Run {} failed: {}", correlation_id, e);
                self.record_failure(&e.to_string()).await;
                let recoverable = e.is_recoverable();
                let retry_after = recoverable.then_some(self.config.retry_after_ms);
                let frame = SseFrame::error(e.to_string(), recoverable, retry_after);
                self.send_terminal(frame).await;
            }
        }
    }

    async fn drive(&mut self) -> std::result::Result<(), Halt> {
        let names: Vec<String> = self
            .request
            .agents
            .iter()
            .map(|agent| agent.name().to_string())
            .collect();

        self.lifecycle(
            TelemetryKind::RunStarted,
            AgentStatus::Started,
            ORCHESTRATOR,
            Step::new("run_started", json!({ "agents": names })),
        )
        .await?;
        self.send(
            FrameType::RunStarted,
            json!({ "request_id": self.request.correlation_id, "agents": names }),
        )
        .await?;

        let agents = self.request.agents.clone();
        for (index, agent) in agents.into_iter().enumerate() {
            self.check_stop()?;
            self.run_step(index, agent).await?;
        }

        let metadata = RunMetadata {
            token_count: self.token_count,
            dropped_events: self.subscription.dropped(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            agents_invoked: self.agents_invoked.clone(),
        };
        let metadata = serde_json::to_value(&metadata).map_err(|e| Halt::Failed(e.into()))?;
        self.lifecycle(
            TelemetryKind::StateDelta,
            AgentStatus::Ready,
            ORCHESTRATOR,
            Step::new("run_metadata", metadata.clone()),
        )
        .await?;
        self.send(FrameType::StateDelta, json!({ "metadata": metadata }))
            .await?;

        self.lifecycle(
            TelemetryKind::RunFinished,
            AgentStatus::Ready,
            ORCHESTRATOR,
            Step::new("run_finished", json!({ "agents": self.agents_invoked })),
        )
        .await?;
        self.send(
            FrameType::RunFinished,
            json!({ "request_id": self.request.correlation_id }),
        )
        .await
    }

    async fn run_step(
        &mut self,
        index: usize,
        agent: Arc<dyn SpecialistAgent>,
    ) -> std::result::Result<(), Halt> {
        let name = agent.name().to_string();
        self.lifecycle(
            TelemetryKind::StepStarted,
            AgentStatus::Started,
            &name,
            Step::new("step_started", json!({ "index": index })),
        )
        .await?;
        self.send(
            FrameType::StepStarted,
            json!({ "agent": name, "index": index }),
        )
        .await?;
        self.agents_invoked.push(name.clone());

        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = AgentContext::new(
            self.bus.clone(),
            self.request.correlation_id.clone(),
            name.clone(),
            self.request.input.clone(),
            stop_rx,
        );
        let step_started = Instant::now();
        let mut task = tokio::spawn(async move { agent.run(ctx).await });
        let deadline = tokio::time::sleep(self.config.step_timeout);
        tokio::pin!(deadline);

        let end = loop {
            tokio::select! {
                biased;
                _ = self.tx.closed() => {
                    let _ = stop_tx.send(true);
                    task.abort();
                    return Err(Halt::Disconnected);
                }
                _ = wait_for_stop(&mut self.cancel) => {
                    let _ = stop_tx.send(true);
                    task.abort();
                    return Err(Halt::Cancelled);
                }
                Some(event) = self.subscription.recv() => {
                    self.forward(event).await?;
                }
                joined = &mut task => break StepEnd::Finished(joined),
                _ = &mut deadline => {
                    let _ = stop_tx.send(true);
                    task.abort();
                    break StepEnd::TimedOut;
                }
            }
        };

        // Events the agent published before it returned.
        while let Some(event) = self.subscription.try_recv() {
            self.forward(event).await?;
        }

        let elapsed_ms = step_started.elapsed().as_millis() as u64;
        let (status, detail) = match end {
            StepEnd::Finished(Ok(Ok(outcome))) => (StepStatus::Ok, json!({ "summary": outcome.summary })),
            StepEnd::Finished(Ok(Err(e))) => {
                warn!("Agent {} failed: {}", name, e);
                (StepStatus::Error, json!({ "message": e.to_string() }))
            }
            StepEnd::Finished(Err(e)) => {
                warn!("Agent {} task aborted: {}", name, e);
                (StepStatus::Error, json!({ "message": format!("agent task failed: {}", e) }))
            }
            StepEnd::TimedOut => {
                let timeout_ms = self.config.step_timeout.as_millis() as u64;
                warn!("Agent {} timed out after {} ms", name, timeout_ms);
                (StepStatus::Timeout, json!({ "timeout_ms": timeout_ms }))
            }
        };

        let mut data = json!({
            "agent": name,
            "index": index,
            "status": status,
            "elapsed_ms": elapsed_ms,
        });
        if let (Some(data), Value::Object(detail)) = (data.as_object_mut(), detail) {
            data.extend(detail);
        }

        let agent_status = match status {
            StepStatus::Ok => AgentStatus::Ready,
            StepStatus::Error | StepStatus::Timeout => AgentStatus::Error,
        };
        self.lifecycle(
            TelemetryKind::StepFinished,
            agent_status,
            &name,
            Step::new("step_finished", data.clone()),
        )
        .await?;
        self.send(FrameType::StepFinished, data).await
    }

    /// Agent event to DATA frame.
    async fn forward(&mut self, event: TelemetryEvent) -> std::result::Result<(), Halt> {
        if event.kind == TelemetryKind::Token {
            self.token_count += 1;
        }
        let data = json!({
            "event_id": event.event_id,
            "agent": event.agent_name,
            "kind": event.kind,
            "status": event.status,
            "step": event.step,
        });
        self.send(FrameType::Data, data).await
    }

    /// Publish a generator-side lifecycle event.
    ///
    /// A payload the canonicalizer rejects is logged and skipped; an audit
    /// failure the policy blocks halts the run.
    async fn lifecycle(
        &self,
        kind: TelemetryKind,
        status: AgentStatus,
        agent_name: &str,
        step: Step,
    ) -> std::result::Result<(), Halt> {
        let event = TelemetryEvent::new(
            self.request.correlation_id.clone(),
            agent_name,
            status,
            kind,
            Some(step),
            AuditClass::Informational,
        );
        match self.bus.publish(event).await {
            Ok(_) => Ok(()),
            Err(PipelineError::Canonicalization(e)) => {
                warn!(
                    "Dropped {} event for {}: {}",
                    kind.as_str(),
                    self.request.correlation_id,
                    e
                );
                Ok(())
            }
            Err(e) => Err(Halt::Failed(e)),
        }
    }

    async fn record_failure(&self, reason: &str) {
        let event = TelemetryEvent::new(
            self.request.correlation_id.clone(),
            ORCHESTRATOR,
            AgentStatus::Error,
            TelemetryKind::RunFailed,
            Some(Step::new("run_failed", json!({ "reason": reason }))),
            AuditClass::Informational,
        );
        if let Err(e) = self.bus.publish(event).await {
            warn!(
                "Failed to record failure of run {}: {}",
                self.request.correlation_id, e
            );
        }
    }

    async fn send(&mut self, frame_type: FrameType, data: Value) -> std::result::Result<(), Halt> {
        self.sequencer.advance(frame_type).map_err(Halt::Failed)?;
        debug!("{} -> {}", self.request.correlation_id, frame_type);
        self.tx
            .send(SseFrame::new(frame_type, data))
            .await
            .map_err(|_| Halt::Disconnected)
    }

    /// Best-effort ERROR frame; a stream always opens with RUN_STARTED.
    async fn send_terminal(&mut self, frame: SseFrame) {
        if self.sequencer.is_closed() {
            return;
        }
        if self.sequencer.phase() == RunPhase::Init {
            let opening = json!({ "request_id": self.request.correlation_id, "agents": [] });
            if self.send(FrameType::RunStarted, opening).await.is_err() {
                return;
            }
        }
        if self.sequencer.advance(FrameType::Error).is_ok() {
            let _ = self.tx.send(frame).await;
        }
    }

    fn check_stop(&self) -> std::result::Result<(), Halt> {
        if self.tx.is_closed() {
            return Err(Halt::Disconnected);
        }
        if *self.cancel.borrow() {
            return Err(Halt::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::{HangingAgent, ScriptedAgent};
    use crate::ledger::{HashChainLedger, InMemoryLedgerStore, LedgerConfig};
    use crate::telemetry::{
        AuditPolicy, FailureMode, InMemoryTelemetryStore, LedgerRecorder, TelemetryStore,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    fn generator(bus: EventBus, step_timeout: Duration) -> SseStreamGenerator {
        SseStreamGenerator::new(
            bus,
            StreamConfig {
                step_timeout,
                ..StreamConfig::default()
            },
        )
    }

    fn request(id: &str, agents: Vec<Arc<dyn SpecialistAgent>>) -> RunRequest {
        RunRequest {
            correlation_id: id.to_string(),
            input: json!({"ticker": "ACME"}),
            agents,
        }
    }

    fn types(frames: &[SseFrame]) -> Vec<FrameType> {
        frames.iter().map(|f| f.frame_type).collect()
    }

    fn assert_single_open_and_close(frames: &[SseFrame]) {
        let kinds = types(frames);
        assert_eq!(kinds.first(), Some(&FrameType::RunStarted));
        assert_eq!(
            kinds.iter().filter(|k| **k == FrameType::RunStarted).count(),
            1
        );
        assert_eq!(kinds.iter().filter(|k| k.is_terminal()).count(), 1);
        assert!(kinds.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_two_agent_run_frame_sequence() {
        let generator = generator(EventBus::new(), Duration::from_secs(5));
        let agents: Vec<Arc<dyn SpecialistAgent>> = vec![
            Arc::new(ScriptedAgent::new("quant_agent", &["a", "b"])),
            Arc::new(ScriptedAgent::new("risk_agent", &["c"])),
        ];

        let frames = generator.start(request("req-1", agents)).unwrap().collect().await;

        let without_metadata: Vec<FrameType> = types(&frames)
            .into_iter()
            .filter(|t| *t != FrameType::StateDelta)
            .collect();
        assert_eq!(
            without_metadata,
            vec![
                FrameType::RunStarted,
                FrameType::StepStarted,
                FrameType::Data,
                FrameType::Data,
                FrameType::Data,
                FrameType::StepFinished,
                FrameType::StepStarted,
                FrameType::Data,
                FrameType::Data,
                FrameType::StepFinished,
                FrameType::RunFinished,
            ]
        );
        assert_single_open_and_close(&frames);

        let metadata = &frames[frames.len() - 2];
        assert_eq!(metadata.frame_type, FrameType::StateDelta);
        assert_eq!(metadata.data["metadata"]["token_count"], 3);
        assert_eq!(
            metadata.data["metadata"]["agents_invoked"],
            json!(["quant_agent", "risk_agent"])
        );
    }

    #[tokio::test]
    async fn test_data_frames_follow_token_order() {
        let generator = generator(EventBus::new(), Duration::from_secs(5));
        let agents: Vec<Arc<dyn SpecialistAgent>> =
            vec![Arc::new(ScriptedAgent::new("quant_agent", &["1", "2", "3", "4"]))];

        let frames = generator.start(request("req-1", agents)).unwrap().collect().await;
        let tokens: Vec<String> = frames
            .iter()
            .filter(|f| f.frame_type == FrameType::Data && f.data["kind"] == "token")
            .map(|f| f.data["step"]["content"]["text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(tokens, vec!["1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_agent_error_reported_and_run_continues() {
        let generator = generator(EventBus::new(), Duration::from_secs(5));
        let agents: Vec<Arc<dyn SpecialistAgent>> = vec![
            Arc::new(ScriptedAgent::failing("quant_agent", "model unavailable")),
            Arc::new(ScriptedAgent::new("risk_agent", &["ok"])),
        ];

        let frames = generator.start(request("req-1", agents)).unwrap().collect().await;

        let finished: Vec<&SseFrame> = frames
            .iter()
            .filter(|f| f.frame_type == FrameType::StepFinished)
            .collect();
        assert_eq!(finished[0].data["status"], "error");
        assert_eq!(finished[0].data["message"], "Agent error: model unavailable");
        assert_eq!(finished[1].data["status"], "ok");
        assert_eq!(frames.last().unwrap().frame_type, FrameType::RunFinished);
    }

    #[tokio::test]
    async fn test_step_timeout_closes_step() {
        let released = Arc::new(AtomicBool::new(false));
        let generator = generator(EventBus::new(), Duration::from_millis(50));
        let agents: Vec<Arc<dyn SpecialistAgent>> = vec![Arc::new(HangingAgent {
            name: "quant_agent".to_string(),
            released: released.clone(),
        })];

        let frames = generator.start(request("req-1", agents)).unwrap().collect().await;

        let finished = frames
            .iter()
            .find(|f| f.frame_type == FrameType::StepFinished)
            .unwrap();
        assert_eq!(finished.data["status"], "timeout");
        assert_eq!(frames.last().unwrap().frame_type, FrameType::RunFinished);
        assert_single_open_and_close(&frames);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_ends_with_error_and_stops_agent() {
        let released = Arc::new(AtomicBool::new(false));
        let generator = generator(EventBus::new(), Duration::from_secs(30));
        let agents: Vec<Arc<dyn SpecialistAgent>> = vec![Arc::new(HangingAgent {
            name: "quant_agent".to_string(),
            released: released.clone(),
        })];

        let mut stream = generator.start(request("req-1", agents)).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = stream.next().await {
            let is_data = frame.frame_type == FrameType::Data;
            frames.push(frame);
            if is_data {
                stream.cancel();
            }
        }

        let last = frames.last().unwrap();
        assert_eq!(last.frame_type, FrameType::Error);
        assert_eq!(last.data["recoverable"], true);
        assert_single_open_and_close(&frames);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_agent() {
        let released = Arc::new(AtomicBool::new(false));
        let store = Arc::new(InMemoryTelemetryStore::new());
        let bus = EventBus::builder().persist_to(store.clone()).build();
        let generator = generator(bus, Duration::from_secs(30));
        let agents: Vec<Arc<dyn SpecialistAgent>> = vec![Arc::new(HangingAgent {
            name: "quant_agent".to_string(),
            released: released.clone(),
        })];

        let mut stream = generator.start(request("req-1", agents)).unwrap();
        while let Some(frame) = stream.next().await {
            if frame.frame_type == FrameType::Data {
                break;
            }
        }
        drop(stream);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(released.load(Ordering::SeqCst));

        let events = store.events_for("req-1").await.unwrap();
        assert_eq!(events.last().unwrap().kind, TelemetryKind::RunFailed);
    }

    #[tokio::test]
    async fn test_blocked_audit_ends_with_recoverable_error() {
        let ledger_store = Arc::new(InMemoryLedgerStore::new());
        let config = LedgerConfig {
            write_attempts: 1,
            retry_base: Duration::from_millis(1),
            ..LedgerConfig::default()
        };
        let ledger = Arc::new(HashChainLedger::open(ledger_store.clone(), config).await.unwrap());
        let policy = AuditPolicy {
            trade_execution: FailureMode::Block,
            informational: FailureMode::Block,
        };
        let bus = EventBus::builder()
            .audit_sink(Arc::new(LedgerRecorder::new(ledger)), policy)
            .build();
        let generator = SseStreamGenerator::new(
            bus,
            StreamConfig {
                retry_after_ms: 750,
                ..StreamConfig::default()
            },
        );
        ledger_store.fail_next_writes(1);

        let agents: Vec<Arc<dyn SpecialistAgent>> =
            vec![Arc::new(ScriptedAgent::new("quant_agent", &["a"]))];
        let frames = generator.start(request("req-1", agents)).unwrap().collect().await;

        assert_eq!(
            types(&frames),
            vec![FrameType::RunStarted, FrameType::Error]
        );
        let error = &frames[1];
        assert_eq!(error.data["recoverable"], true);
        assert_eq!(error.data["retry_after_ms"], 750);
    }

    #[tokio::test]
    async fn test_concurrent_runs_do_not_share_frames() {
        let bus = EventBus::new();
        let generator = generator(bus, Duration::from_secs(5));

        let first = generator.start(request(
            "req-a",
            vec![Arc::new(ScriptedAgent::new("quant_agent", &["a1", "a2"]))],
        ))
        .unwrap();
        let second = generator.start(request(
            "req-b",
            vec![Arc::new(ScriptedAgent::new("quant_agent", &["b1"]))],
        ))
        .unwrap();

        let (first, second) = tokio::join!(first.collect(), second.collect());

        let texts = |frames: &[SseFrame]| -> Vec<String> {
            frames
                .iter()
                .filter(|f| f.data["kind"] == "token")
                .map(|f| f.data["step"]["content"]["text"].as_str().unwrap().to_string())
                .collect()
        };
        assert_eq!(texts(&first), vec!["a1", "a2"]);
        assert_eq!(texts(&second), vec!["b1"]);
    }

    #[tokio::test]
    async fn test_empty_run_still_opens_and_closes() {
        let generator = generator(EventBus::new(), Duration::from_secs(5));
        let frames = generator.start(request("req-1", Vec::new())).unwrap().collect().await;
        assert_eq!(
            types(&frames),
            vec![
                FrameType::RunStarted,
                FrameType::StateDelta,
                FrameType::RunFinished
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_live_request_id_rejected() {
        let generator = generator(EventBus::new(), Duration::from_secs(30));
        let hanging = || -> Vec<Arc<dyn SpecialistAgent>> {
            vec![Arc::new(HangingAgent {
                name: "quant_agent".to_string(),
                released: Arc::new(AtomicBool::new(false)),
            })]
        };

        let first = generator.start(request("req-1", hanging())).unwrap();
        assert!(generator.is_live("req-1"));

        let second = generator.start(request("req-1", hanging()));
        assert!(matches!(second, Err(PipelineError::RunInProgress(id)) if id == "req-1"));
        generator
            .start(request("req-2", Vec::new()))
            .unwrap()
            .collect()
            .await;

        first.cancel();
        let frames = first.collect().await;
        assert_eq!(frames.last().unwrap().frame_type, FrameType::Error);
        assert!(!generator.is_live("req-1"));

        let again = generator
            .start(request("req-1", Vec::new()))
            .unwrap()
            .collect()
            .await;
        assert_eq!(again.last().unwrap().frame_type, FrameType::RunFinished);
    }
}
