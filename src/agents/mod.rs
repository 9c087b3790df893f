//! Specialist agent trait and registry
//!
//! Agents do their work inside a run step and report progress through the
//! [`AgentContext`] they are handed. Remote agents call a specialist service
//! over HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::debug;

use crate::error::PipelineError;
use crate::models::{AgentStatus, AuditClass, Step, TelemetryEvent, TelemetryKind};
use crate::telemetry::EventBus;
use crate::Result;

/// Result of one agent step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub summary: Value,
}

impl StepOutcome {
    pub fn new(summary: Value) -> Self {
        Self { summary }
    }
}

#[async_trait::async_trait]
pub trait SpecialistAgent: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: AgentContext) -> Result<StepOutcome>;
}

/// Resolves once `stop` reads true. Never resolves if the sender is gone
/// without having signalled.
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Everything an agent may touch while running one step of one request.
#[derive(Clone)]
pub struct AgentContext {
    bus: EventBus,
    correlation_id: String,
    agent_name: String,
    input: Value,
    stop: watch::Receiver<bool>,
}

impl AgentContext {
    pub fn new(
        bus: EventBus,
        correlation_id: impl Into<String>,
        agent_name: impl Into<String>,
        input: Value,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bus,
            correlation_id: correlation_id.into(),
            agent_name: agent_name.into(),
            input,
            stop,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Report a status change for this agent.
    pub async fn emit(&self, status: AgentStatus, step: Option<Step>) -> Result<()> {
        self.bus
            .emit(&self.correlation_id, &self.agent_name, status, step)
            .await
            .map(|_| ())
    }

    pub async fn emit_classified(
        &self,
        status: AgentStatus,
        step: Option<Step>,
        audit_class: AuditClass,
    ) -> Result<()> {
        self.bus
            .emit_classified(&self.correlation_id, &self.agent_name, status, step, audit_class)
            .await
            .map(|_| ())
    }

    /// Stream one token of generated output.
    pub async fn token(&self, text: impl Into<String>) -> Result<()> {
        let event = TelemetryEvent::new(
            self.correlation_id.clone(),
            self.agent_name.clone(),
            AgentStatus::Working,
            TelemetryKind::Token,
            Some(Step::new("token", json!({ "text": text.into() }))),
            AuditClass::Ephemeral,
        );
        self.bus.publish(event).await.map(|_| ())
    }

    /// True once the run was cancelled or the step timed out.
    pub fn is_cancelled(&self) -> bool {
        *self.stop.borrow()
    }

    pub async fn cancelled(&self) {
        let mut stop = self.stop.clone();
        wait_for_stop(&mut stop).await;
    }
}

/// Agent registry keyed by agent name
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn SpecialistAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    pub fn register(&mut self, agent: Arc<dyn SpecialistAgent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SpecialistAgent>> {
        self.agents.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Look up agents in the order given.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn SpecialistAgent>>> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| PipelineError::UnknownAgent(name.clone()))
            })
            .collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Remote agents =================
//

#[derive(Debug, Deserialize)]
struct RemoteRunResponse {
    #[serde(default)]
    tokens: Vec<String>,
    #[serde(default)]
    summary: Value,
}

/// Agent hosted by a specialist service: `POST {base_url}/agents/{name}/run`.
pub struct RemoteAgent {
    name: String,
    client: Client,
    base_url: String,
}

impl RemoteAgent {
    pub fn new(name: impl Into<String>, base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn run_url(&self) -> String {
        format!("{}/agents/{}/run", self.base_url, self.name)
    }
}

#[async_trait::async_trait]
impl SpecialistAgent for RemoteAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: AgentContext) -> Result<StepOutcome> {
        let url = self.run_url();
        ctx.emit(
            AgentStatus::Started,
            Some(Step::new("remote_call", json!({ "url": url }))),
        )
        .await?;

        let request = self
            .client
            .post(&url)
            .json(&json!({
                "correlation_id": ctx.correlation_id(),
                "input": ctx.input(),
            }))
            .send();

        let response = tokio::select! {
            response = request => response.map_err(|e| {
                PipelineError::Agent(format!("{} request failed: {}", self.name, e))
            })?,
            _ = ctx.cancelled() => {
                return Err(PipelineError::Cancelled(format!("{} call abandoned", self.name)));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Agent(format!(
                "{} returned {}: {}",
                self.name, status, body
            )));
        }

        let body: RemoteRunResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Agent(format!("Invalid JSON from {}: {}", self.name, e)))?;
        debug!("{} returned {} tokens", self.name, body.tokens.len());

        for token in body.tokens {
            if ctx.is_cancelled() {
                return Err(PipelineError::Cancelled(self.name.clone()));
            }
            ctx.token(token).await?;
        }

        Ok(StepOutcome::new(body.summary))
    }
}

/// Registry of remote agents served by one specialist service.
pub fn create_remote_registry(
    base_url: &str,
    names: &[String],
    timeout: Duration,
) -> Result<AgentRegistry> {
    let mut registry = AgentRegistry::new();
    for name in names {
        registry.register(Arc::new(RemoteAgent::new(name.clone(), base_url, timeout)?));
    }
    Ok(registry)
}
