//! In-process publish/subscribe for telemetry events
//!
//! Every subscriber owns a bounded queue. When a queue is full the oldest
//! ephemeral event in it is dropped; audit-critical events are never dropped
//! and may push a queue past its capacity. Audit-critical events reach the
//! audit sink before any subscriber sees them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::models::{AgentStatus, AuditClass, Step, TelemetryEvent, TelemetryKind};
use crate::telemetry::{AuditPolicy, AuditSink, FailureMode, TelemetryStore};
use crate::Result;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

type Predicate = Box<dyn Fn(&TelemetryEvent) -> bool + Send + Sync>;

struct SubscriberSlot {
    id: u64,
    predicate: Predicate,
    queue: Mutex<VecDeque<TelemetryEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberSlot {
    fn push(&self, event: TelemetryEvent, capacity: usize) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= capacity {
            let oldest_ephemeral = queue
                .iter()
                .position(|queued| !queued.audit_class.is_audit_critical());
            match oldest_ephemeral {
                Some(position) => {
                    queue.remove(position);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                None if !event.audit_class.is_audit_critical() => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                None => {}
            }
        }

        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<TelemetryEvent> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

struct BusInner {
    subscribers: RwLock<Vec<Arc<SubscriberSlot>>>,
    next_subscriber_id: AtomicU64,
    capacity: usize,
    audit_sink: Option<Arc<dyn AuditSink>>,
    audit_policy: AuditPolicy,
    store: Option<Arc<dyn TelemetryStore>>,
    degraded: AtomicBool,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        let subscribers = self
            .subscribers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for slot in subscribers.iter() {
            slot.closed.store(true, Ordering::SeqCst);
            slot.notify.notify_one();
        }
    }
}

pub struct EventBusBuilder {
    capacity: usize,
    audit_sink: Option<Arc<dyn AuditSink>>,
    audit_policy: AuditPolicy,
    store: Option<Arc<dyn TelemetryStore>>,
}

impl EventBusBuilder {
    /// Per-subscriber queue capacity.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>, policy: AuditPolicy) -> Self {
        self.audit_sink = Some(sink);
        self.audit_policy = policy;
        self
    }

    /// Persist every delivered event for trace reconstruction.
    pub fn persist_to(mut self, store: Arc<dyn TelemetryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> EventBus {
        EventBus {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(1),
                capacity: self.capacity,
                audit_sink: self.audit_sink,
                audit_policy: self.audit_policy,
                store: self.store,
                degraded: AtomicBool::new(false),
            }),
        }
    }
}

/// Cloneable handle to a shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder {
            capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            audit_sink: None,
            audit_policy: AuditPolicy::default(),
            store: None,
        }
    }

    /// Bus with no audit sink and no persistence.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Publish an event to the audit sink, the store and every matching
    /// subscriber. Returns the number of subscribers it was queued for.
    ///
    /// Fails when the audit sink rejects the payload, or when the sink is
    /// unavailable and the event's class is configured to block. A refused
    /// terminal event is still persisted so the run's trace can close, but
    /// it is never delivered.
    pub async fn publish(&self, event: TelemetryEvent) -> Result<usize> {
        if event.audit_class.is_audit_critical() {
            if let Err(e) = self.record_audit(&event).await {
                if event.kind.is_terminal() {
                    self.persist(&event).await;
                }
                return Err(e);
            }
        }

        self.persist(&event).await;
        Ok(self.fan_out(event))
    }

    async fn persist(&self, event: &TelemetryEvent) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.append(event).await {
                warn!(
                    "Failed to persist telemetry event {} for {}: {}",
                    event.event_id, event.correlation_id, e
                );
            }
        }
    }

    async fn record_audit(&self, event: &TelemetryEvent) -> Result<()> {
        let Some(sink) = &self.inner.audit_sink else {
            return Ok(());
        };

        match sink.record(event).await {
            Ok(()) => {
                if self.inner.degraded.swap(false, Ordering::SeqCst) {
                    info!("Audit recording restored");
                }
                Ok(())
            }
            Err(PipelineError::Canonicalization(e)) => {
                warn!(
                    "Rejected {} event from {}: {}",
                    event.kind.as_str(),
                    event.agent_name,
                    e
                );
                Err(PipelineError::Canonicalization(e))
            }
            Err(e) => match self.inner.audit_policy.mode_for(event.audit_class) {
                FailureMode::Block => {
                    error!(
                        "Blocked {:?} event for {}: {}",
                        event.audit_class, event.correlation_id, e
                    );
                    Err(e)
                }
                FailureMode::Degrade => {
                    if !self.inner.degraded.swap(true, Ordering::SeqCst) {
                        warn!("Audit recording degraded, delivering unrecorded events: {}", e);
                    }
                    Ok(())
                }
            },
        }
    }

    fn fan_out(&self, event: TelemetryEvent) -> usize {
        let subscribers: Vec<Arc<SubscriberSlot>> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|slot| (slot.predicate)(&event))
            .cloned()
            .collect();

        for slot in &subscribers {
            slot.push(event.clone(), self.inner.capacity);
        }
        subscribers.len()
    }

    /// Publish an agent status update.
    ///
    /// Ready and error statuses are recorded to the audit ledger; started and
    /// working updates are ephemeral.
    pub async fn emit(
        &self,
        correlation_id: &str,
        agent_name: &str,
        status: AgentStatus,
        step: Option<Step>,
    ) -> Result<usize> {
        let audit_class = match status {
            AgentStatus::Ready | AgentStatus::Error => AuditClass::Informational,
            AgentStatus::Started | AgentStatus::Working => AuditClass::Ephemeral,
        };
        self.emit_classified(correlation_id, agent_name, status, step, audit_class)
            .await
    }

    pub async fn emit_classified(
        &self,
        correlation_id: &str,
        agent_name: &str,
        status: AgentStatus,
        step: Option<Step>,
        audit_class: AuditClass,
    ) -> Result<usize> {
        let event = TelemetryEvent::new(
            correlation_id,
            agent_name,
            status,
            TelemetryKind::Progress,
            step,
            audit_class,
        );
        self.publish(event).await
    }

    /// Register a subscriber receiving every later event matching `predicate`.
    pub fn subscribe<F>(&self, predicate: F) -> Subscription
    where
        F: Fn(&TelemetryEvent) -> bool + Send + Sync + 'static,
    {
        let slot = Arc::new(SubscriberSlot {
            id: self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed),
            predicate: Box::new(predicate),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot.clone());
        debug!("Telemetry subscriber {} registered", slot.id);

        Subscription {
            slot,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to one request's events.
    pub fn subscribe_correlation(&self, correlation_id: impl Into<String>) -> Subscription {
        let correlation_id = correlation_id.into();
        self.subscribe(move |event| event.correlation_id == correlation_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True after an audit failure was tolerated and before the next success.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a subscription. Unsubscribes when dropped.
pub struct Subscription {
    slot: Arc<SubscriberSlot>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Next event in publish order; `None` once the bus is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<TelemetryEvent> {
        loop {
            if let Some(event) = self.slot.pop() {
                return Some(event);
            }
            if self.slot.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.slot.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<TelemetryEvent> {
        self.slot.pop()
    }

    /// Events dropped from this subscriber's queue because it was full.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|slot| slot.id != self.slot.id);
        }
    }
}
