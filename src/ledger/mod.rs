//! Append-only, hash-chained audit ledger
//!
//! Every entry commits to its predecessor:
//!
//! ```text
//! this_hash = SHA256(canonical({event_type, payload, sequence_no, timestamp}) ++ prev_hash)
//! ```
//!
//! where `prev_hash` is taken as raw bytes and the first entry links to
//! [`AuditEntry::GENESIS_HASH`]. Appends are serialized through a single
//! writer; the tip only advances after the entry is durable.

pub mod epoch;
pub mod storage;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::value::RawValue;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::canonical::Canonicalizer;
use crate::error::PipelineError;
use crate::models::{AuditEntry, TipCommitment};
use crate::Result;

pub use epoch::{EpochSeal, RolloverTrigger, SegmentGenesis, Signer, UnsignedSealer};
pub use storage::{InMemoryLedgerStore, JsonlLedgerStore, LedgerRecord, LedgerStore};

/// `event_type` of entry 0.
pub const LEDGER_GENESIS_EVENT: &str = "ledger.genesis";

/// `event_type` of the first entry of every later epoch.
pub const EPOCH_GENESIS_EVENT: &str = "epoch.genesis";

//
// ================= Hashing =================
//

/// Timestamps are hashed at microsecond precision in RFC 3339 form.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// `SHA256(content ++ prev_hash bytes)`, hex encoded.
pub fn chain_hash(content: &[u8], prev_hash: &str) -> Result<String> {
    let prev = hex::decode(prev_hash)
        .ok()
        .filter(|bytes| bytes.len() == 32)
        .ok_or_else(|| PipelineError::LedgerCorrupt(format!("malformed hash: {}", prev_hash)))?;

    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update(&prev);
    Ok(hex::encode(hasher.finalize()))
}

/// Canonical bytes an entry's hash commits to, excluding both hash fields.
pub fn hash_input(
    sequence_no: u64,
    timestamp: &DateTime<Utc>,
    event_type: &str,
    payload: &RawValue,
) -> Result<Vec<u8>> {
    let payload: Value = serde_json::from_str(payload.get())?;
    let body = json!({
        "event_type": event_type,
        "payload": payload,
        "sequence_no": sequence_no,
        "timestamp": format_timestamp(timestamp),
    });
    Ok(Canonicalizer::permissive().canonicalize(&body)?)
}

/// Recompute `this_hash` for a stored entry.
pub fn entry_hash(entry: &AuditEntry) -> Result<String> {
    let content = hash_input(
        entry.sequence_no,
        &entry.timestamp,
        &entry.event_type,
        &entry.payload,
    )?;
    chain_hash(&content, &entry.prev_hash)
}

//
// ================= Configuration =================
//

/// When the active epoch is sealed automatically.
#[derive(Debug, Clone, Default)]
pub struct RolloverPolicy {
    pub max_entries: Option<u64>,
    pub max_age: Option<Duration>,
}

impl RolloverPolicy {
    fn due(&self, state: &LedgerState, now: DateTime<Utc>) -> Option<RolloverTrigger> {
        if self
            .max_entries
            .is_some_and(|max| state.epoch_entries >= max)
        {
            return Some(RolloverTrigger::EntryCount);
        }
        let age = now.signed_duration_since(state.epoch_started_at);
        match (self.max_age, age.to_std()) {
            (Some(max_age), Ok(age)) if state.epoch_entries > 0 && age >= max_age => {
                Some(RolloverTrigger::Age)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Durable write attempts before the ledger reports itself unavailable.
    pub write_attempts: u32,
    /// First retry delay; doubled on every further attempt.
    pub retry_base: Duration,
    pub rollover: RolloverPolicy,
    pub canonicalizer: Canonicalizer,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            retry_base: Duration::from_millis(50),
            rollover: RolloverPolicy::default(),
            canonicalizer: Canonicalizer::new(),
        }
    }
}

//
// ================= Ledger =================
//

struct LedgerState {
    tip_hash: String,
    next_sequence: u64,
    epoch: u64,
    /// Entries in the active epoch after its genesis entry.
    epoch_entries: u64,
    epoch_started_at: DateTime<Utc>,
    signer: Arc<dyn Signer>,
}

impl LedgerState {
    fn tip_sequence(&self) -> u64 {
        self.next_sequence.saturating_sub(1)
    }
}

pub struct HashChainLedger {
    state: Mutex<LedgerState>,
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
    degraded: AtomicBool,
}

impl HashChainLedger {
    /// Open a ledger on `store`, writing the genesis entry if it is empty and
    /// recovering the tip otherwise.
    pub async fn open(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Result<Self> {
        let records = store.read_all().await?;

        let mut state = LedgerState {
            tip_hash: AuditEntry::GENESIS_HASH.to_string(),
            next_sequence: 0,
            epoch: 0,
            epoch_entries: 0,
            epoch_started_at: Utc::now(),
            signer: Arc::new(UnsignedSealer),
        };

        for record in &records {
            let entry = match record {
                LedgerRecord::Entry(entry) => entry,
                LedgerRecord::Unreadable {
                    segment,
                    line,
                    error,
                } => {
                    return Err(PipelineError::LedgerCorrupt(format!(
                        "segment {} line {}: {}",
                        segment, line, error
                    )));
                }
            };
            match entry.event_type.as_str() {
                LEDGER_GENESIS_EVENT | EPOCH_GENESIS_EVENT => {
                    let genesis: SegmentGenesis = serde_json::from_str(entry.payload.get())?;
                    state.epoch = genesis.epoch;
                    state.epoch_entries = 0;
                    state.epoch_started_at = entry.timestamp;
                }
                _ => state.epoch_entries += 1,
            }
            state.tip_hash = entry.this_hash.clone();
            state.next_sequence = entry.sequence_no + 1;
        }

        let ledger = Self {
            state: Mutex::new(state),
            store,
            config,
            degraded: AtomicBool::new(false),
        };

        if records.is_empty() {
            ledger.write_ledger_genesis().await?;
            info!("Initialized new audit ledger");
        } else {
            let state = ledger.state.lock().await;
            // A segment opened by an interrupted rollover may be newer than the open epoch.
            ledger.store.begin_segment(state.epoch).await?;
            info!(
                "Recovered audit ledger at sequence {} (epoch {})",
                state.tip_sequence(),
                state.epoch
            );
        }

        Ok(ledger)
    }

    /// Ledger over a fresh in-memory store.
    pub async fn in_memory() -> Result<Self> {
        Self::open(Arc::new(InMemoryLedgerStore::new()), LedgerConfig::default()).await
    }

    async fn write_ledger_genesis(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.store.begin_segment(0).await?;

        let payload = SegmentGenesis {
            epoch: 0,
            seal: None,
            signature: None,
        };
        let canonical = self.config.canonicalizer.canonicalize_serializable(&payload)?;
        let entry = self.build_entry(
            0,
            AuditEntry::GENESIS_HASH,
            LEDGER_GENESIS_EVENT,
            canonical,
        )?;
        self.commit(&mut state, entry).await?;
        state.epoch_started_at = Utc::now();
        state.epoch_entries = 0;
        Ok(())
    }

    /// Append an event. Returns the entry once it is durable.
    ///
    /// A payload the canonicalizer rejects is never hashed or written. When
    /// every write attempt fails the tip stays where it was and the ledger
    /// enters degraded mode until a later write succeeds.
    pub async fn append(&self, event_type: &str, payload: &Value) -> Result<AuditEntry> {
        let canonical = self.config.canonicalizer.canonicalize(payload)?;

        let mut state = self.state.lock().await;

        if let Some(trigger) = self.config.rollover.due(&state, Utc::now()) {
            self.rollover_locked(&mut state, trigger).await?;
        }

        let entry = self.build_entry(
            state.next_sequence,
            &state.tip_hash,
            event_type,
            canonical,
        )?;
        let entry = self.commit(&mut state, entry).await?;
        state.epoch_entries += 1;

        debug!(
            sequence_no = entry.sequence_no,
            event_type = %entry.event_type,
            "Ledger entry appended"
        );
        Ok(entry)
    }

    fn build_entry(
        &self,
        sequence_no: u64,
        prev_hash: &str,
        event_type: &str,
        canonical_payload: Vec<u8>,
    ) -> Result<AuditEntry> {
        let payload = String::from_utf8(canonical_payload)
            .map_err(|e| PipelineError::LedgerWrite(format!("payload is not UTF-8: {}", e)))?;
        let payload = RawValue::from_string(payload)?;
        let timestamp = Utc::now().trunc_subsecs(6);

        let content = hash_input(sequence_no, &timestamp, event_type, &payload)?;
        let this_hash = chain_hash(&content, prev_hash)?;

        Ok(AuditEntry {
            sequence_no,
            timestamp,
            event_type: event_type.to_string(),
            payload,
            prev_hash: prev_hash.to_string(),
            this_hash,
        })
    }

    /// Write durably, then advance the tip.
    async fn commit(&self, state: &mut LedgerState, entry: AuditEntry) -> Result<AuditEntry> {
        self.write_with_retry(&entry).await?;
        state.tip_hash = entry.this_hash.clone();
        state.next_sequence = entry.sequence_no + 1;
        Ok(entry)
    }

    async fn write_with_retry(&self, entry: &AuditEntry) -> Result<()> {
        let attempts = self.config.write_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.store.write(entry).await {
                Ok(()) => {
                    if self.degraded.swap(false, Ordering::SeqCst) {
                        info!("Audit ledger writable again at sequence {}", entry.sequence_no);
                    }
                    return Ok(());
                }
                Err(error) => {
                    warn!(
                        "Ledger write attempt {}/{} failed for sequence {}: {}",
                        attempt, attempts, entry.sequence_no, error
                    );
                    last_error = Some(error);
                    if attempt < attempts {
                        let backoff = self.config.retry_base * 2u32.saturating_pow(attempt - 1);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        self.degraded.store(true, Ordering::SeqCst);
        error!(
            "Audit ledger unavailable: sequence {} not written after {} attempts",
            entry.sequence_no, attempts
        );
        Err(PipelineError::AuditUnavailable(format!(
            "sequence {} not written after {} attempts: {}",
            entry.sequence_no,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Seal the active epoch and open the next segment.
    pub async fn rollover(&self, trigger: RolloverTrigger) -> Result<EpochSeal> {
        let mut state = self.state.lock().await;
        self.rollover_locked(&mut state, trigger).await
    }

    /// Seal the active epoch under the current key, then sign later seals
    /// with `signer`.
    pub async fn rotate_signer(&self, signer: Arc<dyn Signer>) -> Result<EpochSeal> {
        let mut state = self.state.lock().await;
        let seal = self
            .rollover_locked(&mut state, RolloverTrigger::KeyRotation)
            .await?;
        info!(
            "Ledger signing key rotated from {} to {}",
            state.signer.key_id(),
            signer.key_id()
        );
        state.signer = signer;
        Ok(seal)
    }

    /// Replace the signer without sealing the active epoch.
    pub async fn set_signer(&self, signer: Arc<dyn Signer>) {
        self.state.lock().await.signer = signer;
    }

    async fn rollover_locked(
        &self,
        state: &mut LedgerState,
        trigger: RolloverTrigger,
    ) -> Result<EpochSeal> {
        let seal = EpochSeal {
            epoch: state.epoch,
            final_sequence_no: state.tip_sequence(),
            final_hash: state.tip_hash.clone(),
            entry_count: state.epoch_entries,
            sealed_at: format_timestamp(&Utc::now()),
            trigger,
            key_id: state.signer.key_id().to_string(),
        };
        let seal_hash = seal.seal_hash()?;
        let digest = hex::decode(&seal_hash)
            .map_err(|e| PipelineError::Signing(format!("seal hash: {}", e)))?;
        let signature = state.signer.sign(&digest)?;

        let next_epoch = state.epoch + 1;
        self.store.begin_segment(next_epoch).await?;

        let genesis = SegmentGenesis {
            epoch: next_epoch,
            seal: Some(seal.clone()),
            signature: Some(hex::encode(signature)),
        };
        let canonical = self.config.canonicalizer.canonicalize_serializable(&genesis)?;
        let entry = self.build_entry(
            state.next_sequence,
            &seal_hash,
            EPOCH_GENESIS_EVENT,
            canonical,
        )?;
        let entry = match self.commit(state, entry).await {
            Ok(entry) => entry,
            Err(e) => {
                // The epoch stays open; keep appending to its segment.
                if let Err(abandon_error) =
                    self.store.abandon_segment(next_epoch, state.epoch).await
                {
                    error!(
                        "Failed to return to ledger segment {} after a failed rollover: {}",
                        state.epoch, abandon_error
                    );
                }
                return Err(e);
            }
        };

        state.epoch = next_epoch;
        state.epoch_entries = 0;
        state.epoch_started_at = entry.timestamp;

        info!(
            "Sealed ledger epoch {} at sequence {} ({:?}), seal {}",
            seal.epoch, seal.final_sequence_no, trigger, seal_hash
        );
        Ok(seal)
    }

    /// Hash of the newest durable entry.
    pub async fn tip(&self) -> String {
        self.state.lock().await.tip_hash.clone()
    }

    pub async fn tip_commitment(&self) -> TipCommitment {
        let state = self.state.lock().await;
        TipCommitment {
            sequence_no: state.tip_sequence(),
            hash: state.tip_hash.clone(),
            epoch: state.epoch,
        }
    }

    pub async fn epoch(&self) -> u64 {
        self.state.lock().await.epoch
    }

    /// True while the most recent write exhausted its retries.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub async fn entries(&self) -> Result<Vec<LedgerRecord>> {
        self.store.read_all().await
    }

    /// Entries recording telemetry for one request.
    pub async fn entries_for_correlation(&self, correlation_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .store
            .read_all()
            .await?
            .into_iter()
            .filter_map(|record| match record {
                LedgerRecord::Entry(entry) => Some(entry),
                LedgerRecord::Unreadable { .. } => None,
            })
            .filter(|entry| {
                entry.payload.get().contains(correlation_id)
                    && entry.correlation_id().as_deref() == Some(correlation_id)
            })
            .collect())
    }
}
