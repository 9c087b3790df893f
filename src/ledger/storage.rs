//! Durable storage backends for ledger entries
//!
//! Entries are stored one canonical JSON object per line, one file per epoch
//! segment (`segment-000000.jsonl`, `segment-000001.jsonl`, ...).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::canonical::Canonicalizer;
use crate::error::PipelineError;
use crate::models::AuditEntry;
use crate::Result;

/// One line of the ledger as found in storage.
#[derive(Debug, Clone)]
pub enum LedgerRecord {
    Entry(AuditEntry),
    /// A line that no longer parses as an entry.
    Unreadable {
        segment: u64,
        line: usize,
        error: String,
    },
}

impl LedgerRecord {
    pub fn entry(&self) -> Option<&AuditEntry> {
        match self {
            LedgerRecord::Entry(entry) => Some(entry),
            LedgerRecord::Unreadable { .. } => None,
        }
    }
}

/// Append-only storage for ledger entries.
///
/// `write` must not return before the entry is durable. A failed `write`
/// must leave no partial record behind.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Direct subsequent writes to the segment of `epoch`. Idempotent.
    async fn begin_segment(&self, epoch: u64) -> Result<()>;

    /// Remove the segment of `epoch`, which must hold no committed record,
    /// and direct subsequent writes back to the segment of `resume_epoch`.
    async fn abandon_segment(&self, epoch: u64, resume_epoch: u64) -> Result<()>;

    async fn write(&self, entry: &AuditEntry) -> Result<()>;

    /// Every committed record, segments in epoch order.
    async fn read_all(&self) -> Result<Vec<LedgerRecord>>;
}

/// Serialize an entry as a single canonical JSONL line.
pub fn encode_line(entry: &AuditEntry) -> Result<Vec<u8>> {
    let mut line = Canonicalizer::permissive().canonicalize_serializable(entry)?;
    line.push(b'\n');
    Ok(line)
}

fn decode_lines(segment: u64, bytes: &[u8], records: &mut Vec<LedgerRecord>) {
    for (index, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        if raw.is_empty() {
            continue;
        }
        let parsed = std::str::from_utf8(raw)
            .map_err(|e| e.to_string())
            .and_then(|line| serde_json::from_str::<AuditEntry>(line).map_err(|e| e.to_string()));
        records.push(match parsed {
            Ok(entry) => LedgerRecord::Entry(entry),
            Err(error) => LedgerRecord::Unreadable {
                segment,
                line: index + 1,
                error,
            },
        });
    }
}

//
// ================= JSONL files =================
//

struct SegmentWriter {
    epoch: u64,
    file: File,
    /// Bytes known to be durable.
    committed_len: u64,
    /// The file ends in an unterminated line left by an interrupted write.
    torn_tail: bool,
}

pub struct JsonlLedgerStore {
    dir: PathBuf,
    writer: Mutex<Option<SegmentWriter>>,
}

impl JsonlLedgerStore {
    /// Open a ledger directory, attaching to its newest segment if any.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let store = Self {
            dir,
            writer: Mutex::new(None),
        };

        if let Some((epoch, _)) = store.segments().await?.pop() {
            let writer = store.open_writer(epoch).await?;
            info!(
                "Attached to ledger segment {} ({} bytes)",
                epoch, writer.committed_len
            );
            *store.writer.lock().await = Some(writer);
        }

        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_path(&self, epoch: u64) -> PathBuf {
        self.dir.join(format!("segment-{:06}.jsonl", epoch))
    }

    /// Existing segment files sorted by epoch.
    pub async fn segments(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(epoch) = name
                .to_str()
                .and_then(|n| n.strip_prefix("segment-"))
                .and_then(|n| n.strip_suffix(".jsonl"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            segments.push((epoch, entry.path()));
        }
        segments.sort_by_key(|(epoch, _)| *epoch);
        Ok(segments)
    }

    async fn open_writer(&self, epoch: u64) -> Result<SegmentWriter> {
        let path = self.segment_path(epoch);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        // Only newline-terminated lines were committed.
        let bytes = fs::read(&path).await?;
        let committed_len = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |newline| newline + 1) as u64;
        let torn_tail = committed_len < bytes.len() as u64;
        if torn_tail {
            warn!(
                "Ignoring {} uncommitted bytes at the end of ledger segment {}",
                bytes.len() as u64 - committed_len,
                epoch
            );
        }

        Ok(SegmentWriter {
            epoch,
            file,
            committed_len,
            torn_tail,
        })
    }
}

#[async_trait]
impl LedgerStore for JsonlLedgerStore {
    async fn begin_segment(&self, epoch: u64) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.as_ref().is_some_and(|w| w.epoch == epoch) {
            return Ok(());
        }
        *writer = Some(self.open_writer(epoch).await?);
        Ok(())
    }

    async fn abandon_segment(&self, epoch: u64, resume_epoch: u64) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(active) = writer.as_ref().filter(|w| w.epoch == epoch) {
            if active.committed_len > 0 {
                return Err(PipelineError::LedgerWrite(format!(
                    "segment {} already holds committed entries",
                    epoch
                )));
            }
            *writer = None;
            match fs::remove_file(self.segment_path(epoch)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if writer.as_ref().map(|w| w.epoch) != Some(resume_epoch) {
            *writer = Some(self.open_writer(resume_epoch).await?);
        }
        Ok(())
    }

    async fn write(&self, entry: &AuditEntry) -> Result<()> {
        let line = encode_line(entry)?;

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| PipelineError::LedgerWrite("no open ledger segment".to_string()))?;

        if writer.torn_tail {
            writer.file.set_len(writer.committed_len).await.map_err(|e| {
                PipelineError::LedgerWrite(format!("discarding torn segment tail: {}", e))
            })?;
            writer.torn_tail = false;
        }

        let written = async {
            writer.file.write_all(&line).await?;
            writer.file.flush().await?;
            writer.file.sync_data().await
        }
        .await;

        match written {
            Ok(()) => {
                writer.committed_len += line.len() as u64;
                Ok(())
            }
            Err(error) => {
                // Drop whatever part of the line reached the file.
                if let Err(truncate_error) = writer.file.set_len(writer.committed_len).await {
                    warn!(
                        "Failed to roll back partial ledger write at sequence {}: {}",
                        entry.sequence_no, truncate_error
                    );
                }
                Err(PipelineError::LedgerWrite(format!(
                    "sequence {}: {}",
                    entry.sequence_no, error
                )))
            }
        }
    }

    async fn read_all(&self) -> Result<Vec<LedgerRecord>> {
        // Bytes past the committed length of the active segment belong to a
        // write still in flight.
        let active = self
            .writer
            .lock()
            .await
            .as_ref()
            .map(|w| (w.epoch, w.committed_len));

        let segments = self.segments().await?;
        let newest = segments.last().map(|(epoch, _)| *epoch);

        let mut records = Vec::new();
        for (epoch, path) in segments {
            let mut bytes = fs::read(&path).await?;
            match active {
                Some((active_epoch, committed_len)) if active_epoch == epoch => {
                    if (bytes.len() as u64) > committed_len {
                        bytes.truncate(committed_len as usize);
                    }
                }
                // An unterminated last line of the newest segment was never committed.
                _ if Some(epoch) == newest => {
                    let committed = bytes
                        .iter()
                        .rposition(|b| *b == b'\n')
                        .map_or(0, |newline| newline + 1);
                    bytes.truncate(committed);
                }
                _ => {}
            }
            decode_lines(epoch, &bytes, &mut records);
        }
        Ok(records)
    }
}

//
// ================= In-memory =================
//

/// Volatile store for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    segments: RwLock<Vec<(u64, Vec<AuditEntry>)>>,
    failures_remaining: AtomicU32,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail, as an unavailable disk would.
    pub fn fail_next_writes(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.segments
            .read()
            .await
            .iter()
            .map(|(_, entries)| entries.len())
            .sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sequence numbers held by each segment, in segment order.
    #[cfg(test)]
    pub(crate) async fn segment_layout(&self) -> Vec<(u64, Vec<u64>)> {
        self.segments
            .read()
            .await
            .iter()
            .map(|(epoch, entries)| (*epoch, entries.iter().map(|e| e.sequence_no).collect()))
            .collect()
    }

    /// Rewrite a stored entry in place, bypassing the chain.
    #[cfg(test)]
    pub(crate) async fn tamper<F>(&self, sequence_no: u64, edit: F) -> bool
    where
        F: FnOnce(&mut AuditEntry),
    {
        let mut segments = self.segments.write().await;
        let target = segments
            .iter_mut()
            .flat_map(|(_, entries)| entries.iter_mut())
            .find(|entry| entry.sequence_no == sequence_no);
        match target {
            Some(entry) => {
                edit(entry);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin_segment(&self, epoch: u64) -> Result<()> {
        let mut segments = self.segments.write().await;
        if segments.last().map(|(e, _)| *e) != Some(epoch) {
            segments.push((epoch, Vec::new()));
        }
        Ok(())
    }

    async fn abandon_segment(&self, epoch: u64, resume_epoch: u64) -> Result<()> {
        let mut segments = self.segments.write().await;
        if let Some((last, entries)) = segments.last() {
            if *last == epoch {
                if !entries.is_empty() {
                    return Err(PipelineError::LedgerWrite(format!(
                        "segment {} already holds committed entries",
                        epoch
                    )));
                }
                segments.pop();
            }
        }
        if segments.last().map(|(e, _)| *e) != Some(resume_epoch) {
            segments.push((resume_epoch, Vec::new()));
        }
        Ok(())
    }

    async fn write(&self, entry: &AuditEntry) -> Result<()> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PipelineError::LedgerWrite(format!(
                "sequence {}: simulated storage failure",
                entry.sequence_no
            )));
        }

        let mut segments = self.segments.write().await;
        match segments.last_mut() {
            Some((_, entries)) => {
                entries.push(entry.clone());
                Ok(())
            }
            None => Err(PipelineError::LedgerWrite(
                "no open ledger segment".to_string(),
            )),
        }
    }

    async fn read_all(&self) -> Result<Vec<LedgerRecord>> {
        Ok(self
            .segments
            .read()
            .await
            .iter()
            .flat_map(|(_, entries)| entries.iter().cloned().map(LedgerRecord::Entry))
            .collect())
    }
}
