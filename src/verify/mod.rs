//! Offline integrity verification of the hash chain
//!
//! Walks a ledger from its first entry, recomputing every hash and checking
//! linkage, sequence continuity and epoch seals. Verification never mutates
//! storage and needs no process state beyond the entries themselves.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::canonical::Canonicalizer;
use crate::ledger::{
    entry_hash, HashChainLedger, LedgerRecord, LedgerStore, SegmentGenesis, Signer,
    EPOCH_GENESIS_EVENT, LEDGER_GENESIS_EVENT,
};
use crate::models::{AuditEntry, TipCommitment};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub ok: bool,
    /// Sequence number of the first entry that fails a check.
    pub first_bad_sequence: Option<u64>,
    pub entries_checked: u64,
    /// Epochs seen, counting the active one.
    pub epochs: u64,
    pub reason: Option<String>,
}

impl VerificationReport {
    /// `(ok, first_bad_sequence)`
    pub fn outcome(&self) -> (bool, Option<u64>) {
        (self.ok, self.first_bad_sequence)
    }

    fn fail(mut self, sequence_no: u64, reason: impl Into<String>) -> Self {
        self.ok = false;
        self.first_bad_sequence = Some(sequence_no);
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Default)]
pub struct IntegrityVerifier {
    signers: HashMap<String, Arc<dyn Signer>>,
}

impl IntegrityVerifier {
    /// Verifier that checks hash linkage only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also check seal signatures made under `signer`'s key id.
    ///
    /// Once any signer is registered, seals under unknown key ids fail.
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signers.insert(signer.key_id().to_string(), signer);
        self
    }

    pub async fn verify(&self, ledger: &HashChainLedger) -> Result<VerificationReport> {
        Ok(self.verify_records(&ledger.entries().await?))
    }

    pub async fn verify_store(&self, store: &dyn LedgerStore) -> Result<VerificationReport> {
        Ok(self.verify_records(&store.read_all().await?))
    }

    /// Verify, then check the ledger still reaches an externally published tip.
    pub async fn verify_with_commitment(
        &self,
        store: &dyn LedgerStore,
        commitment: &TipCommitment,
    ) -> Result<VerificationReport> {
        let records = store.read_all().await?;
        Ok(self.check_commitment(&records, commitment))
    }

    pub fn check_commitment(
        &self,
        records: &[LedgerRecord],
        commitment: &TipCommitment,
    ) -> VerificationReport {
        let report = self.verify_records(records);
        if !report.ok {
            return report;
        }

        let committed = records
            .iter()
            .filter_map(LedgerRecord::entry)
            .find(|entry| entry.sequence_no == commitment.sequence_no);

        match committed {
            None => report.fail(
                commitment.sequence_no,
                "ledger ends before the committed tip",
            ),
            Some(entry) if entry.this_hash != commitment.hash => report.fail(
                commitment.sequence_no,
                "entry hash differs from the committed tip",
            ),
            Some(_) => report,
        }
    }

    pub fn verify_records(&self, records: &[LedgerRecord]) -> VerificationReport {
        let mut report = VerificationReport {
            ok: true,
            first_bad_sequence: None,
            entries_checked: 0,
            epochs: 0,
            reason: None,
        };
        let mut expected_prev = AuditEntry::GENESIS_HASH.to_string();
        let mut epoch = 0u64;

        for (index, record) in records.iter().enumerate() {
            let expected_seq = index as u64;
            let entry = match record {
                LedgerRecord::Entry(entry) => entry,
                LedgerRecord::Unreadable {
                    segment,
                    line,
                    error,
                } => {
                    return report.fail(
                        expected_seq,
                        format!("segment {} line {} unreadable: {}", segment, line, error),
                    );
                }
            };

            if let Err(reason) = self.check_entry(entry, expected_seq, &expected_prev, epoch) {
                return report.fail(expected_seq, reason);
            }

            if entry.event_type == EPOCH_GENESIS_EVENT || expected_seq == 0 {
                report.epochs += 1;
                if expected_seq > 0 {
                    epoch += 1;
                }
            }
            report.entries_checked += 1;
            expected_prev = entry.this_hash.clone();
        }

        report
    }

    fn check_entry(
        &self,
        entry: &AuditEntry,
        expected_seq: u64,
        expected_prev: &str,
        epoch: u64,
    ) -> std::result::Result<(), String> {
        if entry.sequence_no != expected_seq {
            return Err(format!(
                "expected sequence {}, found {}",
                expected_seq, entry.sequence_no
            ));
        }

        if expected_seq == 0 && entry.event_type != LEDGER_GENESIS_EVENT {
            return Err("first entry is not a ledger genesis".to_string());
        }

        if entry.event_type == EPOCH_GENESIS_EVENT {
            self.check_seal(entry, expected_seq, expected_prev, epoch)?;
        } else if entry.prev_hash != expected_prev {
            return Err("prev_hash does not match the preceding entry".to_string());
        }

        if !Canonicalizer::permissive().is_canonical(entry.payload.get().as_bytes()) {
            return Err("payload is not canonical JSON".to_string());
        }

        match entry_hash(entry) {
            Ok(hash) if hash == entry.this_hash => Ok(()),
            Ok(_) => Err("this_hash does not match recomputed hash".to_string()),
            Err(error) => Err(format!("hash could not be recomputed: {}", error)),
        }
    }

    fn check_seal(
        &self,
        entry: &AuditEntry,
        expected_seq: u64,
        expected_prev: &str,
        epoch: u64,
    ) -> std::result::Result<(), String> {
        let genesis: SegmentGenesis = serde_json::from_str(entry.payload.get())
            .map_err(|e| format!("epoch genesis payload: {}", e))?;
        let seal = genesis
            .seal
            .ok_or_else(|| "epoch genesis carries no seal".to_string())?;

        if seal.epoch != epoch || genesis.epoch != epoch + 1 {
            return Err(format!(
                "epoch genesis out of order: sealed {}, opened {}, expected {}",
                seal.epoch,
                genesis.epoch,
                epoch + 1
            ));
        }
        if seal.final_hash != expected_prev || seal.final_sequence_no + 1 != expected_seq {
            return Err("seal does not commit to the preceding entry".to_string());
        }

        let seal_hash = seal.seal_hash().map_err(|e| e.to_string())?;
        if entry.prev_hash != seal_hash {
            return Err("prev_hash does not match the epoch seal hash".to_string());
        }

        if self.signers.is_empty() {
            return Ok(());
        }
        let signer = self
            .signers
            .get(&seal.key_id)
            .ok_or_else(|| format!("seal signed by unknown key {}", seal.key_id))?;
        let signature = hex::decode(genesis.signature.unwrap_or_default())
            .map_err(|e| format!("seal signature: {}", e))?;
        let digest = hex::decode(&seal_hash).map_err(|e| e.to_string())?;
        if !signer.verify(&digest, &signature) {
            return Err("seal signature does not verify".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::epoch::testing::KeyedTestSigner;
    use crate::ledger::{InMemoryLedgerStore, JsonlLedgerStore, LedgerConfig, RolloverTrigger};
    use serde_json::json;
    use serde_json::value::RawValue;

    async fn ledger_with(store: Arc<InMemoryLedgerStore>) -> HashChainLedger {
        HashChainLedger::open(store, LedgerConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_untampered_ledger_verifies() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let ledger = ledger_with(store.clone()).await;
        for n in 0..50 {
            ledger
                .append("tick", &json!({"n": n, "price": "1.25"}))
                .await
                .unwrap();
        }

        let report = IntegrityVerifier::new().verify(&ledger).await.unwrap();
        assert_eq!(report.outcome(), (true, None));
        assert_eq!(report.entries_checked, 51);
        assert_eq!(report.epochs, 1);
    }

    #[tokio::test]
    async fn test_tampered_payload_detected_at_entry() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let ledger = ledger_with(store.clone()).await;
        ledger.append("E1", &json!({"qty": "1"})).await.unwrap();
        ledger.append("E2", &json!({"qty": "2"})).await.unwrap();
        ledger.append("E3", &json!({"qty": "3"})).await.unwrap();

        assert!(
            store
                .tamper(2, |entry| {
                    entry.payload = RawValue::from_string(r#"{"qty":"20"}"#.to_string()).unwrap();
                })
                .await
        );

        let report = IntegrityVerifier::new().verify(&ledger).await.unwrap();
        assert_eq!(report.outcome(), (false, Some(2)));
    }

    #[tokio::test]
    async fn test_removed_entry_detected() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let ledger = ledger_with(store.clone()).await;
        for n in 0..4 {
            ledger.append("tick", &json!({"n": n})).await.unwrap();
        }

        let mut records = store.read_all().await.unwrap();
        records.remove(2);

        let report = IntegrityVerifier::new().verify_records(&records);
        assert_eq!(report.outcome(), (false, Some(2)));
    }

    #[tokio::test]
    async fn test_non_canonical_payload_detected() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let ledger = ledger_with(store.clone()).await;
        ledger.append("tick", &json!({"a": 1, "b": 2})).await.unwrap();

        store
            .tamper(1, |entry| {
                entry.payload = RawValue::from_string(r#"{"b":2,"a":1}"#.to_string()).unwrap();
            })
            .await;

        let report = IntegrityVerifier::new().verify(&ledger).await.unwrap();
        assert_eq!(report.outcome(), (false, Some(1)));
        assert_eq!(report.reason.as_deref(), Some("payload is not canonical JSON"));
    }

    #[tokio::test]
    async fn test_rewritten_chain_caught_by_commitment() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let ledger = ledger_with(store.clone()).await;
        ledger.append("tick", &json!({"n": 1})).await.unwrap();
        ledger.append("tick", &json!({"n": 2})).await.unwrap();
        let commitment = ledger.tip_commitment().await;

        // A truncated chain is internally consistent but stops short of the published tip.
        let mut records = store.read_all().await.unwrap();
        records.truncate(2);
        let verifier = IntegrityVerifier::new();
        assert!(verifier.verify_records(&records).ok);

        let report = verifier.check_commitment(&records, &commitment);
        assert_eq!(report.outcome(), (false, Some(2)));

        let report = verifier
            .verify_with_commitment(store.as_ref(), &commitment)
            .await
            .unwrap();
        assert!(report.ok);
    }

    #[tokio::test]
    async fn test_epochs_verify_across_rollover() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let ledger = ledger_with(store.clone()).await;
        ledger.append("tick", &json!({"n": 1})).await.unwrap();
        ledger.rollover(RolloverTrigger::Manual).await.unwrap();
        ledger.append("tick", &json!({"n": 2})).await.unwrap();
        ledger.rollover(RolloverTrigger::Manual).await.unwrap();

        let report = IntegrityVerifier::new().verify(&ledger).await.unwrap();
        assert!(report.ok, "{:?}", report.reason);
        assert_eq!(report.epochs, 3);
    }

    #[tokio::test]
    async fn test_tampered_seal_detected() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let ledger = ledger_with(store.clone()).await;
        ledger.append("tick", &json!({"n": 1})).await.unwrap();
        ledger.rollover(RolloverTrigger::Manual).await.unwrap();

        store
            .tamper(1, |entry| {
                entry.payload = RawValue::from_string(r#"{"n":9}"#.to_string()).unwrap();
            })
            .await;

        let report = IntegrityVerifier::new().verify(&ledger).await.unwrap();
        assert_eq!(report.outcome(), (false, Some(1)));
    }

    #[tokio::test]
    async fn test_seal_signatures_checked() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let ledger = ledger_with(store.clone()).await;
        let signer: Arc<dyn Signer> = Arc::new(KeyedTestSigner::new("k1", b"secret"));
        ledger.set_signer(signer.clone()).await;
        ledger.append("tick", &json!({"n": 1})).await.unwrap();
        ledger.rollover(RolloverTrigger::Manual).await.unwrap();

        let trusted = IntegrityVerifier::new().with_signer(signer);
        assert!(trusted.verify(&ledger).await.unwrap().ok);

        let impostor = IntegrityVerifier::new()
            .with_signer(Arc::new(KeyedTestSigner::new("k1", b"other")));
        assert_eq!(
            impostor.verify(&ledger).await.unwrap().outcome(),
            (false, Some(2))
        );
    }

    #[tokio::test]
    async fn test_tampered_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Arc::new(JsonlLedgerStore::open(dir.path()).await.unwrap());
            let ledger = HashChainLedger::open(store, LedgerConfig::default())
                .await
                .unwrap();
            ledger.append("E1", &json!({"amount": "111.25"})).await.unwrap();
            ledger.append("E2", &json!({"amount": "777.25"})).await.unwrap();
            ledger.append("E3", &json!({"amount": "333.25"})).await.unwrap();
        }

        let path = dir.path().join("segment-000000.jsonl");
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.replace("777.25", "778.25")).unwrap();

        let store = JsonlLedgerStore::open(dir.path()).await.unwrap();
        let report = IntegrityVerifier::new().verify_store(&store).await.unwrap();
        assert_eq!(report.outcome(), (false, Some(2)));
    }

    #[tokio::test]
    async fn test_empty_ledger_is_intact() {
        let report = IntegrityVerifier::new().verify_records(&[]);
        assert_eq!(report.outcome(), (true, None));
        assert_eq!(report.entries_checked, 0);
    }
}
