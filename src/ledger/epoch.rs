//! Epoch sealing and the pluggable signer seam

use serde::{Deserialize, Serialize};

use crate::canonical::Canonicalizer;
use crate::ledger::chain_hash;
use crate::Result;

/// Signs epoch seal hashes. The scheme is left to the deployment.
pub trait Signer: Send + Sync {
    fn key_id(&self) -> &str;

    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>>;

    fn verify(&self, digest: &[u8], signature: &[u8]) -> bool;
}

/// Seals epochs by hash linkage only; produces empty signatures.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsignedSealer;

impl Signer for UnsignedSealer {
    fn key_id(&self) -> &str {
        "unsigned"
    }

    fn sign(&self, _digest: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn verify(&self, _digest: &[u8], signature: &[u8]) -> bool {
        signature.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RolloverTrigger {
    EntryCount,
    Age,
    KeyRotation,
    Manual,
}

/// Rollover metadata committed to by `epoch_seal_hash`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpochSeal {
    pub epoch: u64,
    pub final_sequence_no: u64,
    pub final_hash: String,
    pub entry_count: u64,
    pub sealed_at: String,
    pub trigger: RolloverTrigger,
    pub key_id: String,
}

impl EpochSeal {
    /// `SHA256(canonical(seal) ++ final_hash bytes)`
    pub fn seal_hash(&self) -> Result<String> {
        let content = Canonicalizer::permissive().canonicalize_serializable(self)?;
        chain_hash(&content, &self.final_hash)
    }
}

/// Payload of the first entry of every segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentGenesis {
    pub epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seal: Option<EpochSeal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}
