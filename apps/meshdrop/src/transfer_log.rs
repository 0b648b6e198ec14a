//! Hash-chained log of fragment transfers.
//!
//! Every placement attempt, rebalance move and local fallback is appended as
//! a signed entry whose `prev_hash` commits to the entry before it. Editing,
//! dropping or reordering a stored entry breaks [`TransferLog::verify_chain`].

use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use ed25519_dalek::{SecretKey, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::distribution::types::{DropId, FragmentHolder, NodeId};
use crate::error::{DropError, DropResult};
use crate::storage::Storage;

/// Outcome of a logged transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferOutcome {
    Success,
    Failure { reason: String },
}

/// A single transfer with hash-chain linking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub dead_drop_id: DropId,
    pub fragment_index: u16,
    /// Previous holder; `None` on first placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_node: Option<NodeId>,
    pub to: FragmentHolder,
    pub outcome: TransferOutcome,
    /// SHA-256 of the previous entry (hex).
    pub prev_hash: String,
    /// Ed25519 signature over the canonical bytes (hex).
    pub signature: String,
}

impl TransferEntry {
    // seq|timestamp|drop|index|from|to|outcome|prev_hash, signature excluded
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&self.seq.to_be_bytes());
        data.extend_from_slice(self.timestamp.to_rfc3339().as_bytes());
        data.extend_from_slice(self.dead_drop_id.as_bytes());
        data.extend_from_slice(&self.fragment_index.to_be_bytes());
        if let Some(ref from) = self.from_node {
            data.extend_from_slice(from.as_bytes());
        }
        data.push(b'|');
        data.extend_from_slice(self.to.to_string().as_bytes());
        data.extend_from_slice(
            serde_json::to_string(&self.outcome)
                .unwrap_or_default()
                .as_bytes(),
        );
        data.extend_from_slice(self.prev_hash.as_bytes());
        data
    }

    /// SHA-256 of this entry, signature included.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        hasher.update(self.signature.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify_signature(&self, verifying_key: &VerifyingKey) -> bool {
        let Ok(signature_bytes) = hex::decode(&self.signature) else {
            return false;
        };

        let Ok(signature) = ed25519_dalek::Signature::from_slice(&signature_bytes) else {
            return false;
        };

        verifying_key
            .verify(&self.canonical_bytes(), &signature)
            .is_ok()
    }
}

/// Genesis hash for the first entry in the chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Signed, append-only transfer log backed by [`Storage`].
pub struct TransferLog {
    storage: Storage,
    signing_key: SigningKey,
    current_seq: AtomicU64,
    /// Serializes appends so the chain never forks.
    append_lock: Mutex<()>,
}

impl TransferLog {
    /// Open the log with a fresh signing key.
    pub fn new(storage: Storage) -> DropResult<Self> {
        let mut secret_key_bytes: SecretKey = [0u8; 32];
        OsRng.fill_bytes(&mut secret_key_bytes);
        Self::with_signing_key(storage, SigningKey::from_bytes(&secret_key_bytes))
    }

    pub fn with_signing_key(storage: Storage, signing_key: SigningKey) -> DropResult<Self> {
        let current_seq = storage.get_latest_transfer_seq()?.unwrap_or(0);

        Ok(Self {
            storage,
            signing_key,
            current_seq: AtomicU64::new(current_seq),
            append_lock: Mutex::new(()),
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Append a transfer. Returns its sequence number.
    pub fn append(
        &self,
        dead_drop_id: DropId,
        fragment_index: u16,
        from_node: Option<NodeId>,
        to: FragmentHolder,
        outcome: TransferOutcome,
    ) -> DropResult<u64> {
        let _append_guard = self
            .append_lock
            .lock()
            .map_err(|_| DropError::Internal("transfer log append lock poisoned".to_string()))?;

        let seq = self.current_seq.load(Ordering::SeqCst) + 1;

        let prev_hash = if seq == 1 {
            GENESIS_HASH.to_string()
        } else {
            self.storage
                .get_transfer_entry(seq - 1)?
                .map(|entry| entry.hash())
                .ok_or_else(|| DropError::Storage(format!("Missing transfer entry {}", seq - 1)))?
        };

        let mut entry = TransferEntry {
            seq,
            timestamp: Utc::now(),
            dead_drop_id,
            fragment_index,
            from_node,
            to,
            outcome,
            prev_hash,
            signature: String::new(),
        };

        let signature = self.signing_key.sign(&entry.canonical_bytes());
        entry.signature = hex::encode(signature.to_bytes());

        self.storage.put_transfer_entry(&entry)?;
        self.current_seq.store(seq, Ordering::SeqCst);

        tracing::debug!(
            seq,
            drop_id = %entry.dead_drop_id,
            fragment = entry.fragment_index,
            to = %entry.to,
            "Transfer entry appended"
        );

        Ok(seq)
    }

    /// Check links and signatures for `start..=end`.
    ///
    /// `Ok(false)` means the chain is broken; `Err` means an entry is missing.
    pub fn verify_chain(&self, start: u64, end: u64) -> DropResult<bool> {
        if start == 0 || start > end {
            return Ok(false);
        }

        let verifying_key = self.verifying_key();
        let mut expected_prev_hash = if start == 1 {
            GENESIS_HASH.to_string()
        } else {
            self.storage
                .get_transfer_entry(start - 1)?
                .map(|e| e.hash())
                .ok_or_else(|| {
                    DropError::Storage(format!("Missing transfer entry {}", start - 1))
                })?
        };

        for seq in start..=end {
            let entry = self
                .storage
                .get_transfer_entry(seq)?
                .ok_or_else(|| DropError::Storage(format!("Missing transfer entry {seq}")))?;

            if entry.prev_hash != expected_prev_hash {
                tracing::warn!(
                    seq,
                    expected = %expected_prev_hash,
                    actual = %entry.prev_hash,
                    "Transfer chain broken"
                );
                return Ok(false);
            }

            if !entry.verify_signature(&verifying_key) {
                tracing::warn!(seq, "Invalid signature on transfer entry");
                return Ok(false);
            }

            expected_prev_hash = entry.hash();
        }

        Ok(true)
    }

    pub fn current_seq(&self) -> u64 {
        self.current_seq.load(Ordering::SeqCst)
    }

    pub fn get_entry(&self, seq: u64) -> DropResult<Option<TransferEntry>> {
        self.storage.get_transfer_entry(seq)
    }

    /// Entries with `start <= seq <= end`.
    pub fn list_entries(&self, start: u64, end: u64) -> DropResult<Vec<TransferEntry>> {
        self.storage.get_transfer_range(start, end)
    }

    /// Every entry touching one drop, oldest first.
    pub fn entries_for_drop(&self, dead_drop_id: &DropId) -> DropResult<Vec<TransferEntry>> {
        Ok(self
            .list_entries(1, self.current_seq())?
            .into_iter()
            .filter(|entry| entry.dead_drop_id == *dead_drop_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn create_test_log() -> (Storage, TransferLog) {
        let storage = Storage::open_memory().expect("Failed to create test storage");
        let log = TransferLog::new(storage.clone()).expect("Failed to create transfer log");
        (storage, log)
    }

    fn node(id: &str) -> FragmentHolder {
        FragmentHolder::Node(id.to_string())
    }

    #[test]
    fn test_append_and_retrieve() {
        let (_, log) = create_test_log();
        let drop_id = Uuid::new_v4();

        let seq = log
            .append(drop_id, 1, None, node("n1"), TransferOutcome::Success)
            .unwrap();
        assert_eq!(seq, 1);

        let entry = log.get_entry(1).unwrap().unwrap();
        assert_eq!(entry.dead_drop_id, drop_id);
        assert_eq!(entry.to, node("n1"));
        assert_eq!(entry.prev_hash, GENESIS_HASH);
        assert!(entry.verify_signature(&log.verifying_key()));
    }

    #[test]
    fn test_hash_chain() {
        let (_, log) = create_test_log();
        let drop_id = Uuid::new_v4();

        log.append(drop_id, 1, None, node("n1"), TransferOutcome::Success)
            .unwrap();
        log.append(
            drop_id,
            2,
            None,
            FragmentHolder::Local,
            TransferOutcome::Failure {
                reason: "unreachable".to_string(),
            },
        )
        .unwrap();
        log.append(
            drop_id,
            1,
            Some("n1".to_string()),
            node("n2"),
            TransferOutcome::Success,
        )
        .unwrap();

        assert!(log.verify_chain(1, 3).unwrap());
        assert!(log.verify_chain(2, 3).unwrap());
        assert!(!log.verify_chain(3, 1).unwrap());

        let entries = log.list_entries(1, 3).unwrap();
        assert_eq!(entries[1].prev_hash, entries[0].hash());
        assert_eq!(entries[2].prev_hash, entries[1].hash());
        assert_eq!(log.entries_for_drop(&drop_id).unwrap().len(), 3);
    }

    #[test]
    fn test_tampering_breaks_chain() {
        let (storage, log) = create_test_log();
        let drop_id = Uuid::new_v4();
        for index in 1..=3 {
            log.append(drop_id, index, None, node("n1"), TransferOutcome::Success)
                .unwrap();
        }

        let mut entry = storage.get_transfer_entry(2).unwrap().unwrap();
        entry.to = node("evil");
        storage.put_transfer_entry(&entry).unwrap();

        assert!(!log.verify_chain(1, 3).unwrap());
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let (storage, log) = create_test_log();
        let drop_id = Uuid::new_v4();
        log.append(drop_id, 1, None, node("n1"), TransferOutcome::Success)
            .unwrap();
        let key = log.signing_key.clone();
        drop(log);

        let reopened = TransferLog::with_signing_key(storage, key).unwrap();
        assert_eq!(reopened.current_seq(), 1);
        reopened
            .append(drop_id, 2, None, node("n2"), TransferOutcome::Success)
            .unwrap();
        assert!(reopened.verify_chain(1, 2).unwrap());
    }
}
