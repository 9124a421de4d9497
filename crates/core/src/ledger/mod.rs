use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::delegation::{DelegationAuditEntry, ProxyApprovalRecord};
use crate::domain::workflow::{RejectionHistoryEntry, WorkflowStepHistory};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerRecordKind {
    StepHistory,
    Rejection,
    ProxyApproval,
    DelegationAudit,
}

impl LedgerRecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepHistory => "step_history",
            Self::Rejection => "rejection",
            Self::ProxyApproval => "proxy_approval",
            Self::DelegationAudit => "delegation_audit",
        }
    }
}

/// Anything that can be sealed into a ledger chain.
pub trait LedgerRecord: Serialize {
    const KIND: LedgerRecordKind;

    fn record_id(&self) -> &str;
    fn actor_id(&self) -> &str;
    fn recorded_at(&self) -> DateTime<Utc>;
}

impl LedgerRecord for WorkflowStepHistory {
    const KIND: LedgerRecordKind = LedgerRecordKind::StepHistory;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn actor_id(&self) -> &str {
        self.action_by.as_str()
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl LedgerRecord for RejectionHistoryEntry {
    const KIND: LedgerRecordKind = LedgerRecordKind::Rejection;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn actor_id(&self) -> &str {
        self.rejected_by.as_str()
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl LedgerRecord for ProxyApprovalRecord {
    const KIND: LedgerRecordKind = LedgerRecordKind::ProxyApproval;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn actor_id(&self) -> &str {
        self.proxy_user_id.as_str()
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

impl LedgerRecord for DelegationAuditEntry {
    const KIND: LedgerRecordKind = LedgerRecordKind::DelegationAudit;

    fn record_id(&self) -> &str {
        &self.id
    }

    fn actor_id(&self) -> &str {
        self.actor_id.as_str()
    }

    fn recorded_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Chain key for delegation audit entries: the instance chain when the entry is tied to
/// one, otherwise a per-delegation chain.
pub fn delegation_chain_key(entry: &DelegationAuditEntry) -> String {
    match &entry.instance_id {
        Some(instance_id) => instance_id.0.clone(),
        None => format!("delegation:{}", entry.delegation_id),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub chain_key: String,
    pub sequence: u32,
    pub record_kind: LedgerRecordKind,
    pub record_id: String,
    pub content_hash: String,
    pub prev_hash: Option<String>,
    pub entry_hash: String,
    pub recorded_at: DateTime<Utc>,
    pub actor_id: String,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub chain_key: String,
    pub valid: bool,
    pub verified_entries: usize,
    pub latest_hash: Option<String>,
    pub failure_reason: Option<String>,
}

/// Append-only, HMAC-signed, hash-chained seal over history records, one chain per key.
#[derive(Clone)]
pub struct HistoryLedger {
    signing_key: Vec<u8>,
    chains: HashMap<String, Vec<LedgerEntry>>,
}

impl HistoryLedger {
    pub fn new(signing_key: impl AsRef<[u8]>) -> Self {
        Self { signing_key: signing_key.as_ref().to_vec(), chains: HashMap::new() }
    }

    pub fn append<R: LedgerRecord>(&mut self, chain_key: &str, record: &R) -> LedgerEntry {
        let chain = self.chains.entry(chain_key.to_string()).or_default();
        let sequence = u32::try_from(chain.len()).unwrap_or(u32::MAX).saturating_add(1);
        let prev_hash = chain.last().map(|entry| entry.entry_hash.clone());
        let content_hash = content_hash(record);
        let entry_hash = hash_entry_material(
            chain_key,
            sequence,
            R::KIND,
            record.record_id(),
            &content_hash,
            prev_hash.as_deref(),
            record.recorded_at(),
            record.actor_id(),
        );
        let signature = hmac_hex(&self.signing_key, entry_hash.as_bytes());

        let entry = LedgerEntry {
            entry_id: Uuid::new_v4().to_string(),
            chain_key: chain_key.to_string(),
            sequence,
            record_kind: R::KIND,
            record_id: record.record_id().to_string(),
            content_hash,
            prev_hash,
            entry_hash,
            recorded_at: record.recorded_at(),
            actor_id: record.actor_id().to_string(),
            signature,
        };

        chain.push(entry.clone());
        entry
    }

    /// Reloads persisted entries. Entries are kept in sequence order.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = LedgerEntry>) {
        for entry in entries {
            self.chains.entry(entry.chain_key.clone()).or_default().push(entry);
        }
        for chain in self.chains.values_mut() {
            chain.sort_by_key(|entry| entry.sequence);
        }
    }

    pub fn entries(&self, chain_key: &str) -> Vec<LedgerEntry> {
        self.chains.get(chain_key).cloned().unwrap_or_default()
    }

    /// True when `record` still hashes to what was sealed for it.
    pub fn matches_record<R: LedgerRecord>(&self, chain_key: &str, record: &R) -> bool {
        self.chains
            .get(chain_key)
            .and_then(|chain| chain.iter().find(|entry| entry.record_id == record.record_id()))
            .map(|entry| entry.content_hash == content_hash(record))
            .unwrap_or(false)
    }

    /// An empty chain verifies trivially.
    pub fn verify_chain(&self, chain_key: &str) -> VerificationResult {
        let entries = self.chains.get(chain_key).map(Vec::as_slice).unwrap_or_default();
        let fail = |index: usize, latest_hash: Option<String>, reason: String| VerificationResult {
            chain_key: chain_key.to_string(),
            valid: false,
            verified_entries: index,
            latest_hash,
            failure_reason: Some(reason),
        };

        let mut previous_hash: Option<String> = None;
        for (index, entry) in entries.iter().enumerate() {
            let expected_sequence = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
            if entry.sequence != expected_sequence {
                return fail(
                    index,
                    previous_hash,
                    format!(
                        "sequence mismatch at entry {}: expected {}, found {}",
                        entry.entry_id, expected_sequence, entry.sequence
                    ),
                );
            }

            if entry.prev_hash != previous_hash {
                return fail(
                    index,
                    previous_hash,
                    format!("previous hash mismatch at entry {}", entry.entry_id),
                );
            }

            let computed_entry_hash = hash_entry_material(
                &entry.chain_key,
                entry.sequence,
                entry.record_kind,
                &entry.record_id,
                &entry.content_hash,
                entry.prev_hash.as_deref(),
                entry.recorded_at,
                &entry.actor_id,
            );
            if computed_entry_hash != entry.entry_hash {
                return fail(
                    index,
                    previous_hash,
                    format!("entry hash mismatch at entry {}", entry.entry_id),
                );
            }

            let expected_signature = hmac_hex(&self.signing_key, entry.entry_hash.as_bytes());
            if expected_signature != entry.signature {
                return fail(
                    index,
                    previous_hash,
                    format!("signature mismatch at entry {}", entry.entry_id),
                );
            }

            previous_hash = Some(entry.entry_hash.clone());
        }

        VerificationResult {
            chain_key: chain_key.to_string(),
            valid: true,
            verified_entries: entries.len(),
            latest_hash: previous_hash,
            failure_reason: None,
        }
    }
}

fn content_hash<R: Serialize>(record: &R) -> String {
    match serde_json::to_vec(record) {
        Ok(payload) => sha256_hex(&payload),
        Err(_) => sha256_hex(b""),
    }
}

#[allow(clippy::too_many_arguments)]
fn hash_entry_material(
    chain_key: &str,
    sequence: u32,
    kind: LedgerRecordKind,
    record_id: &str,
    content_hash: &str,
    prev_hash: Option<&str>,
    recorded_at: DateTime<Utc>,
    actor_id: &str,
) -> String {
    let material = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        chain_key,
        sequence,
        kind.as_str(),
        record_id,
        content_hash,
        prev_hash.unwrap_or(""),
        recorded_at.to_rfc3339(),
        actor_id,
    );
    sha256_hex(material.as_bytes())
}

fn hmac_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return sha256_hex(payload),
    };
    mac.update(payload);
    encode_hex(mac.finalize().into_bytes().as_slice())
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::HistoryLedger;
    use crate::domain::request::UserId;
    use crate::domain::workflow::{InstanceId, StepAction, StepId, WorkflowStepHistory};

    fn entry(id: &str, action: StepAction, minutes: i64) -> WorkflowStepHistory {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).single().expect("valid date");
        WorkflowStepHistory {
            id: id.to_string(),
            instance_id: InstanceId("WF-7".to_string()),
            step_id: Some(StepId("STP-1".to_string())),
            step_order: Some(1),
            tier_level: Some(1),
            action,
            action_by: UserId::new("mo"),
            comments: None,
            is_proxy_approval: false,
            original_approver_id: None,
            delegation_id: None,
            is_system_action: false,
            assigned_to: None,
            tier_completed: true,
            workflow_completed: false,
            to_step_order: Some(2),
            cycle: 0,
            created_at: base + Duration::minutes(minutes),
        }
    }

    #[test]
    fn appended_entries_link_previous_hashes() {
        let mut ledger = HistoryLedger::new("secret-key");

        let first = ledger.append("WF-7", &entry("h-1", StepAction::Approved, 0));
        let second = ledger.append("WF-7", &entry("h-2", StepAction::Approved, 5));

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.prev_hash, Some(first.entry_hash));
        assert!(ledger.verify_chain("WF-7").valid);
    }

    #[test]
    fn tampered_chain_and_records_are_detected() {
        let mut ledger = HistoryLedger::new("secret-key");
        let original = entry("h-1", StepAction::Rejected, 0);
        ledger.append("WF-7", &original);
        ledger.append("WF-7", &entry("h-2", StepAction::Resubmitted, 5));

        let mut edited = original.clone();
        edited.action = StepAction::Approved;
        assert!(ledger.matches_record("WF-7", &original));
        assert!(!ledger.matches_record("WF-7", &edited));

        let mut entries = ledger.entries("WF-7");
        entries[0].actor_id = "someone-else".to_string();
        let mut tampered = HistoryLedger::new("secret-key");
        tampered.restore(entries);

        let result = tampered.verify_chain("WF-7");
        assert!(!result.valid);
        assert_eq!(result.verified_entries, 0);
    }

    #[test]
    fn wrong_signing_key_fails_verification() {
        let mut ledger = HistoryLedger::new("secret-key");
        ledger.append("WF-7", &entry("h-1", StepAction::Approved, 0));

        let mut other = HistoryLedger::new("another-key");
        other.restore(ledger.entries("WF-7"));

        let result = other.verify_chain("WF-7");
        assert!(!result.valid);
        assert!(result.failure_reason.unwrap_or_default().contains("signature mismatch"));
    }

    #[test]
    fn empty_chain_verifies_trivially() {
        let ledger = HistoryLedger::new("secret-key");

        let result = ledger.verify_chain("WF-none");
        assert!(result.valid);
        assert_eq!(result.verified_entries, 0);
    }
}
