use ring::digest::{Context, SHA256};
use serde::Serialize;

use crate::errors::{Result, TeamError};
use crate::models::{AuditAction, AuditEntry};

/// `hash[-1]`: the value the first audit entry chains from.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// The fields of an audit entry that are covered by its chain hash.
///
/// Field order is fixed by the struct layout; changing it invalidates every
/// stored chain.
#[derive(Serialize)]
struct ChainPayload<'a> {
    id: i64,
    timestamp: i64,
    user: Option<&'a str>,
    action: AuditAction,
    details: &'a str,
    source_ip: Option<&'a str>,
}

/// Canonical byte form of an entry for hashing.
pub fn serialize_entry(
    id: i64,
    timestamp: i64,
    user: Option<&str>,
    action: AuditAction,
    details: &str,
    source_ip: Option<&str>,
) -> Result<Vec<u8>> {
    serde_json::to_vec(&ChainPayload {
        id,
        timestamp,
        user,
        action,
        details,
        source_ip,
    })
    .map_err(|e| TeamError::Internal(e.to_string()))
}

/// `H(prev_hash || payload)`, hex encoded.
pub fn chain_hash(prev_hash: &str, payload: &[u8]) -> String {
    let mut context = Context::new(&SHA256);
    context.update(prev_hash.as_bytes());
    context.update(payload);
    hex::encode(context.finish().as_ref())
}

pub fn entry_hash(prev_hash: &str, entry: &AuditEntry) -> Result<String> {
    let payload = serialize_entry(
        entry.id,
        entry.timestamp.timestamp(),
        entry.user.as_deref(),
        entry.action,
        &entry.details,
        entry.source_ip.as_deref(),
    )?;
    Ok(chain_hash(prev_hash, &payload))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub valid: bool,
    /// Index (into the verified slice) of the first entry whose hash does not
    /// follow from its predecessor.
    pub first_mismatch: Option<usize>,
    pub entries_checked: usize,
}

/// Recomputes the chain over entries in chronological order.
///
/// A broken chain is reported, never repaired.
pub fn verify_chain(entries: &[AuditEntry]) -> ChainReport {
    let mut prev = GENESIS_HASH.to_string();

    for (index, entry) in entries.iter().enumerate() {
        let matches = match entry_hash(&prev, entry) {
            Ok(expected) => expected == entry.hash,
            Err(_) => false,
        };

        if !matches {
            return ChainReport {
                valid: false,
                first_mismatch: Some(index),
                entries_checked: index + 1,
            };
        }

        prev = entry.hash.clone();
    }

    ChainReport {
        valid: true,
        first_mismatch: None,
        entries_checked: entries.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn build_chain(count: usize) -> Vec<AuditEntry> {
        let mut prev = GENESIS_HASH.to_string();
        let mut entries = Vec::new();

        for i in 0..count {
            let mut entry = AuditEntry {
                id: i as i64 + 1,
                timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + i as i64, 0).unwrap(),
                user: if i % 2 == 0 { Some("admin".to_string()) } else { None },
                action: AuditAction::ProjectCreate,
                details: format!("project-{}", i),
                source_ip: Some("10.0.0.1".to_string()),
                hash: String::new(),
            };
            entry.hash = entry_hash(&prev, &entry).unwrap();
            prev = entry.hash.clone();
            entries.push(entry);
        }

        entries
    }

    #[test]
    fn test_empty_chain_is_valid() {
        let report = verify_chain(&[]);
        assert!(report.valid);
        assert_eq!(report.first_mismatch, None);
    }

    #[test]
    fn test_intact_chain_verifies() {
        let entries = build_chain(10);
        let report = verify_chain(&entries);
        assert!(report.valid);
        assert_eq!(report.entries_checked, 10);
    }

    #[test]
    fn test_altered_details_detected() {
        let mut entries = build_chain(6);
        entries[3].details = "project-evil".to_string();

        let report = verify_chain(&entries);
        assert!(!report.valid);
        assert_eq!(report.first_mismatch, Some(3));
    }

    #[test]
    fn test_altered_hash_detected() {
        let mut entries = build_chain(4);
        entries[0].hash = GENESIS_HASH.to_string();

        assert_eq!(verify_chain(&entries).first_mismatch, Some(0));
    }

    #[test]
    fn test_deleted_entry_detected() {
        let mut entries = build_chain(5);
        entries.remove(2);

        assert_eq!(verify_chain(&entries).first_mismatch, Some(2));
    }

    #[test]
    fn test_reordering_detected() {
        let mut entries = build_chain(5);
        entries.swap(1, 2);

        assert_eq!(verify_chain(&entries).first_mismatch, Some(1));
    }

    #[test]
    fn test_hash_depends_on_previous() {
        let payload = b"payload";
        assert_ne!(chain_hash(GENESIS_HASH, payload), chain_hash("ff", payload));
    }
}
