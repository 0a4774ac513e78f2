use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use teamserver_core::{
    integrity::verify_chain, AuditAction, AuditEntry, ChainReport, NewAuditEntry, Result,
    TeamError,
};

use crate::storage::{AuditQuery, Store};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub user: Option<String>,
    pub action: Option<AuditAction>,
    pub limit: Option<u32>,
}

impl From<&AuditFilter> for AuditQuery {
    fn from(filter: &AuditFilter) -> Self {
        AuditQuery {
            from: filter.from,
            to: filter.to,
            user: filter.user.clone(),
            action: filter.action,
            limit: filter.limit,
        }
    }
}

/// Append-only, hash-chained log of security events.
pub struct AuditLog {
    store: Arc<Store>,
}

impl AuditLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Appends an entry. Any storage failure surfaces as `AuditWrite` so the
    /// caller can refuse to proceed unaudited.
    pub async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        let action = entry.action;
        self.store.append_audit(entry).await.map_err(|e| {
            error!(%action, error = %e, "audit append failed");
            match e {
                TeamError::AuditWrite(_) => e,
                other => TeamError::AuditWrite(other.to_string()),
            }
        })
    }

    /// Read-time filtering; the chain itself is untouched.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.store.query_audit(&filter.into()).await
    }

    /// Verifies the complete stored chain.
    pub async fn verify(&self) -> Result<ChainReport> {
        let entries = self.store.audit_chain().await?;
        Ok(verify_chain(&entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamserver_core::{MasterKey, Sealer};
    use tempfile::TempDir;

    async fn test_log() -> (AuditLog, Arc<Store>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            Store::open(&dir.path().join("audit.db"), Sealer::new(MasterKey::generate()))
                .await
                .unwrap(),
        );
        (AuditLog::new(store.clone()), store, dir)
    }

    #[tokio::test]
    async fn test_appended_chain_verifies() {
        let (log, _store, _dir) = test_log().await;

        for i in 0..25 {
            let entry = NewAuditEntry::new(AuditAction::ProjectCreate, format!("p{}", i));
            log.append(entry.by("admin")).await.unwrap();
        }

        let report = log.verify().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 25);
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_chain_linear() {
        let (log, _store, _dir) = test_log().await;
        let log = Arc::new(log);

        let mut handles = Vec::new();
        for i in 0..32 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(NewAuditEntry::new(AuditAction::Sync, format!("run {}", i)))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = log.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 32);
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, (1..=32).collect::<Vec<_>>());
        assert!(log.verify().await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_tampered_row_detected() {
        let (log, store, _dir) = test_log().await;
        for i in 0..5 {
            let entry = NewAuditEntry::new(AuditAction::AccessGrant, format!("grant {}", i));
            log.append(entry.by("admin")).await.unwrap();
        }

        // Someone with raw database access bypasses the append-only trigger
        sqlx::query("DROP TRIGGER audit_log_no_update")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE audit_log SET details = 'grant everything' WHERE id = 3")
            .execute(store.pool())
            .await
            .unwrap();

        let report = log.verify().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.first_mismatch, Some(2));
    }

    #[tokio::test]
    async fn test_filtering() {
        let (log, _store, _dir) = test_log().await;
        log.append(NewAuditEntry::new(AuditAction::ProjectCreate, "shop").by("admin"))
            .await
            .unwrap();
        log.append(NewAuditEntry::new(AuditAction::UserJoin, "alice").by("alice"))
            .await
            .unwrap();
        log.append(NewAuditEntry::new(AuditAction::AuthFailure, "bad token"))
            .await
            .unwrap();

        let by_user = log
            .query(&AuditFilter {
                user: Some("alice".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].action, AuditAction::UserJoin);

        let by_action = log
            .query(&AuditFilter {
                action: Some(AuditAction::AuthFailure),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_action.len(), 1);
        assert!(by_action[0].user.is_none());

        let future = log
            .query(&AuditFilter {
                from: Some(Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(future.is_empty());

        let limited = log
            .query(&AuditFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }
}
