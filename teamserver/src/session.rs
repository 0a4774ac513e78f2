use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

use teamserver_core::{
    crypto::{generate_token, hash_token, INVITE_TOKEN_PREFIX, SESSION_TOKEN_PREFIX},
    models::{CertificateRecord, Invite},
    validate_identifier, AuditAction, NewAuditEntry, Result, Role, TeamError, User,
};

use crate::access::AccessControl;
use crate::ca::{generate_user_keypair, CertificateAuthority};
use crate::storage::{NewInvite, Store};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub invite_ttl: Duration,
    pub session_ttl: Duration,
    pub ca_enabled: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            invite_ttl: Duration::hours(72),
            session_ttl: Duration::hours(720),
            ca_enabled: true,
        }
    }
}

/// A pending user an admin wants to invite.
#[derive(Debug, Clone)]
pub struct InviteRequest {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The plaintext token exists only in this value; storage keeps its hash.
pub struct IssuedInvite {
    pub token: String,
    pub invite: Invite,
}

/// Everything a new user receives at join. The private key and session
/// token are not retrievable afterwards.
pub struct JoinOutcome {
    pub user: User,
    pub session_token: String,
    pub session_expires_at: DateTime<Utc>,
    pub private_key: Zeroizing<String>,
    pub certificate: Option<CertificateRecord>,
}

/// Invites, joins, session validation and the user lifecycle.
pub struct SessionManager {
    store: Arc<Store>,
    access: Arc<AccessControl>,
    ca: Arc<CertificateAuthority>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        store: Arc<Store>,
        access: Arc<AccessControl>,
        ca: Arc<CertificateAuthority>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            store,
            access,
            ca,
            settings,
        }
    }

    pub async fn create_invite(
        &self,
        request: InviteRequest,
        actor: &str,
        source_ip: Option<String>,
    ) -> Result<IssuedInvite> {
        validate_identifier("user", &request.name)?;
        if !request.email.contains('@') {
            return Err(TeamError::Validation("invalid email address".to_string()));
        }
        if request.expires_at.map(|at| at <= Utc::now()).unwrap_or(false) {
            return Err(TeamError::Validation("expiry must be in the future".to_string()));
        }
        if self.store.user_exists(&request.name).await? {
            return Err(TeamError::conflict("user", request.name));
        }

        let token = generate_token(INVITE_TOKEN_PREFIX);
        let audit = NewAuditEntry::new(
            AuditAction::UserInvite,
            format!("invited {} <{}> as {}", request.name, request.email, request.role),
        )
        .by(actor)
        .from_ip(source_ip);

        let invite = self
            .store
            .create_invite(
                NewInvite {
                    token_hash: hash_token(&token),
                    user_name: request.name,
                    email: request.email,
                    role: request.role,
                    user_expires_at: request.expires_at,
                    expires_at: Utc::now() + self.settings.invite_ttl,
                    created_by: actor.to_string(),
                },
                audit,
            )
            .await?;

        info!(user = %invite.user_name, role = %invite.role, "invite issued");
        Ok(IssuedInvite { token, invite })
    }

    /// Consumes an invite token and activates its user.
    ///
    /// The keypair is generated here; only the public half is stored. With
    /// the CA enabled a first certificate rides along, but a signing failure
    /// does not undo the join: the user can renew later.
    pub async fn join(&self, token: &str, source_ip: Option<String>) -> Result<JoinOutcome> {
        let token_hash = hash_token(token);
        let invite = match self.store.find_invite(&token_hash).await? {
            Some(invite) => invite,
            None => {
                self.record_auth_failure(None, "join with unknown invite token", source_ip)
                    .await;
                return Err(TeamError::Unauthorized);
            }
        };
        if invite.consumed_at.is_some() {
            return Err(TeamError::AlreadyConsumed);
        }

        let keypair = generate_user_keypair(&format!("teamserver:{}", invite.user_name))?;
        let session_token = generate_token(SESSION_TOKEN_PREFIX);
        let session_expires_at = Utc::now() + self.settings.session_ttl;

        let audit = NewAuditEntry::new(
            AuditAction::UserJoin,
            format!("{} joined as {}", invite.user_name, invite.role),
        )
        .by(&invite.user_name)
        .from_ip(source_ip.clone());

        let (user, session) = self
            .store
            .consume_invite(
                &token_hash,
                &keypair.public_key,
                &hash_token(&session_token),
                session_expires_at,
                audit,
            )
            .await?;

        let certificate = if self.settings.ca_enabled {
            match self
                .ca
                .issue_for_user(&user, &self.access, AuditAction::CertIssue, source_ip)
                .await
            {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(user = %user.name, error = %e, "first certificate not issued at join");
                    None
                }
            }
        } else {
            None
        };

        info!(user = %user.name, "user joined");
        Ok(JoinOutcome {
            user,
            session_token,
            session_expires_at: session.expires_at,
            private_key: keypair.private_key,
            certificate,
        })
    }

    /// Resolves a session bearer token to its user.
    ///
    /// Unknown tokens, expired sessions and expired users are all
    /// `Unauthorized`, and each attempt leaves an `auth_failure` entry.
    pub async fn authenticate(&self, token: &str, source_ip: Option<String>) -> Result<User> {
        let found = if token.starts_with(SESSION_TOKEN_PREFIX) {
            self.store.find_session(&hash_token(token)).await?
        } else {
            None
        };

        let Some((session, user)) = found else {
            self.record_auth_failure(None, "unknown session token", source_ip)
                .await;
            return Err(TeamError::Unauthorized);
        };

        if session.is_expired() {
            self.record_auth_failure(Some(&user.name), "expired session", source_ip)
                .await;
            return Err(TeamError::Unauthorized);
        }
        if user.is_expired() {
            self.record_auth_failure(Some(&user.name), "expired user", source_ip)
                .await;
            return Err(TeamError::Unauthorized);
        }

        if let Err(e) = self.store.touch_user(user.id).await {
            warn!(user = %user.name, error = %e, "failed to record last access");
        }
        Ok(user)
    }

    /// Sets or clears a user's expiry.
    pub async fn renew_user(
        &self,
        name: &str,
        expires_at: Option<DateTime<Utc>>,
        actor: &str,
        source_ip: Option<String>,
    ) -> Result<User> {
        let details = match expires_at {
            Some(at) => format!("{} now expires {}", name, at.to_rfc3339()),
            None => format!("{} no longer expires", name),
        };
        let audit = NewAuditEntry::new(AuditAction::UserRenew, details)
            .by(actor)
            .from_ip(source_ip);

        let user = self.store.set_user_expiry(name, expires_at, audit).await?;
        info!(user = %name, "user expiry updated");
        Ok(user)
    }

    /// Removes a user, their grants and sessions. Certificates already
    /// issued stay valid until they expire.
    pub async fn remove_user(
        &self,
        name: &str,
        actor: &str,
        source_ip: Option<String>,
    ) -> Result<()> {
        let audit = NewAuditEntry::new(AuditAction::UserRemove, format!("removed {}", name))
            .by(actor)
            .from_ip(source_ip);

        self.store.delete_user(name, audit).await?;
        info!(user = %name, "user removed");
        Ok(())
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        self.store.purge_expired().await
    }

    async fn record_auth_failure(
        &self,
        user: Option<&str>,
        details: &str,
        source_ip: Option<String>,
    ) {
        let mut entry = NewAuditEntry::new(AuditAction::AuthFailure, details).from_ip(source_ip);
        if let Some(user) = user {
            entry = entry.by(user);
        }
        if let Err(e) = self.store.append_audit(entry).await {
            warn!(error = %e, "failed to audit authentication failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditFilter, AuditLog};
    use teamserver_core::{MasterKey, Sealer};
    use tempfile::TempDir;

    struct Fixture {
        store: Arc<Store>,
        sessions: SessionManager,
        _dir: TempDir,
    }

    async fn fixture(ca_enabled: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            Store::open(&dir.path().join("sessions.db"), Sealer::new(MasterKey::generate()))
                .await
                .unwrap(),
        );
        let access = Arc::new(AccessControl::new(store.clone()));
        let ca = Arc::new(CertificateAuthority::new(store.clone(), Duration::hours(24)));
        if ca_enabled {
            ca.generate_ca_keypair("admin").await.unwrap();
        }
        let sessions = SessionManager::new(
            store.clone(),
            access,
            ca,
            SessionSettings {
                ca_enabled,
                ..Default::default()
            },
        );
        Fixture {
            store,
            sessions,
            _dir: dir,
        }
    }

    fn request(name: &str) -> InviteRequest {
        InviteRequest {
            name: name.to_string(),
            email: format!("{}@example.com", name),
            role: Role::Dev,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_invite_and_join() {
        let f = fixture(true).await;
        let issued = f.sessions.create_invite(request("alice"), "admin", None).await.unwrap();
        assert!(issued.token.starts_with(INVITE_TOKEN_PREFIX));

        // Only the hash is persisted
        assert!(f.store.find_invite(&issued.token).await.unwrap().is_none());

        let joined = f.sessions.join(&issued.token, None).await.unwrap();
        assert_eq!(joined.user.name, "alice");
        assert!(joined.session_token.starts_with(SESSION_TOKEN_PREFIX));
        assert!(joined.private_key.contains("OPENSSH PRIVATE KEY"));
        assert!(joined.user.public_key.ends_with("teamserver:alice"));
        assert!(joined.certificate.is_some());

        let user = f.sessions.authenticate(&joined.session_token, None).await.unwrap();
        assert_eq!(user.name, "alice");
    }

    #[tokio::test]
    async fn test_invite_reuse_rejected() {
        let f = fixture(false).await;
        let issued = f.sessions.create_invite(request("bob"), "admin", None).await.unwrap();

        let first = f.sessions.join(&issued.token, None).await.unwrap();
        assert!(first.certificate.is_none());

        let second = f.sessions.join(&issued.token, None).await;
        assert!(matches!(second, Err(TeamError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn test_consumed_invite_survives_purge() {
        let f = fixture(false).await;
        let issued = f.sessions.create_invite(request("hank"), "admin", None).await.unwrap();
        f.sessions.join(&issued.token, None).await.unwrap();

        f.store
            .create_invite(
                NewInvite {
                    token_hash: hash_token("tsi_lapsed"),
                    user_name: "ivy".to_string(),
                    email: "ivy@example.com".to_string(),
                    role: Role::Dev,
                    user_expires_at: None,
                    expires_at: Utc::now() - Duration::hours(1),
                    created_by: "admin".to_string(),
                },
                NewAuditEntry::new(AuditAction::UserInvite, "ivy"),
            )
            .await
            .unwrap();

        assert_eq!(f.sessions.purge_expired().await.unwrap(), 1);
        assert!(f.store.find_invite(&hash_token("tsi_lapsed")).await.unwrap().is_none());

        let replay = f.sessions.join(&issued.token, None).await;
        assert!(matches!(replay, Err(TeamError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn test_unknown_tokens_rejected_and_audited() {
        let f = fixture(false).await;

        assert!(matches!(
            f.sessions.join("tsi_nope", Some("10.1.1.1".to_string())).await,
            Err(TeamError::Unauthorized)
        ));
        assert!(matches!(
            f.sessions.authenticate("tss_nope", None).await,
            Err(TeamError::Unauthorized)
        ));
        assert!(matches!(
            f.sessions.authenticate("garbage", None).await,
            Err(TeamError::Unauthorized)
        ));

        let failures = AuditLog::new(f.store.clone())
            .query(&AuditFilter {
                action: Some(AuditAction::AuthFailure),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failures.len(), 3);
        assert_eq!(failures[0].source_ip.as_deref(), Some("10.1.1.1"));
    }

    #[tokio::test]
    async fn test_expired_session_rejected() {
        let f = fixture(false).await;
        f.store
            .create_invite(
                NewInvite {
                    token_hash: hash_token("tsi_old"),
                    user_name: "carol".to_string(),
                    email: "carol@example.com".to_string(),
                    role: Role::Dev,
                    user_expires_at: None,
                    expires_at: Utc::now() + Duration::hours(1),
                    created_by: "admin".to_string(),
                },
                NewAuditEntry::new(AuditAction::UserInvite, "carol"),
            )
            .await
            .unwrap();
        f.store
            .consume_invite(
                &hash_token("tsi_old"),
                "ssh-ed25519 AAAA carol",
                &hash_token("tss_stale"),
                Utc::now() - Duration::seconds(1),
                NewAuditEntry::new(AuditAction::UserJoin, "carol"),
            )
            .await
            .unwrap();

        assert!(matches!(
            f.sessions.authenticate("tss_stale", None).await,
            Err(TeamError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_expired_user_rejected() {
        let f = fixture(false).await;
        let issued = f.sessions.create_invite(request("dave"), "admin", None).await.unwrap();
        let joined = f.sessions.join(&issued.token, None).await.unwrap();

        f.store
            .set_user_expiry(
                "dave",
                Some(Utc::now() - Duration::seconds(1)),
                NewAuditEntry::new(AuditAction::UserRenew, "dave"),
            )
            .await
            .unwrap();
        assert!(matches!(
            f.sessions.authenticate(&joined.session_token, None).await,
            Err(TeamError::Unauthorized)
        ));

        f.sessions.renew_user("dave", None, "admin", None).await.unwrap();
        assert!(f.sessions.authenticate(&joined.session_token, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_invite_validation() {
        let f = fixture(false).await;
        let issued = f.sessions.create_invite(request("erin"), "admin", None).await.unwrap();
        f.sessions.join(&issued.token, None).await.unwrap();

        assert!(matches!(
            f.sessions.create_invite(request("erin"), "admin", None).await,
            Err(TeamError::Conflict { .. })
        ));
        assert!(matches!(
            f.sessions.create_invite(request("bad/name"), "admin", None).await,
            Err(TeamError::Validation(_))
        ));

        let mut past = request("frank");
        past.expires_at = Some(Utc::now() - Duration::hours(1));
        assert!(matches!(
            f.sessions.create_invite(past, "admin", None).await,
            Err(TeamError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_user_ends_sessions() {
        let f = fixture(false).await;
        let issued = f.sessions.create_invite(request("gina"), "admin", None).await.unwrap();
        let joined = f.sessions.join(&issued.token, None).await.unwrap();

        f.sessions.remove_user("gina", "admin", None).await.unwrap();
        assert!(matches!(
            f.sessions.authenticate(&joined.session_token, None).await,
            Err(TeamError::Unauthorized)
        ));
        assert!(matches!(
            f.sessions.remove_user("gina", "admin", None).await,
            Err(TeamError::NotFound { .. })
        ));
    }
}
