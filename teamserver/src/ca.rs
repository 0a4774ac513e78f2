use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use serde::Serialize;
use ssh_key::{
    certificate::{Builder, CertType},
    Algorithm, HashAlg, LineEnding, PrivateKey, PublicKey,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;
use zeroize::Zeroizing;

use teamserver_core::{
    models::CertificateRecord, AuditAction, NewAuditEntry, Result, TeamError, User,
};

use crate::access::AccessControl;
use crate::storage::Store;

/// Backdating applied to `valid_after` to absorb clock skew between hosts.
const CLOCK_SKEW_ALLOWANCE_SECS: i64 = 60;

/// Signed in place of an empty principal list. OpenSSH treats an empty list
/// as "any principal"; a colon can never appear in a login name, so this one
/// matches no account.
pub const NO_ACCESS_PRINCIPAL: &str = "teamserver:no-access";

const CA_KEY_COMMENT: &str = "teamserver-ca";

const PERMIT_EXTENSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

fn ca_err(e: ssh_key::Error) -> TeamError {
    TeamError::CertificateAuthority(e.to_string())
}

/// A user keypair generated on the server at join time.
pub struct GeneratedKeypair {
    pub public_key: String,
    pub private_key: Zeroizing<String>,
}

/// Generates an Ed25519 keypair in OpenSSH encoding.
pub fn generate_user_keypair(comment: &str) -> Result<GeneratedKeypair> {
    let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(ca_err)?;
    key.set_comment(comment);

    Ok(GeneratedKeypair {
        public_key: key.public_key().to_openssh().map_err(ca_err)?,
        private_key: key.to_openssh(LineEnding::LF).map_err(ca_err)?,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CertInfo {
    pub serial: u64,
    pub principals: Vec<String>,
    pub valid_after: DateTime<Utc>,
    pub valid_before: DateTime<Utc>,
    pub expired: bool,
}

impl From<&CertificateRecord> for CertInfo {
    fn from(record: &CertificateRecord) -> Self {
        CertInfo {
            serial: record.serial,
            principals: record.principals.clone(),
            valid_after: record.valid_after,
            valid_before: record.valid_before,
            expired: record.is_expired(),
        }
    }
}

/// Internal SSH certificate authority.
///
/// Certificates are the only revocation mechanism on hosts that trust the CA:
/// revoking a grant changes what the next certificate carries, while a
/// certificate already issued stays valid until `valid_before`.
pub struct CertificateAuthority {
    store: Arc<Store>,
    default_ttl: Duration,
    next_serial: OnceCell<AtomicU64>,
}

impl CertificateAuthority {
    pub fn new(store: Arc<Store>, default_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl,
            next_serial: OnceCell::new(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Creates and persists the CA keypair. Runs once, at initialization.
    /// Returns the public key for distribution to hosts.
    pub async fn generate_ca_keypair(&self, actor: &str) -> Result<String> {
        if self.store.ca_public_key().await?.is_some() {
            return Err(TeamError::conflict("ca key", "ca"));
        }

        let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(ca_err)?;
        key.set_comment(CA_KEY_COMMENT);

        let public_key = key.public_key().to_openssh().map_err(ca_err)?;
        let private_key = key.to_openssh(LineEnding::LF).map_err(ca_err)?;

        let audit = NewAuditEntry::new(
            AuditAction::CaGenerate,
            format!("generated CA key {}", key.public_key().fingerprint(HashAlg::Sha256)),
        )
        .by(actor);
        self.store
            .store_ca_key(&public_key, &private_key, audit)
            .await?;

        info!("certificate authority keypair generated");
        Ok(public_key)
    }

    pub async fn public_key(&self) -> Result<Option<String>> {
        self.store.ca_public_key().await
    }

    pub async fn is_configured(&self) -> Result<bool> {
        Ok(self.public_key().await?.is_some())
    }

    async fn allocate_serial(&self) -> Result<u64> {
        let counter = self
            .next_serial
            .get_or_try_init(|| async {
                let max = self.store.max_certificate_serial().await?;
                Ok::<_, TeamError>(AtomicU64::new(max + 1))
            })
            .await?;
        Ok(counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Signs a user certificate for `user_public_key` valid from now to
    /// now + `ttl`, restricted to `principals`.
    pub async fn issue_certificate(
        &self,
        user_name: &str,
        user_public_key: &str,
        principals: &[String],
        ttl: Option<Duration>,
    ) -> Result<CertificateRecord> {
        let ca_private = self
            .store
            .ca_private_key()
            .await?
            .ok_or_else(|| TeamError::CertificateAuthority("no CA key configured".to_string()))?;
        let ca_key = PrivateKey::from_openssh(ca_private.as_bytes()).map_err(ca_err)?;

        let subject = PublicKey::from_openssh(user_public_key).map_err(ca_err)?;

        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl <= Duration::zero() {
            return Err(TeamError::Validation("certificate ttl must be positive".to_string()));
        }

        let now = Utc::now();
        let valid_after = now - Duration::seconds(CLOCK_SKEW_ALLOWANCE_SECS);
        let valid_before = now + ttl;
        let serial = self.allocate_serial().await?;

        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.key_data().clone(),
            valid_after.timestamp() as u64,
            valid_before.timestamp() as u64,
        )
        .map_err(ca_err)?;
        builder.serial(serial).map_err(ca_err)?;
        builder
            .key_id(format!("teamserver:{}:{}", user_name, serial))
            .map_err(ca_err)?;
        builder.cert_type(CertType::User).map_err(ca_err)?;

        if principals.is_empty() {
            builder.valid_principal(NO_ACCESS_PRINCIPAL).map_err(ca_err)?;
        } else {
            for principal in principals {
                builder.valid_principal(principal.as_str()).map_err(ca_err)?;
            }
        }
        for extension in PERMIT_EXTENSIONS {
            builder.extension(extension, "").map_err(ca_err)?;
        }

        let certificate = builder.sign(&ca_key).map_err(ca_err)?;

        Ok(CertificateRecord {
            serial,
            user_name: user_name.to_string(),
            principals: principals.to_vec(),
            valid_after: DateTime::from_timestamp(valid_after.timestamp(), 0)
                .unwrap_or(valid_after),
            valid_before: DateTime::from_timestamp(valid_before.timestamp(), 0)
                .unwrap_or(valid_before),
            certificate: certificate.to_openssh().map_err(ca_err)?,
        })
    }

    /// Issues a certificate for the user's current principal set and records
    /// it alongside its audit entry.
    pub async fn issue_for_user(
        &self,
        user: &User,
        access: &AccessControl,
        action: AuditAction,
        source_ip: Option<String>,
    ) -> Result<CertificateRecord> {
        let principals = access.principals_for(user).await?;
        let record = self
            .issue_certificate(&user.name, &user.public_key, &principals, None)
            .await?;

        let audit = NewAuditEntry::new(
            action,
            format!(
                "serial {} principals [{}] valid until {}",
                record.serial,
                record.principals.join(","),
                record.valid_before.to_rfc3339()
            ),
        )
        .by(&user.name)
        .from_ip(source_ip);
        self.store.record_certificate(&record, audit).await?;

        info!(
            user = %user.name,
            serial = record.serial,
            principals = record.principals.len(),
            "certificate issued"
        );
        Ok(record)
    }

    /// Recomputes the principal set from current grants and reissues with a
    /// fresh TTL. Zero access still renews, into a certificate usable nowhere.
    pub async fn renew(
        &self,
        user: &User,
        access: &AccessControl,
        source_ip: Option<String>,
    ) -> Result<CertificateRecord> {
        self.issue_for_user(user, access, AuditAction::CertRenew, source_ip)
            .await
    }

    pub async fn certificate_info(&self, user: &User) -> Result<CertInfo> {
        self.store
            .latest_certificate(&user.name)
            .await?
            .map(|record| CertInfo::from(&record))
            .ok_or_else(|| TeamError::not_found("certificate", user.name.clone()))
    }
}
