use ssh_key::PrivateKey;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use zeroize::Zeroizing;

use teamserver_core::{
    validate_identifier, AuditAction, Environment, MasterKey, NewAuditEntry, Project, Result,
    Role, Sealer, TeamError,
};

use crate::access::AccessControl;
use crate::audit::AuditLog;
use crate::auth::AdminAuth;
use crate::ca::CertificateAuthority;
use crate::config::{TeamServerConfig, DATABASE_FILE};
use crate::ratelimit::ClientRateLimiter;
use crate::session::SessionManager;
use crate::storage::{NewEnvironment, Store};
use crate::sync::{OpenSshExecutor, RemoteExecutor, Synchronizer};

/// Actor recorded for operations performed with the admin token.
pub const ADMIN_ACTOR: &str = "admin";

/// Input for a new environment, before validation.
#[derive(Clone)]
pub struct EnvironmentDefinition {
    pub project: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub deploy_user: String,
    pub deploy_key: Zeroizing<String>,
    pub allowed_roles: Option<Vec<Role>>,
}

/// Every component of a running team server, wired together.
pub struct TeamServer {
    pub store: Arc<Store>,
    pub audit: Arc<AuditLog>,
    pub ca: Arc<CertificateAuthority>,
    pub access: Arc<AccessControl>,
    pub sessions: Arc<SessionManager>,
    pub sync: Arc<Synchronizer>,
    pub admin: AdminAuth,
    pub rate_limiter: ClientRateLimiter,
    pub ca_enabled: bool,
}

impl TeamServer {
    /// Opens the data directory of an initialized server.
    pub async fn open(config: &TeamServerConfig, data_dir: &Path) -> Result<Self> {
        config.validate()?;
        let sealer = Sealer::new(config.master_key()?);
        let store = Store::open(&data_dir.join(DATABASE_FILE), sealer).await?;

        let executor = Arc::new(OpenSshExecutor::new(
            config.sync.ssh_binary.clone(),
            Duration::from_secs(config.sync.timeout_secs),
            config.sync.strict_host_key_checking,
        ));
        Ok(Self::assemble(Arc::new(store), config, executor))
    }

    /// Wires components over an open store with the given remote executor.
    pub fn assemble(
        store: Arc<Store>,
        config: &TeamServerConfig,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let audit = Arc::new(AuditLog::new(store.clone()));
        let access = Arc::new(AccessControl::new(store.clone()));
        let ca = Arc::new(CertificateAuthority::new(store.clone(), config.cert_ttl()));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            access.clone(),
            ca.clone(),
            config.session_settings(),
        ));
        let sync = Arc::new(Synchronizer::new(
            store.clone(),
            access.clone(),
            ca.clone(),
            executor,
            config.sync_settings(),
        ));

        Self {
            store,
            audit,
            ca,
            access,
            sessions,
            sync,
            admin: AdminAuth::new(config.auth.admin_token_hash.clone()),
            rate_limiter: ClientRateLimiter::new(
                config.rate_limit.per_minute,
                config.rate_limit.trust_forwarded_for,
            ),
            ca_enabled: config.ca.enabled,
        }
    }

    pub async fn create_project(
        &self,
        name: &str,
        description: &str,
        source_ip: Option<String>,
    ) -> Result<Project> {
        validate_identifier("project", name)?;
        let details = format!("created project {}", name);
        let audit = NewAuditEntry::new(AuditAction::ProjectCreate, details)
            .by(ADMIN_ACTOR)
            .from_ip(source_ip);

        let project = self
            .store
            .create_project(name, description, ADMIN_ACTOR, audit)
            .await?;
        info!(project = %name, "project created");
        Ok(project)
    }

    /// Deletes a project together with its environments and grants.
    pub async fn delete_project(&self, name: &str, source_ip: Option<String>) -> Result<()> {
        let details = format!("deleted project {}", name);
        let audit = NewAuditEntry::new(AuditAction::ProjectDelete, details)
            .by(ADMIN_ACTOR)
            .from_ip(source_ip);

        self.store.delete_project(name, audit).await?;
        info!(project = %name, "project deleted");
        Ok(())
    }

    pub async fn create_environment(
        &self,
        definition: EnvironmentDefinition,
        source_ip: Option<String>,
    ) -> Result<Environment> {
        validate_identifier("environment", &definition.name)?;
        validate_identifier("deploy user", &definition.deploy_user)?;
        validate_host(&definition.host)?;
        if definition.port == 0 {
            return Err(TeamError::Validation("port must be non-zero".to_string()));
        }
        if matches!(&definition.allowed_roles, Some(roles) if roles.is_empty()) {
            return Err(TeamError::Validation(
                "allowed roles must name at least one role".to_string(),
            ));
        }
        PrivateKey::from_openssh(definition.deploy_key.as_bytes()).map_err(|_| {
            TeamError::Validation("deploy key is not an OpenSSH private key".to_string())
        })?;

        let qualified = format!("{}/{}", definition.project, definition.name);
        let audit = NewAuditEntry::new(
            AuditAction::EnvironmentCreate,
            format!(
                "created environment {} at {}@{}:{}",
                qualified, definition.deploy_user, definition.host, definition.port
            ),
        )
        .by(ADMIN_ACTOR)
        .from_ip(source_ip);

        let env = self
            .store
            .create_environment(
                NewEnvironment {
                    project: definition.project,
                    name: definition.name,
                    host: definition.host,
                    port: definition.port,
                    deploy_user: definition.deploy_user,
                    deploy_key: definition.deploy_key,
                    allowed_roles: definition.allowed_roles,
                    created_by: ADMIN_ACTOR.to_string(),
                },
                audit,
            )
            .await?;
        info!(environment = %qualified, "environment created");
        Ok(env)
    }

    pub async fn delete_environment(
        &self,
        project: &str,
        name: &str,
        source_ip: Option<String>,
    ) -> Result<()> {
        let audit = NewAuditEntry::new(
            AuditAction::EnvironmentDelete,
            format!("deleted environment {}/{}", project, name),
        )
        .by(ADMIN_ACTOR)
        .from_ip(source_ip);

        self.store.delete_environment(project, name, audit).await?;
        info!(environment = %format!("{}/{}", project, name), "environment deleted");
        Ok(())
    }

    /// Best-effort lifecycle marker; a failure here must not block start or stop.
    pub async fn record_lifecycle(&self, action: AuditAction, details: &str) {
        if let Err(e) = self.audit.append(NewAuditEntry::new(action, details)).await {
            tracing::warn!(%action, error = %e, "failed to record lifecycle event");
        }
    }
}

/// Hostnames and IP literals only; anything `ssh` could read as an option
/// is refused.
fn validate_host(host: &str) -> Result<()> {
    let valid = !host.is_empty()
        && host.len() <= 253
        && !host.starts_with('-')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
    if valid {
        Ok(())
    } else {
        Err(TeamError::Validation(format!("invalid host: {}", host)))
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub host: String,
    pub port: u16,
    pub ca_enabled: bool,
}

/// Secrets produced by initialization. Shown to the operator once.
pub struct Initialized {
    pub config: TeamServerConfig,
    pub admin_token: String,
    pub master_key: Zeroizing<String>,
    pub ca_public_key: Option<String>,
}

/// Creates a new data directory: master key, admin token, database and,
/// optionally, the CA keypair. Refuses to touch an initialized directory.
pub async fn initialize(data_dir: &Path, options: InitOptions) -> Result<Initialized> {
    if TeamServerConfig::exists(data_dir) {
        return Err(TeamError::Configuration(format!(
            "{} is already initialized",
            data_dir.display()
        )));
    }
    DirBuilder::new().recursive(true).mode(0o700).create(data_dir)?;

    let master_key = MasterKey::generate();
    let (admin_token, admin) = AdminAuth::generate();

    let mut config = TeamServerConfig::default();
    config.server.host = options.host;
    config.server.port = options.port;
    config.ca.enabled = options.ca_enabled;
    config.security.master_key = master_key.to_hex();
    config.auth.admin_token_hash = admin.token_hash().to_string();
    config.validate()?;

    let store = Arc::new(
        Store::open(&data_dir.join(DATABASE_FILE), Sealer::new(master_key.clone())).await?,
    );

    let ca_public_key = if options.ca_enabled {
        let ca = CertificateAuthority::new(store.clone(), config.cert_ttl());
        Some(ca.generate_ca_keypair(ADMIN_ACTOR).await?)
    } else {
        None
    };
    store.close().await;

    // Written last: its presence marks the directory as initialized
    config.write(data_dir)?;
    info!(data_dir = %data_dir.display(), ca = options.ca_enabled, "team server initialized");

    Ok(Initialized {
        config,
        admin_token,
        master_key: Zeroizing::new(master_key.to_hex()),
        ca_public_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(ca_enabled: bool) -> InitOptions {
        InitOptions {
            host: "127.0.0.1".to_string(),
            port: 9000,
            ca_enabled,
        }
    }

    #[tokio::test]
    async fn test_initialize_then_open() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");

        let init = initialize(&data_dir, options(true)).await.unwrap();
        assert!(init.admin_token.starts_with("tsa_"));
        assert_eq!(init.master_key.len(), 64);
        assert!(init.ca_public_key.as_deref().unwrap().starts_with("ssh-ed25519 "));

        let config = TeamServerConfig::load(&data_dir).unwrap();
        let server = TeamServer::open(&config, &data_dir).await.unwrap();
        assert!(server.admin.verify(&init.admin_token));
        assert_eq!(server.ca.public_key().await.unwrap(), init.ca_public_key);
    }

    #[tokio::test]
    async fn test_initialize_refuses_existing() {
        let dir = TempDir::new().unwrap();
        initialize(dir.path(), options(false)).await.unwrap();
        assert!(matches!(
            initialize(dir.path(), options(false)).await,
            Err(TeamError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_master_key_cannot_open_secrets() {
        let dir = TempDir::new().unwrap();
        initialize(dir.path(), options(true)).await.unwrap();

        let mut config = TeamServerConfig::load(dir.path()).unwrap();
        config.security.master_key = MasterKey::generate().to_hex();
        let server = TeamServer::open(&config, dir.path()).await.unwrap();

        let issued = server
            .ca
            .issue_certificate("alice", "ssh-ed25519 AAAA alice", &[], None)
            .await;
        assert!(matches!(issued, Err(TeamError::Decryption(_))));
    }

    #[test]
    fn test_host_validation() {
        assert!(validate_host("prod.example.com").is_ok());
        assert!(validate_host("10.0.0.5").is_ok());
        assert!(validate_host("[::1]").is_ok());
        assert!(validate_host("-oProxyCommand=sh").is_err());
        assert!(validate_host("a b").is_err());
        assert!(validate_host("").is_err());
    }
}
