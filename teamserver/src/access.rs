use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use teamserver_core::{AuditAction, Environment, NewAuditEntry, Project, Result, User};

use crate::storage::Store;

/// Role model and project-scoped grants.
///
/// A user's environments are the union of the environments in the projects
/// they are granted (every project for admins), narrowed by each
/// environment's optional role filter.
pub struct AccessControl {
    store: Arc<Store>,
}

impl AccessControl {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn grant(
        &self,
        user: &str,
        project: &str,
        actor: &str,
        source_ip: Option<String>,
    ) -> Result<()> {
        let audit = NewAuditEntry::new(
            AuditAction::AccessGrant,
            format!("granted {} access to project {}", user, project),
        )
        .by(actor)
        .from_ip(source_ip);

        self.store.grant_access(user, project, actor, audit).await?;
        info!(user, project, "access granted");
        Ok(())
    }

    pub async fn revoke(
        &self,
        user: &str,
        project: &str,
        actor: &str,
        source_ip: Option<String>,
    ) -> Result<()> {
        let audit = NewAuditEntry::new(
            AuditAction::AccessRevoke,
            format!("revoked {} access to project {}", user, project),
        )
        .by(actor)
        .from_ip(source_ip);

        self.store.revoke_access(user, project, audit).await?;
        info!(user, project, "access revoked");
        Ok(())
    }

    /// Projects granted to the user. The `admin` role grants server control,
    /// not project access.
    pub async fn projects_for(&self, user: &User) -> Result<Vec<Project>> {
        self.store.granted_projects(user.id).await
    }

    /// Environments the user may currently reach. Expired users reach none.
    pub async fn environments_for(&self, user: &User) -> Result<Vec<Environment>> {
        if user.is_expired() {
            return Ok(Vec::new());
        }

        Ok(self
            .store
            .granted_environments(user.id)
            .await?
            .into_iter()
            .filter(|env| env.admits_role(user.role))
            .collect())
    }

    /// Certificate principals: the deploy users of every reachable environment,
    /// sorted and de-duplicated.
    pub async fn principals_for(&self, user: &User) -> Result<Vec<String>> {
        let principals: BTreeSet<String> = self
            .environments_for(user)
            .await?
            .into_iter()
            .map(|env| env.deploy_user)
            .collect();
        Ok(principals.into_iter().collect())
    }

    /// Non-expired users allowed onto an environment.
    pub async fn authorized_users(&self, env: &Environment) -> Result<Vec<User>> {
        let now = Utc::now();
        Ok(self
            .store
            .users_with_access(&env.project)
            .await?
            .into_iter()
            .filter(|user| !user.is_expired_at(now) && env.admits_role(user.role))
            .collect())
    }
}
