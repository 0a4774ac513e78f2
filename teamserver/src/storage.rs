use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use teamserver_core::{
    integrity::{chain_hash, serialize_entry, GENESIS_HASH},
    models::{CertificateRecord, Invite, Session},
    AuditAction, AuditEntry, Environment, NewAuditEntry, Project, Result, Role, Sealer,
    TeamError, User,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 8;

const USER_COLUMNS: &str = "u.id, u.name, u.email, u.role, u.public_key, u.mfa_enabled, \
     u.expires_at, u.created_by, u.created_at, u.last_access";

const ENVIRONMENT_COLUMNS: &str = "e.id, p.name AS project, e.name, e.host, e.port, \
     e.deploy_user, e.allowed_roles, e.created_by, e.created_at";

fn storage_err(e: sqlx::Error) -> TeamError {
    TeamError::Storage(e.to_string())
}

fn audit_err(e: sqlx::Error) -> TeamError {
    TeamError::AuditWrite(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

fn to_ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

fn from_ts(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| TeamError::Storage(format!("invalid timestamp {}", ts)))
}

fn from_opt_ts(ts: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ts.map(from_ts).transpose()
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let role: String = row.try_get("role").map_err(storage_err)?;
    Ok(User {
        id: row.try_get("id").map_err(storage_err)?,
        name: row.try_get("name").map_err(storage_err)?,
        email: row.try_get("email").map_err(storage_err)?,
        role: role.parse()?,
        public_key: row.try_get("public_key").map_err(storage_err)?,
        mfa_enabled: row.try_get("mfa_enabled").map_err(storage_err)?,
        expires_at: from_opt_ts(row.try_get("expires_at").map_err(storage_err)?)?,
        created_by: row.try_get("created_by").map_err(storage_err)?,
        created_at: from_ts(row.try_get("created_at").map_err(storage_err)?)?,
        last_access: from_opt_ts(row.try_get("last_access").map_err(storage_err)?)?,
    })
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id").map_err(storage_err)?,
        name: row.try_get("name").map_err(storage_err)?,
        description: row.try_get("description").map_err(storage_err)?,
        created_by: row.try_get("created_by").map_err(storage_err)?,
        created_at: from_ts(row.try_get("created_at").map_err(storage_err)?)?,
    })
}

fn environment_from_row(row: &SqliteRow) -> Result<Environment> {
    let port: i64 = row.try_get("port").map_err(storage_err)?;
    let allowed_roles: Option<String> = row.try_get("allowed_roles").map_err(storage_err)?;
    let allowed_roles = match allowed_roles {
        Some(json) => Some(
            serde_json::from_str::<Vec<Role>>(&json)
                .map_err(|e| TeamError::Storage(e.to_string()))?,
        ),
        None => None,
    };

    Ok(Environment {
        id: row.try_get("id").map_err(storage_err)?,
        project: row.try_get("project").map_err(storage_err)?,
        name: row.try_get("name").map_err(storage_err)?,
        host: row.try_get("host").map_err(storage_err)?,
        port: u16::try_from(port)
            .map_err(|_| TeamError::Storage(format!("invalid port {}", port)))?,
        deploy_user: row.try_get("deploy_user").map_err(storage_err)?,
        allowed_roles,
        created_by: row.try_get("created_by").map_err(storage_err)?,
        created_at: from_ts(row.try_get("created_at").map_err(storage_err)?)?,
    })
}

fn invite_from_row(row: &SqliteRow) -> Result<Invite> {
    let role: String = row.try_get("role").map_err(storage_err)?;
    Ok(Invite {
        id: row.try_get("id").map_err(storage_err)?,
        user_name: row.try_get("user_name").map_err(storage_err)?,
        email: row.try_get("email").map_err(storage_err)?,
        role: role.parse()?,
        user_expires_at: from_opt_ts(row.try_get("user_expires_at").map_err(storage_err)?)?,
        expires_at: from_ts(row.try_get("expires_at").map_err(storage_err)?)?,
        consumed_at: from_opt_ts(row.try_get("consumed_at").map_err(storage_err)?)?,
        created_by: row.try_get("created_by").map_err(storage_err)?,
        created_at: from_ts(row.try_get("created_at").map_err(storage_err)?)?,
    })
}

fn certificate_from_row(row: &SqliteRow) -> Result<CertificateRecord> {
    let serial: i64 = row.try_get("serial").map_err(storage_err)?;
    let principals: String = row.try_get("principals").map_err(storage_err)?;
    Ok(CertificateRecord {
        serial: serial as u64,
        user_name: row.try_get("user_name").map_err(storage_err)?,
        principals: serde_json::from_str(&principals)
            .map_err(|e| TeamError::Storage(e.to_string()))?,
        valid_after: from_ts(row.try_get("valid_after").map_err(storage_err)?)?,
        valid_before: from_ts(row.try_get("valid_before").map_err(storage_err)?)?,
        certificate: row.try_get("certificate").map_err(storage_err)?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    let action: String = row.try_get("action").map_err(storage_err)?;
    Ok(AuditEntry {
        id: row.try_get("id").map_err(storage_err)?,
        timestamp: from_ts(row.try_get("timestamp").map_err(storage_err)?)?,
        user: row.try_get("user").map_err(storage_err)?,
        action: action.parse()?,
        details: row.try_get("details").map_err(storage_err)?,
        source_ip: row.try_get("source_ip").map_err(storage_err)?,
        hash: row.try_get("hash").map_err(storage_err)?,
    })
}

/// Input for creating an environment. The deploy key is plaintext here and
/// sealed before it reaches the database.
#[derive(Clone)]
pub struct NewEnvironment {
    pub project: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub deploy_user: String,
    pub deploy_key: Zeroizing<String>,
    pub allowed_roles: Option<Vec<Role>>,
    pub created_by: String,
}

#[derive(Debug, Clone)]
pub struct NewInvite {
    pub token_hash: String,
    pub user_name: String,
    pub email: String,
    pub role: Role,
    pub user_expires_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub user: Option<String>,
    pub action: Option<AuditAction>,
    pub limit: Option<u32>,
}

/// Durable record store backed by SQLite.
///
/// Every mutation commits in the same transaction as its audit entry, and
/// mutations are serialized through `writer` so the audit chain never forks.
/// Reads go straight to the pool and run concurrently.
pub struct Store {
    pool: SqlitePool,
    sealer: Sealer,
    writer: Mutex<()>,
}

impl Store {
    pub async fn open(path: &Path, sealer: Sealer) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(storage_err)?;

        Self::from_pool(pool, sealer).await
    }

    pub async fn from_pool(pool: SqlitePool, sealer: Sealer) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| TeamError::Storage(e.to_string()))?;

        Ok(Self {
            pool,
            sealer,
            writer: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ---- audit -------------------------------------------------------------

    async fn append_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        entry: NewAuditEntry,
    ) -> Result<AuditEntry> {
        let last = sqlx::query("SELECT id, hash FROM audit_log ORDER BY id DESC LIMIT 1")
            .fetch_optional(&mut **tx)
            .await
            .map_err(audit_err)?;

        let (prev_id, prev_hash) = match last {
            Some(row) => (
                row.try_get::<i64, _>("id").map_err(audit_err)?,
                row.try_get::<String, _>("hash").map_err(audit_err)?,
            ),
            None => (0, GENESIS_HASH.to_string()),
        };

        let id = prev_id + 1;
        let timestamp = Utc::now().timestamp();
        let payload = serialize_entry(
            id,
            timestamp,
            entry.user.as_deref(),
            entry.action,
            &entry.details,
            entry.source_ip.as_deref(),
        )?;
        let hash = chain_hash(&prev_hash, &payload);

        sqlx::query(
            "INSERT INTO audit_log (id, timestamp, user, action, details, source_ip, hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(id)
        .bind(timestamp)
        .bind(&entry.user)
        .bind(entry.action.as_str())
        .bind(&entry.details)
        .bind(&entry.source_ip)
        .bind(&hash)
        .execute(&mut **tx)
        .await
        .map_err(audit_err)?;

        Ok(AuditEntry {
            id,
            timestamp: from_ts(timestamp)?,
            user: entry.user,
            action: entry.action,
            details: entry.details,
            source_ip: entry.source_ip,
            hash,
        })
    }

    /// Appends a standalone audit entry. Reading the previous hash and writing
    /// the new entry happen as one unit.
    pub async fn append_audit(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(audit_err)?;
        let appended = Self::append_in_tx(&mut tx, entry).await?;
        tx.commit().await.map_err(audit_err)?;
        Ok(appended)
    }

    pub async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut sql = String::from(
            "SELECT id, timestamp, user, action, details, source_ip, hash FROM audit_log WHERE 1=1",
        );
        if query.from.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if query.to.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        if query.user.is_some() {
            sql.push_str(" AND user = ?");
        }
        if query.action.is_some() {
            sql.push_str(" AND action = ?");
        }
        sql.push_str(" ORDER BY id ASC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut q = sqlx::query(&sql);
        if let Some(from) = query.from {
            q = q.bind(to_ts(from));
        }
        if let Some(to) = query.to {
            q = q.bind(to_ts(to));
        }
        if let Some(user) = &query.user {
            q = q.bind(user.clone());
        }
        if let Some(action) = query.action {
            q = q.bind(action.as_str());
        }

        let rows = q.fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter().map(audit_from_row).collect()
    }

    /// The whole log in chain order.
    pub async fn audit_chain(&self) -> Result<Vec<AuditEntry>> {
        self.query_audit(&AuditQuery::default()).await
    }

    // ---- users -------------------------------------------------------------

    pub async fn get_user(&self, name: &str) -> Result<User> {
        let row = sqlx::query(&format!("SELECT {} FROM users u WHERE u.name = ?1", USER_COLUMNS))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        match row {
            Some(row) => user_from_row(&row),
            None => Err(TeamError::not_found("user", name)),
        }
    }

    pub async fn user_exists(&self, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.is_some())
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!("SELECT {} FROM users u ORDER BY u.name", USER_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(user_from_row).collect()
    }

    pub async fn set_user_expiry(
        &self,
        name: &str,
        expires_at: Option<DateTime<Utc>>,
        audit: NewAuditEntry,
    ) -> Result<User> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let result = sqlx::query("UPDATE users SET expires_at = ?1 WHERE name = ?2")
            .bind(expires_at.map(to_ts))
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(TeamError::not_found("user", name));
        }

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)?;

        self.get_user(name).await
    }

    /// Removes a user together with their grants and sessions. Certificates
    /// already issued are left in place and expire on their own.
    pub async fn delete_user(&self, name: &str, audit: NewAuditEntry) -> Result<()> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let result = sqlx::query("DELETE FROM users WHERE name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(TeamError::not_found("user", name));
        }

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)
    }

    pub async fn touch_user(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET last_access = ?1 WHERE id = ?2")
            .bind(Utc::now().timestamp())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Users holding a grant on `project`.
    pub async fn users_with_access(&self, project: &str) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM users u \
             WHERE EXISTS ( \
                 SELECT 1 FROM grants g JOIN projects p ON p.id = g.project_id \
                 WHERE g.user_id = u.id AND p.name = ?1) \
             ORDER BY u.name",
            USER_COLUMNS
        ))
        .bind(project)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(user_from_row).collect()
    }

    // ---- projects ----------------------------------------------------------

    pub async fn create_project(
        &self,
        name: &str,
        description: &str,
        created_by: &str,
        audit: NewAuditEntry,
    ) -> Result<Project> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO projects (name, description, created_by, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(name)
        .bind(description)
        .bind(created_by)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TeamError::conflict("project", name)
            } else {
                storage_err(e)
            }
        })?;

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)?;

        self.get_project(name).await
    }

    pub async fn get_project(&self, name: &str) -> Result<Project> {
        let row = sqlx::query(
            "SELECT id, name, description, created_by, created_at FROM projects WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => project_from_row(&row),
            None => Err(TeamError::not_found("project", name)),
        }
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, name, description, created_by, created_at FROM projects ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(project_from_row).collect()
    }

    /// Deletes a project; its environments and grants go with it.
    pub async fn delete_project(&self, name: &str, audit: NewAuditEntry) -> Result<()> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let result = sqlx::query("DELETE FROM projects WHERE name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(TeamError::not_found("project", name));
        }

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)
    }

    /// Projects a user holds explicit grants on.
    pub async fn granted_projects(&self, user_id: i64) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT p.id, p.name, p.description, p.created_by, p.created_at \
             FROM projects p JOIN grants g ON g.project_id = p.id \
             WHERE g.user_id = ?1 ORDER BY p.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(project_from_row).collect()
    }

    // ---- grants ------------------------------------------------------------

    pub async fn grant_access(
        &self,
        user: &str,
        project: &str,
        granted_by: &str,
        audit: NewAuditEntry,
    ) -> Result<()> {
        let user_id = self.get_user(user).await?.id;
        let project_id = self.get_project(project).await?.id;

        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO grants (user_id, project_id, granted_by, granted_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(user_id)
        .bind(project_id)
        .bind(granted_by)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TeamError::conflict("grant", format!("{} -> {}", user, project))
            } else {
                storage_err(e)
            }
        })?;

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)
    }

    pub async fn revoke_access(
        &self,
        user: &str,
        project: &str,
        audit: NewAuditEntry,
    ) -> Result<()> {
        let user_id = self.get_user(user).await?.id;
        let project_id = self.get_project(project).await?.id;

        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let result = sqlx::query("DELETE FROM grants WHERE user_id = ?1 AND project_id = ?2")
            .bind(user_id)
            .bind(project_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(TeamError::not_found("grant", format!("{} -> {}", user, project)));
        }

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)
    }

    // ---- environments ------------------------------------------------------

    pub async fn create_environment(
        &self,
        env: NewEnvironment,
        audit: NewAuditEntry,
    ) -> Result<Environment> {
        let project_id = self.get_project(&env.project).await?.id;
        let sealed_key = self.sealer.seal_str(&env.deploy_key)?;
        let allowed_roles = match &env.allowed_roles {
            Some(roles) => {
                Some(serde_json::to_string(roles).map_err(|e| TeamError::Internal(e.to_string()))?)
            }
            None => None,
        };

        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO environments \
             (project_id, name, host, port, deploy_user, deploy_key, allowed_roles, \
              created_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(project_id)
        .bind(&env.name)
        .bind(&env.host)
        .bind(env.port as i64)
        .bind(&env.deploy_user)
        .bind(sealed_key)
        .bind(allowed_roles)
        .bind(&env.created_by)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TeamError::conflict("environment", format!("{}/{}", env.project, env.name))
            } else {
                storage_err(e)
            }
        })?;

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)?;

        self.get_environment(&env.project, &env.name).await
    }

    pub async fn get_environment(&self, project: &str, name: &str) -> Result<Environment> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM environments e JOIN projects p ON p.id = e.project_id \
             WHERE p.name = ?1 AND e.name = ?2",
            ENVIRONMENT_COLUMNS
        ))
        .bind(project)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => environment_from_row(&row),
            None => Err(TeamError::not_found(
                "environment",
                format!("{}/{}", project, name),
            )),
        }
    }

    pub async fn list_environments(&self, project: Option<&str>) -> Result<Vec<Environment>> {
        let rows = match project {
            Some(project) => {
                sqlx::query(&format!(
                    "SELECT {} FROM environments e JOIN projects p ON p.id = e.project_id \
                     WHERE p.name = ?1 ORDER BY p.name, e.name",
                    ENVIRONMENT_COLUMNS
                ))
                .bind(project)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM environments e JOIN projects p ON p.id = e.project_id \
                     ORDER BY p.name, e.name",
                    ENVIRONMENT_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(storage_err)?;

        rows.iter().map(environment_from_row).collect()
    }

    /// Environments in projects the user holds explicit grants on.
    pub async fn granted_environments(&self, user_id: i64) -> Result<Vec<Environment>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM environments e JOIN projects p ON p.id = e.project_id \
             JOIN grants g ON g.project_id = p.id \
             WHERE g.user_id = ?1 ORDER BY p.name, e.name",
            ENVIRONMENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(environment_from_row).collect()
    }

    pub async fn delete_environment(
        &self,
        project: &str,
        name: &str,
        audit: NewAuditEntry,
    ) -> Result<()> {
        let env = self.get_environment(project, name).await?;

        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query("DELETE FROM environments WHERE id = ?1")
            .bind(env.id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)
    }

    /// Opens the sealed deploy key for an environment.
    pub async fn deploy_key(&self, env: &Environment) -> Result<Zeroizing<String>> {
        let row = sqlx::query("SELECT deploy_key FROM environments WHERE id = ?1")
            .bind(env.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| TeamError::not_found("environment", env.qualified_name()))?;

        let sealed: Vec<u8> = row.try_get("deploy_key").map_err(storage_err)?;
        Ok(Zeroizing::new(self.sealer.open_string(&sealed)?))
    }

    // ---- invites & sessions ------------------------------------------------

    pub async fn create_invite(&self, invite: NewInvite, audit: NewAuditEntry) -> Result<Invite> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let result = sqlx::query(
            "INSERT INTO invites \
             (token_hash, user_name, email, role, user_expires_at, expires_at, \
              created_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&invite.token_hash)
        .bind(&invite.user_name)
        .bind(&invite.email)
        .bind(invite.role.as_str())
        .bind(invite.user_expires_at.map(to_ts))
        .bind(to_ts(invite.expires_at))
        .bind(&invite.created_by)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        let id = result.last_insert_rowid();

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)?;

        let row = sqlx::query("SELECT * FROM invites WHERE id = ?1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        invite_from_row(&row)
    }

    pub async fn find_invite(&self, token_hash: &str) -> Result<Option<Invite>> {
        let row = sqlx::query("SELECT * FROM invites WHERE token_hash = ?1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(invite_from_row).transpose()
    }

    /// Consumes an invite and activates its user in one transaction.
    ///
    /// The conditional update on `consumed_at` makes the consumption the
    /// linearization point: of two concurrent joins on one token exactly one
    /// sees a changed row.
    pub async fn consume_invite(
        &self,
        token_hash: &str,
        public_key: &str,
        session_hash: &str,
        session_expires_at: DateTime<Utc>,
        audit: NewAuditEntry,
    ) -> Result<(User, Session)> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let now = Utc::now();

        let invite = sqlx::query("SELECT * FROM invites WHERE token_hash = ?1")
            .bind(token_hash)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
            .map(|row| invite_from_row(&row))
            .transpose()?
            .ok_or(TeamError::Unauthorized)?;

        if invite.consumed_at.is_some() {
            return Err(TeamError::AlreadyConsumed);
        }
        if invite.expires_at <= now {
            return Err(TeamError::Unauthorized);
        }

        let consumed = sqlx::query(
            "UPDATE invites SET consumed_at = ?1 WHERE id = ?2 AND consumed_at IS NULL",
        )
        .bind(to_ts(now))
        .bind(invite.id)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        if consumed.rows_affected() == 0 {
            return Err(TeamError::AlreadyConsumed);
        }

        let user_id = sqlx::query(
            "INSERT INTO users \
             (name, email, role, public_key, mfa_enabled, expires_at, created_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
        )
        .bind(&invite.user_name)
        .bind(&invite.email)
        .bind(invite.role.as_str())
        .bind(public_key)
        .bind(invite.user_expires_at.map(to_ts))
        .bind(&invite.created_by)
        .bind(to_ts(now))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TeamError::conflict("user", invite.user_name.clone())
            } else {
                storage_err(e)
            }
        })?
        .last_insert_rowid();

        let session_id = sqlx::query(
            "INSERT INTO sessions (token_hash, user_id, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(session_hash)
        .bind(user_id)
        .bind(to_ts(now))
        .bind(to_ts(session_expires_at))
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?
        .last_insert_rowid();

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)?;

        let user = self.get_user(&invite.user_name).await?;
        let session = Session {
            id: session_id,
            user_id,
            created_at: from_ts(to_ts(now))?,
            expires_at: from_ts(to_ts(session_expires_at))?,
        };
        Ok((user, session))
    }

    pub async fn find_session(&self, token_hash: &str) -> Result<Option<(Session, User)>> {
        let row = sqlx::query(&format!(
            "SELECT s.id AS session_id, s.created_at AS session_created_at, \
             s.expires_at AS session_expires_at, {} \
             FROM sessions s JOIN users u ON u.id = s.user_id WHERE s.token_hash = ?1",
            USER_COLUMNS
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let user = user_from_row(&row)?;
        let session = Session {
            id: row.try_get("session_id").map_err(storage_err)?,
            user_id: user.id,
            created_at: from_ts(row.try_get("session_created_at").map_err(storage_err)?)?,
            expires_at: from_ts(row.try_get("session_expires_at").map_err(storage_err)?)?,
        };
        Ok(Some((session, user)))
    }

    /// Drops expired sessions and lapsed, never-used invites.
    ///
    /// Consumed invites stay as tombstones so a replayed token keeps failing
    /// with `AlreadyConsumed`.
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let sessions = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        let invites = sqlx::query(
            "DELETE FROM invites WHERE consumed_at IS NULL AND expires_at <= ?1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(sessions.rows_affected() + invites.rows_affected())
    }

    // ---- certificate authority ---------------------------------------------

    pub async fn store_ca_key(
        &self,
        public_key: &str,
        private_key: &str,
        audit: NewAuditEntry,
    ) -> Result<()> {
        let sealed = self.sealer.seal_str(private_key)?;

        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO ca_keys (id, public_key, private_key, created_at) VALUES (1, ?1, ?2, ?3)",
        )
        .bind(public_key)
        .bind(sealed)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TeamError::conflict("ca key", "ca")
            } else {
                storage_err(e)
            }
        })?;

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)
    }

    pub async fn ca_public_key(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT public_key FROM ca_keys WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|row| row.try_get("public_key").map_err(storage_err))
            .transpose()
    }

    /// Opens the sealed CA private key, if one has been generated.
    pub async fn ca_private_key(&self) -> Result<Option<Zeroizing<String>>> {
        let row = sqlx::query("SELECT private_key FROM ca_keys WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        match row {
            Some(row) => {
                let sealed: Vec<u8> = row.try_get("private_key").map_err(storage_err)?;
                Ok(Some(Zeroizing::new(self.sealer.open_string(&sealed)?)))
            }
            None => Ok(None),
        }
    }

    pub async fn max_certificate_serial(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(MAX(serial), 0) AS serial FROM certificates")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let serial: i64 = row.try_get("serial").map_err(storage_err)?;
        Ok(serial as u64)
    }

    pub async fn record_certificate(
        &self,
        record: &CertificateRecord,
        audit: NewAuditEntry,
    ) -> Result<()> {
        let principals = serde_json::to_string(&record.principals)
            .map_err(|e| TeamError::Internal(e.to_string()))?;

        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO certificates \
             (serial, user_name, principals, valid_after, valid_before, certificate, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(record.serial as i64)
        .bind(&record.user_name)
        .bind(principals)
        .bind(to_ts(record.valid_after))
        .bind(to_ts(record.valid_before))
        .bind(&record.certificate)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        Self::append_in_tx(&mut tx, audit).await?;
        tx.commit().await.map_err(storage_err)
    }

    pub async fn latest_certificate(&self, user_name: &str) -> Result<Option<CertificateRecord>> {
        let row = sqlx::query(
            "SELECT serial, user_name, principals, valid_after, valid_before, certificate \
             FROM certificates WHERE user_name = ?1 ORDER BY serial DESC LIMIT 1",
        )
        .bind(user_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(certificate_from_row).transpose()
    }
}
