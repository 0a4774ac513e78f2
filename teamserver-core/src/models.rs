use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::TeamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Dev,
    Readonly,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Dev => "dev",
            Role::Readonly => "readonly",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = TeamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "dev" => Ok(Role::Dev),
            "readonly" => Ok(Role::Readonly),
            other => Err(TeamError::Validation(format!("unknown role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub public_key: String,
    pub mfa_enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_access: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

const MAX_IDENTIFIER_LEN: usize = 64;

/// Names that end up in SSH principals, key comments and `project/name`
/// targets: 1-64 chars of `[A-Za-z0-9._-]`, starting alphanumeric.
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), TeamError> {
    let valid = !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(TeamError::Validation(format!(
            "invalid {} name: must be 1-{} characters of letters, digits, '.', '_' or '-'",
            kind, MAX_IDENTIFIER_LEN
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A remote host reachable through a deploy account.
///
/// The deploy private key never leaves storage in this type; it is opened
/// only when a sync needs to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub deploy_user: String,
    pub allowed_roles: Option<Vec<Role>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Environment {
    /// `project/name`, the identifier operators use for sync targets.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.project, self.name)
    }

    pub fn admits_role(&self, role: Role) -> bool {
        match &self.allowed_roles {
            Some(roles) => roles.contains(&role),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub id: i64,
    pub user_name: String,
    pub email: String,
    pub role: Role,
    pub user_expires_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Record of a certificate the CA has signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub serial: u64,
    pub user_name: String,
    pub principals: Vec<String>,
    pub valid_after: DateTime<Utc>,
    pub valid_before: DateTime<Utc>,
    pub certificate: String,
}

impl CertificateRecord {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.valid_before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CaGenerate,
    UserInvite,
    UserJoin,
    UserRenew,
    UserRemove,
    AccessGrant,
    AccessRevoke,
    ProjectCreate,
    ProjectDelete,
    EnvironmentCreate,
    EnvironmentDelete,
    Sync,
    CertIssue,
    CertRenew,
    AuthFailure,
    ServerStart,
    ServerStop,
}

impl AuditAction {
    pub const ALL: [AuditAction; 17] = [
        AuditAction::CaGenerate,
        AuditAction::UserInvite,
        AuditAction::UserJoin,
        AuditAction::UserRenew,
        AuditAction::UserRemove,
        AuditAction::AccessGrant,
        AuditAction::AccessRevoke,
        AuditAction::ProjectCreate,
        AuditAction::ProjectDelete,
        AuditAction::EnvironmentCreate,
        AuditAction::EnvironmentDelete,
        AuditAction::Sync,
        AuditAction::CertIssue,
        AuditAction::CertRenew,
        AuditAction::AuthFailure,
        AuditAction::ServerStart,
        AuditAction::ServerStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::CaGenerate => "ca_generate",
            AuditAction::UserInvite => "user_invite",
            AuditAction::UserJoin => "user_join",
            AuditAction::UserRenew => "user_renew",
            AuditAction::UserRemove => "user_remove",
            AuditAction::AccessGrant => "access_grant",
            AuditAction::AccessRevoke => "access_revoke",
            AuditAction::ProjectCreate => "project_create",
            AuditAction::ProjectDelete => "project_delete",
            AuditAction::EnvironmentCreate => "environment_create",
            AuditAction::EnvironmentDelete => "environment_delete",
            AuditAction::Sync => "sync",
            AuditAction::CertIssue => "cert_issue",
            AuditAction::CertRenew => "cert_renew",
            AuditAction::AuthFailure => "auth_failure",
            AuditAction::ServerStart => "server_start",
            AuditAction::ServerStop => "server_stop",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = TeamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| TeamError::Validation(format!("unknown audit action: {}", s)))
    }
}

/// An audit event before it has been placed in the chain.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub user: Option<String>,
    pub action: AuditAction,
    pub details: String,
    pub source_ip: Option<String>,
}

impl NewAuditEntry {
    pub fn new(action: AuditAction, details: impl Into<String>) -> Self {
        Self {
            user: None,
            action,
            details: details.into(),
            source_ip: None,
        }
    }

    pub fn by(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn from_ip(mut self, source_ip: Option<String>) -> Self {
        self.source_ip = source_ip;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub user: Option<String>,
    pub action: AuditAction,
    pub details: String,
    pub source_ip: Option<String>,
    pub hash: String,
}
