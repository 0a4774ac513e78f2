use thiserror::Error;

#[derive(Error, Debug)]
pub enum TeamError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    Conflict { kind: &'static str, name: String },

    #[error("Invite token already consumed")]
    AlreadyConsumed,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Audit log write failed: {0}")]
    AuditWrite(String),

    #[error("Certificate authority error: {0}")]
    CertificateAuthority(String),

    #[error("Remote command failed: {0}")]
    Remote(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TeamError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        TeamError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
        TeamError::Conflict {
            kind,
            name: name.into(),
        }
    }
}

impl From<std::io::Error> for TeamError {
    fn from(err: std::io::Error) -> Self {
        TeamError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TeamError>;
