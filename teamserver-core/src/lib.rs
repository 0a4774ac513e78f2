pub mod crypto;
pub mod errors;
pub mod integrity;
pub mod models;

pub use crypto::{MasterKey, Sealer};
pub use errors::{Result, TeamError};
pub use integrity::{verify_chain, ChainReport, GENESIS_HASH};
pub use models::{
    validate_identifier, AuditAction, AuditEntry, Environment, NewAuditEntry, Project, Role, User,
};
