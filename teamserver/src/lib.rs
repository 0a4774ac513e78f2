pub mod access;
pub mod api;
pub mod audit;
pub mod auth;
pub mod ca;
pub mod config;
pub mod pidfile;
pub mod ratelimit;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;

pub use access::AccessControl;
pub use api::create_api_server;
pub use audit::{AuditFilter, AuditLog};
pub use auth::AdminAuth;
pub use ca::{CertInfo, CertificateAuthority};
pub use config::TeamServerConfig;
pub use server::{initialize, InitOptions, TeamServer};
pub use session::{SessionManager, SessionSettings};
pub use storage::Store;
pub use sync::{RemoteExecutor, RemoteOutput, RemoteTarget, SyncReport, Synchronizer};
