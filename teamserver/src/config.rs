use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use teamserver_core::{MasterKey, Result, TeamError};

use crate::session::SessionSettings;
use crate::sync::SyncSettings;

pub const CONFIG_FILE: &str = "teamserver.toml";
pub const DATABASE_FILE: &str = "teamserver.db";
pub const PID_FILE: &str = "teamserver.pid";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamServerConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub auth: AuthConfig,
    pub ca: CaConfig,
    pub sync: SyncConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_grace_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Hex-encoded 256-bit master key.
    pub master_key: String,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("master_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub admin_token_hash: String,
    pub session_ttl_hours: i64,
    pub invite_ttl_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaConfig {
    pub enabled: bool,
    pub cert_ttl_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub timeout_secs: u64,
    pub max_parallel: usize,
    pub ssh_binary: String,
    pub strict_host_key_checking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per minute per client IP; 0 disables limiting.
    pub per_minute: u32,
    pub trust_forwarded_for: bool,
}

impl Default for TeamServerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8443,
                shutdown_grace_secs: 30,
            },
            security: SecurityConfig {
                master_key: String::new(),
            },
            auth: AuthConfig {
                admin_token_hash: String::new(),
                session_ttl_hours: 720,
                invite_ttl_hours: 72,
            },
            ca: CaConfig {
                enabled: true,
                cert_ttl_hours: 24,
            },
            sync: SyncConfig {
                timeout_secs: 30,
                max_parallel: 8,
                ssh_binary: "ssh".to_string(),
                strict_host_key_checking: false,
            },
            rate_limit: RateLimitConfig {
                per_minute: 30,
                trust_forwarded_for: false,
            },
        }
    }
}

fn config_err(e: config::ConfigError) -> TeamError {
    TeamError::Configuration(e.to_string())
}

/// `~/.teamserver`, or `./.teamserver` when no home directory is known.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".teamserver")
}

impl TeamServerConfig {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE)
    }

    pub fn exists(data_dir: &Path) -> bool {
        Self::path(data_dir).exists()
    }

    /// Layers defaults, `<data_dir>/teamserver.toml`, then `TEAMSERVER__*`
    /// environment variables (e.g. `TEAMSERVER__SERVER__PORT`).
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = Self::path(data_dir);
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default()).map_err(config_err)?)
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("TEAMSERVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_err)?;

        config.try_deserialize().map_err(config_err)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(TeamError::Configuration("server port must be non-zero".to_string()));
        }

        if self.security.master_key.is_empty() {
            return Err(TeamError::Configuration("master key is not set".to_string()));
        }
        MasterKey::from_hex(&self.security.master_key)?;

        if self.auth.admin_token_hash.len() != 64
            || hex::decode(&self.auth.admin_token_hash).is_err()
        {
            return Err(TeamError::Configuration(
                "admin token hash is missing or malformed".to_string(),
            ));
        }

        if self.auth.session_ttl_hours <= 0 || self.auth.invite_ttl_hours <= 0 {
            return Err(TeamError::Configuration("token TTLs must be positive".to_string()));
        }

        if self.ca.cert_ttl_hours <= 0 {
            return Err(TeamError::Configuration("certificate TTL must be positive".to_string()));
        }

        if self.sync.timeout_secs == 0 {
            return Err(TeamError::Configuration("sync timeout must be non-zero".to_string()));
        }

        if self.sync.max_parallel == 0 {
            return Err(TeamError::Configuration("sync parallelism must be non-zero".to_string()));
        }

        Ok(())
    }

    /// Writes the config file readable by the owner only; it holds the
    /// master key.
    pub fn write(&self, data_dir: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| TeamError::Configuration(e.to_string()))?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(Self::path(data_dir))?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn master_key(&self) -> Result<MasterKey> {
        MasterKey::from_hex(&self.security.master_key)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            invite_ttl: chrono::Duration::hours(self.auth.invite_ttl_hours),
            session_ttl: chrono::Duration::hours(self.auth.session_ttl_hours),
            ca_enabled: self.ca.enabled,
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            ca_enabled: self.ca.enabled,
            timeout: Duration::from_secs(self.sync.timeout_secs),
            max_parallel: self.sync.max_parallel,
        }
    }

    pub fn cert_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ca.cert_ttl_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn initialized() -> TeamServerConfig {
        let mut config = TeamServerConfig::default();
        config.security.master_key = MasterKey::generate().to_hex();
        config.auth.admin_token_hash = "ab".repeat(32);
        config
    }

    #[test]
    fn test_defaults_need_initialization() {
        assert!(TeamServerConfig::default().validate().is_err());
        assert!(initialized().validate().is_ok());
    }

    #[test]
    fn test_validation_rules() {
        let mut config = initialized();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = initialized();
        config.security.master_key = "not-hex".to_string();
        assert!(config.validate().is_err());

        let mut config = initialized();
        config.auth.admin_token_hash = "short".to_string();
        assert!(config.validate().is_err());

        let mut config = initialized();
        config.sync.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_written_file_loads_back_private() {
        let dir = TempDir::new().unwrap();
        let mut config = initialized();
        config.server.port = 9100;
        config.ca.enabled = false;
        config.write(dir.path()).unwrap();

        let mode = std::fs::metadata(TeamServerConfig::path(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        let loaded = TeamServerConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.server.port, 9100);
        assert!(!loaded.ca.enabled);
        assert_eq!(loaded.security.master_key, config.security.master_key);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = TeamServerConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.server.port, TeamServerConfig::default().server.port);
        assert!(!TeamServerConfig::exists(dir.path()));
    }
}
