use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};
use zeroize::Zeroizing;

use teamserver_core::{AuditAction, Environment, NewAuditEntry, Result, TeamError};

use crate::access::AccessControl;
use crate::ca::CertificateAuthority;
use crate::storage::Store;

pub const BLOCK_BEGIN: &str = "# BEGIN TEAMSERVER MANAGED BLOCK";
pub const BLOCK_END: &str = "# END TEAMSERVER MANAGED BLOCK";

const READ_AUTHORIZED_KEYS: &str = "cat ~/.ssh/authorized_keys 2>/dev/null || true";

/// Where and as whom to run a remote command.
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key: Zeroizing<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Connects to a host with a credential and runs one command.
///
/// Returns `Err` when no session could be established; a command that ran
/// and failed comes back as `Ok` with a non-zero status.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn exec(&self, target: &RemoteTarget, command: &str) -> Result<RemoteOutput>;
}

/// Runs commands through the system `ssh` client.
pub struct OpenSshExecutor {
    ssh_binary: String,
    connect_timeout: Duration,
    strict_host_key_checking: bool,
}

impl OpenSshExecutor {
    pub fn new(
        ssh_binary: String,
        connect_timeout: Duration,
        strict_host_key_checking: bool,
    ) -> Self {
        Self {
            ssh_binary,
            connect_timeout,
            strict_host_key_checking,
        }
    }
}

#[async_trait]
impl RemoteExecutor for OpenSshExecutor {
    async fn exec(&self, target: &RemoteTarget, command: &str) -> Result<RemoteOutput> {
        // tempfile creates the file 0600, which ssh insists on for identities
        let mut key_file = tempfile::NamedTempFile::new()?;
        key_file.write_all(target.private_key.as_bytes())?;
        key_file.flush()?;

        let host_key_policy = if self.strict_host_key_checking {
            "StrictHostKeyChecking=yes"
        } else {
            "StrictHostKeyChecking=accept-new"
        };

        let output = Command::new(&self.ssh_binary)
            .arg("-i")
            .arg(key_file.path())
            .arg("-p")
            .arg(target.port.to_string())
            .args(["-o", "BatchMode=yes", "-o", "IdentitiesOnly=yes", "-o", host_key_policy])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg(format!("{}@{}", target.user, target.host))
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TeamError::Remote(format!("failed to run ssh: {}", e)))?;

        let status = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        // ssh reserves 255 for its own connection and authentication errors
        if status == 255 {
            return Err(TeamError::Remote(format!(
                "ssh to {}:{} failed: {}",
                target.host, target.port, stderr
            )));
        }

        Ok(RemoteOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}

/// Replaces the managed block inside an `authorized_keys` file with `lines`.
///
/// Lines outside the block are preserved in order. The block stays where it
/// was; a file without one gets it appended. An unterminated block is
/// refused rather than guessed at.
pub fn render_authorized_keys(existing: &str, lines: &[String]) -> Result<String> {
    let mut before = Vec::new();
    let mut after = Vec::new();
    let mut state = 0; // 0: before block, 1: inside, 2: after

    for line in existing.lines() {
        match state {
            0 if line.trim() == BLOCK_BEGIN => state = 1,
            0 => before.push(line),
            1 if line.trim() == BLOCK_END => state = 2,
            1 => {}
            _ => {
                if line.trim() == BLOCK_BEGIN || line.trim() == BLOCK_END {
                    return Err(TeamError::Validation(
                        "authorized_keys contains more than one managed block".to_string(),
                    ));
                }
                after.push(line);
            }
        }
    }

    if state == 1 {
        return Err(TeamError::Validation(
            "authorized_keys has an unterminated managed block".to_string(),
        ));
    }
    if state == 0 {
        while before.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
            before.pop();
        }
    }

    let mut out = String::new();
    for line in &before {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(BLOCK_BEGIN);
    out.push('\n');
    for line in lines {
        out.push_str(line.trim());
        out.push('\n');
    }
    out.push_str(BLOCK_END);
    out.push('\n');
    for line in &after {
        out.push_str(line);
        out.push('\n');
    }
    Ok(out)
}

/// Shell command that atomically replaces `~/.ssh/authorized_keys`.
fn write_authorized_keys_command(content: &str) -> String {
    format!(
        "umask 077 && mkdir -p ~/.ssh \
         && printf '%s' '{}' | base64 -d > ~/.ssh/authorized_keys.teamserver \
         && mv -f ~/.ssh/authorized_keys.teamserver ~/.ssh/authorized_keys",
        BASE64.encode(content.as_bytes())
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub environment: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn summary(&self) -> String {
        let failed: Vec<&str> = self.failed.iter().map(|f| f.environment.as_str()).collect();
        format!(
            "succeeded [{}] failed [{}]",
            self.succeeded.join(","),
            failed.join(",")
        )
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub ca_enabled: bool,
    pub timeout: Duration,
    pub max_parallel: usize,
}

/// Pushes access decisions out to hosts.
///
/// Each environment is handled on its own under a timeout: one unreachable
/// host shows up as a failure entry and never blocks the others.
pub struct Synchronizer {
    store: Arc<Store>,
    access: Arc<AccessControl>,
    ca: Arc<CertificateAuthority>,
    executor: Arc<dyn RemoteExecutor>,
    settings: SyncSettings,
}

impl Synchronizer {
    pub fn new(
        store: Arc<Store>,
        access: Arc<AccessControl>,
        ca: Arc<CertificateAuthority>,
        executor: Arc<dyn RemoteExecutor>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            access,
            ca,
            executor,
            settings,
        }
    }

    async fn targets(&self, environment: Option<&str>) -> Result<Vec<Environment>> {
        match environment {
            Some(qualified) => {
                let (project, name) = qualified.split_once('/').ok_or_else(|| {
                    TeamError::Validation("environment must be given as project/name".to_string())
                })?;
                Ok(vec![self.store.get_environment(project, name).await?])
            }
            None => self.store.list_environments(None).await,
        }
    }

    /// Lines for the managed block of one environment.
    async fn managed_lines(&self, env: &Environment) -> Result<Vec<String>> {
        if self.settings.ca_enabled {
            let ca_key = self.ca.public_key().await?.ok_or_else(|| {
                TeamError::CertificateAuthority("no CA key configured".to_string())
            })?;
            return Ok(vec![format!("cert-authority {}", ca_key.trim())]);
        }

        Ok(self
            .access
            .authorized_users(env)
            .await?
            .into_iter()
            .map(|user| user.public_key)
            .collect())
    }

    async fn sync_environment(&self, env: &Environment) -> Result<()> {
        let lines = self.managed_lines(env).await?;
        let target = RemoteTarget {
            host: env.host.clone(),
            port: env.port,
            user: env.deploy_user.clone(),
            private_key: self.store.deploy_key(env).await?,
        };

        let current = self.executor.exec(&target, READ_AUTHORIZED_KEYS).await?;
        if !current.success() {
            return Err(TeamError::Remote(format!(
                "reading authorized_keys exited with {}",
                current.status
            )));
        }

        let updated = render_authorized_keys(&current.stdout, &lines)?;
        if updated == current.stdout {
            return Ok(());
        }

        let written = self
            .executor
            .exec(&target, &write_authorized_keys_command(&updated))
            .await?;
        if !written.success() {
            return Err(TeamError::Remote(format!(
                "writing authorized_keys exited with {}",
                written.status
            )));
        }
        Ok(())
    }

    async fn sync_one(&self, env: Environment) -> std::result::Result<String, SyncFailure> {
        let qualified = env.qualified_name();
        let outcome =
            tokio::time::timeout(self.settings.timeout, self.sync_environment(&env)).await;

        let error = match outcome {
            Ok(Ok(())) => {
                info!(environment = %qualified, "environment synchronized");
                return Ok(qualified);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}s", self.settings.timeout.as_secs()),
        };

        warn!(environment = %qualified, error = %error, "environment sync failed");
        Err(SyncFailure {
            environment: qualified,
            error,
        })
    }

    /// Synchronizes one environment (`project/name`) or all of them.
    pub async fn sync(
        &self,
        environment: Option<&str>,
        actor: &str,
        source_ip: Option<String>,
    ) -> Result<SyncReport> {
        let targets = self.targets(environment).await?;
        let names: Vec<String> = targets.iter().map(|e| e.qualified_name()).collect();

        // Recorded before any host is touched so an unaudited sync cannot run
        self.store
            .append_audit(
                NewAuditEntry::new(AuditAction::Sync, format!("started [{}]", names.join(",")))
                    .by(actor)
                    .from_ip(source_ip.clone()),
            )
            .await?;

        let outcomes: Vec<_> = stream::iter(targets)
            .map(|env| self.sync_one(env))
            .buffer_unordered(self.settings.max_parallel.max(1))
            .collect()
            .await;

        let mut report = SyncReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(name) => report.succeeded.push(name),
                Err(failure) => report.failed.push(failure),
            }
        }
        report.succeeded.sort();
        report.failed.sort_by(|a, b| a.environment.cmp(&b.environment));

        self.store
            .append_audit(
                NewAuditEntry::new(AuditAction::Sync, report.summary())
                    .by(actor)
                    .from_ip(source_ip),
            )
            .await?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_block_appended_to_plain_file() {
        let existing = "ssh-ed25519 AAAA personal\n\n";
        let rendered =
            render_authorized_keys(existing, &lines(&["ssh-ed25519 BBBB alice"])).unwrap();

        assert_eq!(
            rendered,
            format!(
                "ssh-ed25519 AAAA personal\n{}\nssh-ed25519 BBBB alice\n{}\n",
                BLOCK_BEGIN, BLOCK_END
            )
        );
    }

    #[test]
    fn test_block_replaced_in_place() {
        let existing = format!(
            "ssh-rsa AAAA first\n{}\nssh-ed25519 OLD bob\n{}\nssh-rsa AAAA last\n",
            BLOCK_BEGIN, BLOCK_END
        );
        let rendered =
            render_authorized_keys(&existing, &lines(&["ssh-ed25519 NEW alice"])).unwrap();

        assert_eq!(
            rendered,
            format!(
                "ssh-rsa AAAA first\n{}\nssh-ed25519 NEW alice\n{}\nssh-rsa AAAA last\n",
                BLOCK_BEGIN, BLOCK_END
            )
        );
    }

    #[test]
    fn test_empty_block_removes_managed_keys_only() {
        let existing = format!("keep-me\n{}\nssh-ed25519 OLD bob\n{}\n", BLOCK_BEGIN, BLOCK_END);
        let rendered = render_authorized_keys(&existing, &[]).unwrap();

        assert!(rendered.contains("keep-me"));
        assert!(!rendered.contains("OLD"));
    }

    #[test]
    fn test_render_is_idempotent() {
        let once = render_authorized_keys("other\n", &lines(&["k1", "k2"])).unwrap();
        let twice = render_authorized_keys(&once, &lines(&["k1", "k2"])).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unterminated_block_refused() {
        let existing = format!("keep\n{}\nssh-ed25519 OLD\n", BLOCK_BEGIN);
        assert!(render_authorized_keys(&existing, &[]).is_err());
    }

    #[test]
    fn test_write_command_is_quoted_safely() {
        let command = write_authorized_keys_command("it's got 'quotes'\n");
        let encoded = BASE64.encode("it's got 'quotes'\n");
        assert!(command.contains(&format!("'{}'", encoded)));
        assert_eq!(command.matches('\'').count(), 4);
    }
}
