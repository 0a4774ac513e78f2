use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use teamserver_core::{Result, TeamError};

/// Process-identity file held for the lifetime of a running server.
///
/// Removed on drop, so a file left behind marks a crashed instance.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

impl PidFile {
    /// Claims `path` for this process. Fails while another live process
    /// holds it; a stale file is replaced.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Ok(contents) = fs::read_to_string(path) {
            match contents.trim().parse::<i32>() {
                Ok(pid) if pid > 0 && pid as u32 != std::process::id() && process_alive(pid) => {
                    return Err(TeamError::Configuration(format!(
                        "server already running with pid {} ({})",
                        pid,
                        path.display()
                    )));
                }
                _ => warn!(path = %path.display(), "replacing stale pid file"),
            }
        }

        fs::write(path, format!("{}\n", std::process::id()))?;
        debug!(path = %path.display(), "pid file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
        }
    }
}
