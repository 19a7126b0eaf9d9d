//! Run commands on cluster nodes over SSH.
//!
//! [Ssh] wraps the system `ssh` and `scp` binaries and retries transient failures. The
//! implementations of the harness interfaces built on it ([SshNet], [SshClocks], and
//! [SshProvisioner]) only generate shell commands.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::{
    process::Command,
    time::{sleep, Duration},
};
use tracing::{debug, warn};

mod net;
pub use net::{SshClocks, SshNet};
mod provisioner;
pub use provisioner::{Commands, SshProvisioner};

/// Maximum number of SSH connection attempts before failing
pub const MAX_SSH_ATTEMPTS: usize = 10;

/// Interval between retries
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default remote user.
pub const DEFAULT_USER: &str = "root";

/// Connection settings shared by every node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_attempts")]
    pub attempts: usize,
}

fn default_user() -> String {
    DEFAULT_USER.to_string()
}

fn default_attempts() -> usize {
    MAX_SSH_ATTEMPTS
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            key_file: None,
            port: None,
            attempts: MAX_SSH_ATTEMPTS,
        }
    }
}

/// Executes commands on remote hosts.
#[derive(Clone, Debug)]
pub struct Ssh {
    config: SshConfig,
    retry: Duration,
}

impl Ssh {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            retry: RETRY_INTERVAL,
        }
    }

    /// Override the delay between attempts.
    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{}", self.config.user, host)
    }

    /// Common options for `ssh` (`port_flag` is `-p` for ssh and `-P` for scp).
    fn options(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(key_file) = &self.config.key_file {
            args.push("-i".to_string());
            args.push(key_file.display().to_string());
        }
        if let Some(port) = self.config.port {
            args.push(port_flag.to_string());
            args.push(port.to_string());
        }
        args
    }

    /// Arguments passed to `ssh` to run `command` on `host`.
    pub fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = self.options("-p");
        args.push(self.destination(host));
        args.push(command.to_string());
        args
    }

    /// Arguments passed to `scp` to copy `local` to `remote` on `host`.
    pub fn scp_args(&self, local: &Path, host: &str, remote: &str) -> Vec<String> {
        let mut args = self.options("-P");
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.destination(host), remote));
        args
    }

    /// Executes a command on a remote host via SSH with retries
    pub async fn execute(&self, host: &str, command: &str) -> Result<(), Error> {
        self.output(host, command).await.map(|_| ())
    }

    /// Executes a command on a remote host via SSH with retries, returning its stdout
    pub async fn output(&self, host: &str, command: &str) -> Result<String, Error> {
        let args = self.ssh_args(host, command);
        for attempt in 1..=self.config.attempts {
            let output = Command::new("ssh").args(&args).output().await?;
            if output.status.success() {
                debug!(host, command, "ssh succeeded");
                return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
            }
            warn!(
                host,
                command,
                attempt,
                status = ?output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "ssh failed"
            );
            if attempt < self.config.attempts {
                sleep(self.retry).await;
            }
        }
        Err(Error::Ssh {
            host: host.to_string(),
            command: command.to_string(),
            attempts: self.config.attempts,
        })
    }

    /// Copies a local file to a remote host via SCP with retries
    pub async fn copy(&self, local: &Path, host: &str, remote: &str) -> Result<(), Error> {
        let args = self.scp_args(local, host, remote);
        for attempt in 1..=self.config.attempts {
            let status = Command::new("scp").args(&args).status().await?;
            if status.success() {
                debug!(host, local = %local.display(), remote, "scp succeeded");
                return Ok(());
            }
            warn!(host, local = %local.display(), attempt, ?status, "scp failed");
            if attempt < self.config.attempts {
                sleep(self.retry).await;
            }
        }
        Err(Error::Scp {
            host: host.to_string(),
            local: local.to_path_buf(),
            attempts: self.config.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args() {
        let ssh = Ssh::new(SshConfig {
            user: "ubuntu".into(),
            key_file: Some("/keys/id".into()),
            port: Some(2222),
            attempts: 3,
        });
        assert_eq!(
            ssh.ssh_args("n1", "uptime"),
            vec![
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "BatchMode=yes",
                "-i",
                "/keys/id",
                "-p",
                "2222",
                "ubuntu@n1",
                "uptime",
            ]
        );
        let args = ssh.scp_args(Path::new("/tmp/genesis.json"), "n2", "/etc/genesis.json");
        assert!(args.contains(&"-P".to_string()));
        assert_eq!(args.last().unwrap(), "ubuntu@n2:/etc/genesis.json");
    }

    #[test]
    fn test_default_config() {
        let config: SshConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, SshConfig::default());
        let ssh = Ssh::new(config);
        assert_eq!(ssh.ssh_args("n1", "true")[4], "root@n1");
    }
}
