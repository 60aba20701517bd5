//! Checked command execution on a running VM over SSH.
//!
//! Every call inspects the exit status; a non-zero exit surfaces as
//! [`ProvisionError::RemoteCommandFailed`] instead of being ignored.

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::PlatformConfig;
use crate::error::{ProvisionError, Result};
use crate::templates::shell_quote;

/// Exit code reported when the remote process was killed by a signal.
const SIGNAL_EXIT_CODE: i32 = -1;

/// Something that can run commands and place files on a host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Host this executor talks to.
    fn host(&self) -> &str;

    /// Run a shell command and return its stdout.
    async fn run(&self, command: &str) -> Result<String>;

    /// Write `contents` to `path` with permissions `mode`, replacing any
    /// existing file. Parent directories are created.
    async fn upload(&self, contents: &str, path: &str, mode: u32) -> Result<()>;
}

/// `ssh`/`scp` backed executor.
#[derive(Debug, Clone)]
pub struct SshSession {
    host: String,
    user: String,
    connect_timeout_secs: u64,
    ssh: String,
    scp: String,
}

impl SshSession {
    /// Session to `host` using the configured user and timeout.
    #[must_use]
    pub fn new(host: impl Into<String>, config: &PlatformConfig) -> Self {
        Self {
            host: host.into(),
            user: config.ssh_user.clone(),
            connect_timeout_secs: config.ssh_connect_timeout_secs,
            ssh: "ssh".to_string(),
            scp: "scp".to_string(),
        }
    }

    /// Use different `ssh`/`scp` binaries.
    #[must_use]
    pub fn with_binaries(mut self, ssh: impl Into<String>, scp: impl Into<String>) -> Self {
        self.ssh = ssh.into();
        self.scp = scp.into();
        self
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by `ssh` and `scp`.
    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
        ]
    }

    /// Full `ssh` argument list for `command`.
    #[must_use]
    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push(self.destination());
        args.push(command.to_string());
        args
    }

    async fn exec(&self, program: &str, args: &[String], command: &str) -> Result<String> {
        debug!(host = %self.host, command, "Executing remote command");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| ProvisionError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(SIGNAL_EXIT_CODE);
        warn!(host = %self.host, command, exit_code, stderr = %stderr.trim(), "Remote command failed");
        Err(ProvisionError::RemoteCommandFailed {
            command: command.to_string(),
            host: self.host.clone(),
            exit_code,
        })
    }
}

#[async_trait]
impl RemoteExecutor for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<String> {
        self.exec(&self.ssh, &self.ssh_args(command), command).await
    }

    async fn upload(&self, contents: &str, path: &str, mode: u32) -> Result<()> {
        let mut local = tempfile::NamedTempFile::new()
            .map_err(|e| ProvisionError::io(std::env::temp_dir(), e))?;
        local
            .write_all(contents.as_bytes())
            .map_err(|e| ProvisionError::io(local.path().to_path_buf(), e))?;
        local
            .flush()
            .map_err(|e| ProvisionError::io(local.path().to_path_buf(), e))?;

        let quoted = shell_quote(path);
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            self.run(&format!("mkdir -p {}", shell_quote(&parent.to_string_lossy())))
                .await?;
        }

        let mut args = self.common_options();
        args.push(local.path().display().to_string());
        args.push(format!("{}:{path}", self.destination()));
        self.exec(&self.scp, &args, &format!("scp {path}")).await?;

        self.run(&format!("chmod {mode:o} {quoted}")).await?;
        Ok(())
    }
}
