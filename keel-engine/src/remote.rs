//! Remote command execution over SSH
//!
//! Uses the system `ssh` and `scp` clients with key-based authentication.
//! Each call opens its own session; output streams back line by line with
//! the same contract as [`crate::process::ProcessRunner`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::{PipelineError, Result};
use crate::process::{OutputStream, stream_lines};
use crate::sink::{CollectingSink, LogSink};

/// Prefix added to lines the remote command wrote to stderr
pub const STDERR_TAG: &str = "[stderr] ";

/// Runs commands and copies files to one remote host
#[derive(Debug, Clone)]
pub struct RemoteShell {
    host: String,
    user: String,
    port: u16,
    key_path: PathBuf,
    strict_host_key_checking: bool,
    ssh_program: String,
    scp_program: String,
}

impl RemoteShell {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            host: config.host.clone(),
            user: config.user.clone(),
            port: config.port,
            key_path: config.private_key_path.clone(),
            strict_host_key_checking: config.strict_host_key_checking,
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
        }
    }

    /// Overrides the client binaries (e.g. absolute paths)
    pub fn with_programs(mut self, ssh: impl Into<String>, scp: impl Into<String>) -> Self {
        self.ssh_program = ssh.into();
        self.scp_program = scp.into();
        self
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Executes `command` on the remote host
    ///
    /// Blocks until the remote command exits and its output is drained.
    /// Lines written to stderr are tagged with [`STDERR_TAG`].
    pub async fn execute_remote(&self, command: &str, sink: &dyn LogSink) -> Result<()> {
        debug!("Executing on {}: {}", self.destination(), command);

        let mut child = Command::new(&self.ssh_program)
            .args(self.ssh_args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                command: format!("{} {}", self.ssh_program, self.destination()),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Internal("ssh stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::Internal("ssh stderr was not captured".to_string()))?;

        stream_lines(stdout, stderr, move |stream, line| async move {
            match stream {
                OutputStream::Stdout => sink.line(&line).await,
                OutputStream::Stderr => sink.line(&format!("{}{}", STDERR_TAG, line)).await,
            }
        })
        .await;

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(PipelineError::RemoteExec {
                command: command.to_string(),
                exit_code: status.code().unwrap_or(-1),
            })
        }
    }

    /// Executes `command` and returns its output lines
    pub async fn execute_remote_capture(&self, command: &str) -> Result<Vec<String>> {
        let sink = CollectingSink::new();
        self.execute_remote(command, &sink).await?;
        Ok(sink.into_lines())
    }

    /// Copies a local file to `remote_path` on the host
    pub async fn transfer(&self, local: &Path, remote_path: &str) -> Result<()> {
        let transfer_error = |reason: String| PipelineError::Transfer {
            local: local.display().to_string(),
            remote: remote_path.to_string(),
            reason,
        };

        if !local.is_file() {
            return Err(transfer_error("local file does not exist".to_string()));
        }

        debug!(
            "Transferring {} to {}:{}",
            local.display(),
            self.destination(),
            remote_path
        );

        let output = Command::new(&self.scp_program)
            .args(self.scp_args(local, remote_path))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| transfer_error(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                format!("scp exited with code {}", output.status.code().unwrap_or(-1))
            } else {
                stderr
            };
            Err(transfer_error(reason))
        }
    }

    fn connection_options(&self) -> Vec<String> {
        let mut options = vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=30".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
        ];
        if !self.strict_host_key_checking {
            options.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "-o".to_string(),
                "LogLevel=ERROR".to_string(),
            ]);
        }
        options
    }

    fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.connection_options();
        args.extend([
            "-p".to_string(),
            self.port.to_string(),
            self.destination(),
            command.to_string(),
        ]);
        args
    }

    fn scp_args(&self, local: &Path, remote_path: &str) -> Vec<String> {
        let mut args = self.connection_options();
        args.extend([
            "-P".to_string(),
            self.port.to_string(),
            local.display().to_string(),
            format!("{}:{}", self.destination(), remote_path),
        ]);
        args
    }
}
