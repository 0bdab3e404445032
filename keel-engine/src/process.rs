//! Local process execution
//!
//! Runs shell commands to completion while streaming their output to a
//! [`LogSink`] line by line. Stderr is redirected into stdout inside the
//! shell, so both arrive on one pipe in the order the process wrote them.

use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::sink::LogSink;

/// Markers that survive quiet mode
const CRITICAL_MARKERS: [&str; 4] = ["ERROR", "BUILD FAILURE", "BUILD SUCCESS", "FAILED"];

/// Whether a line is forwarded when output is quieted
pub fn is_critical(line: &str) -> bool {
    CRITICAL_MARKERS.iter().any(|marker| line.contains(marker))
}

/// Quotes a value for safe interpolation into an `sh -c` command
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Runs local shell commands
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Executes `sh -c <command>` in `working_dir`
    ///
    /// Returns once the process has exited and both output streams are
    /// drained. A non-zero exit status is an error.
    pub async fn execute(
        &self,
        command: &str,
        working_dir: &Path,
        sink: &dyn LogSink,
        quiet: bool,
    ) -> Result<()> {
        self.execute_with_env(command, working_dir, &[], sink, quiet)
            .await
    }

    /// Like [`ProcessRunner::execute`] with extra environment variables
    ///
    /// Secrets are handed over this way so they never appear in the
    /// command line or the execution log.
    pub async fn execute_with_env(
        &self,
        command: &str,
        working_dir: &Path,
        env: &[(&str, &str)],
        sink: &dyn LogSink,
        quiet: bool,
    ) -> Result<()> {
        debug!("Executing '{}' in {}", command, working_dir.display());

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(merged_script(command))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| PipelineError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Internal("stdout was not captured".to_string()))?;

        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            match next_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => {
                    if !quiet || is_critical(&line) {
                        sink.line(&line).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read output of '{}': {}", command, e);
                    break;
                }
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(PipelineError::ExternalProcess {
                command: command.to_string(),
                exit_code: status.code().unwrap_or(-1),
            })
        }
    }
}

/// Wraps `command` so its stderr shares the stdout pipe
///
/// The redirect sits on its own line so the command text is parsed after it
/// and syntax errors are captured too.
fn merged_script(command: &str) -> String {
    format!("exec 2>&1\n{}", command)
}

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

/// Drains two line streams concurrently, handing each line to `forward`
///
/// Lines from the same stream keep their order; lines from different
/// streams interleave as they arrive.
pub(crate) async fn stream_lines<O, E, F, Fut>(stdout: O, stderr: E, mut forward: F)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    F: FnMut(OutputStream, String) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut out = BufReader::new(stdout);
    let mut err = BufReader::new(stderr);
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            line = next_line(&mut out, &mut out_buf), if out_open => match line {
                Ok(Some(line)) => forward(OutputStream::Stdout, line).await,
                Ok(None) => out_open = false,
                Err(e) => {
                    warn!("Failed to read stdout: {}", e);
                    out_open = false;
                }
            },
            line = next_line(&mut err, &mut err_buf), if err_open => match line {
                Ok(Some(line)) => forward(OutputStream::Stderr, line).await,
                Ok(None) => err_open = false,
                Err(e) => {
                    warn!("Failed to read stderr: {}", e);
                    err_open = false;
                }
            },
        }
    }
}

/// Reads one line, tolerating invalid UTF-8
///
/// Partially read bytes stay in `buf` if the future is dropped, so this is
/// safe to use as a `select!` branch.
async fn next_line<R>(reader: &mut BufReader<R>, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }

    let mut bytes = std::mem::take(buf);
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
    }
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;

    #[test]
    fn test_critical_markers() {
        assert!(is_critical("[INFO] BUILD SUCCESS"));
        assert!(is_critical("[ERROR] Failed to compile"));
        assert!(is_critical("Tests run: 3, FAILED: 1"));
        assert!(!is_critical("[INFO] Downloading dependency"));
        assert!(!is_critical("error in lowercase"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn quoted_values_survive_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CollectingSink::new();
        let tricky = "a b; echo injected 'x'";

        ProcessRunner::new()
            .execute(&format!("echo {}", shell_quote(tricky)), dir.path(), &sink, false)
            .await
            .unwrap();

        assert_eq!(sink.lines(), vec![tricky]);
    }

    #[tokio::test]
    async fn streams_every_line_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CollectingSink::new();

        ProcessRunner::new()
            .execute("echo one; echo two; echo three", dir.path(), &sink, false)
            .await
            .unwrap();

        assert_eq!(sink.lines(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn merges_stderr_in_production_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CollectingSink::new();

        ProcessRunner::new()
            .execute(
                "i=0; while [ $i -lt 200 ]; do echo o$i; echo e$i >&2; i=$((i+1)); done",
                dir.path(),
                &sink,
                false,
            )
            .await
            .unwrap();

        let expected: Vec<String> = (0..200)
            .flat_map(|i| [format!("o{}", i), format!("e{}", i)])
            .collect();
        assert_eq!(sink.lines(), expected);
    }

    #[tokio::test]
    async fn shell_syntax_errors_reach_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CollectingSink::new();

        let err = ProcessRunner::new()
            .execute("if then fi (", dir.path(), &sink, false)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::ExternalProcess { .. }));
        assert!(!sink.lines().is_empty());
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CollectingSink::new();

        let err = ProcessRunner::new()
            .execute("echo partial; exit 3", dir.path(), &sink, false)
            .await
            .unwrap_err();

        match err {
            PipelineError::ExternalProcess { command, exit_code } => {
                assert_eq!(exit_code, 3);
                assert_eq!(command, "echo partial; exit 3");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sink.lines(), vec!["partial"]);
    }

    #[tokio::test]
    async fn quiet_mode_keeps_only_critical_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CollectingSink::new();

        ProcessRunner::new()
            .execute(
                "echo '[INFO] Compiling'; echo '[INFO] BUILD SUCCESS'; echo '[ERROR] flaky' >&2",
                dir.path(),
                &sink,
                true,
            )
            .await
            .unwrap();

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| is_critical(l)));
    }

    #[tokio::test]
    async fn runs_in_working_dir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "present").unwrap();
        let sink = CollectingSink::new();

        ProcessRunner::new()
            .execute_with_env(
                "cat marker.txt; echo; echo \"$KEEL_TEST_VALUE\"",
                dir.path(),
                &[("KEEL_TEST_VALUE", "from-env")],
                &sink,
                false,
            )
            .await
            .unwrap();

        assert_eq!(sink.lines(), vec!["present", "from-env"]);
    }

    #[tokio::test]
    async fn last_line_without_newline_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CollectingSink::new();

        ProcessRunner::new()
            .execute("printf 'a\\nb'", dir.path(), &sink, false)
            .await
            .unwrap();

        assert_eq!(sink.lines(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn missing_working_dir_fails_to_spawn() {
        let sink = CollectingSink::new();
        let err = ProcessRunner::new()
            .execute("true", Path::new("/definitely/not/here"), &sink, false)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Spawn { .. }));
    }
}
