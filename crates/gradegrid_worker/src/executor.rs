//! Subprocess execution for one assignment's command sequence.
//!
//! All commands share a single wall-clock budget. Each child runs in its
//! own process group (on unix) so a deadline kill takes the whole subtree
//! with it, not just the immediate child.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use gradegrid_protocol::{ProtocolError, Result};

/// Outcome of a command sequence. A failed run reports the literal body
/// `Failed` instead of a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed(String),
    Failed,
}

impl Verdict {
    /// The bytes reported back to the commander.
    pub fn report_bytes(&self) -> &[u8] {
        match self {
            Verdict::Passed(transcript) => transcript.as_bytes(),
            Verdict::Failed => b"Failed",
        }
    }
}

/// Run `commands` in order inside `workdir`, sharing one `timeout_secs`
/// wall-clock budget. The first command that exits non-zero, dies to a
/// signal, or outlives the budget aborts the sequence.
pub async fn run_commands(commands: &[String], timeout_secs: u32, workdir: &Path) -> Verdict {
    let deadline = Instant::now() + Duration::from_secs(u64::from(timeout_secs));
    let mut transcript = String::new();
    for command in commands {
        match run_one(command, deadline, workdir).await {
            Ok(output) => {
                // Each command's block ends with a single separator line.
                transcript.push_str(output.strip_suffix('\n').unwrap_or(&output));
                transcript.push_str("\nEND ");
                transcript.push_str(command);
                transcript.push('\n');
            }
            Err(err) => {
                warn!(command = %command, %err, "command aborted the sequence");
                return Verdict::Failed;
            }
        }
    }
    Verdict::Passed(transcript)
}

/// Spawn one command and wait for it, capturing interleaved stdout and
/// stderr. Deadline expiry kills the child's process tree.
async fn run_one(command: &str, deadline: Instant, workdir: &Path) -> Result<String> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| ProtocolError::Subprocess("empty command line".to_string()))?;

    let mut spawn = Command::new(program);
    spawn
        .args(parts)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    spawn.process_group(0);

    let mut child = spawn
        .spawn()
        .map_err(|e| ProtocolError::Subprocess(format!("failed to spawn '{program}': {e}")))?;

    // Drain both pipes while waiting, or a chatty child would fill the
    // pipe buffer and never exit.
    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");
    let stdout_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        let _ = stdout.read_to_end(&mut buffer).await;
        buffer
    });
    let stderr_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        let _ = stderr.read_to_end(&mut buffer).await;
        buffer
    });

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            kill_tree(&mut child).await;
            return Err(ProtocolError::Subprocess(format!(
                "failed waiting on '{command}': {err}"
            )));
        }
        Err(_) => {
            kill_tree(&mut child).await;
            None
        }
    };

    let mut captured = stdout_task.await.unwrap_or_default();
    captured.extend(stderr_task.await.unwrap_or_default());

    match status {
        None => Err(ProtocolError::Subprocess(format!(
            "'{command}' exceeded the time budget"
        ))),
        Some(status) if !status.success() => Err(ProtocolError::Subprocess(format!(
            "'{command}' exited with {status}"
        ))),
        Some(_) => {
            debug!(command, bytes = captured.len(), "command finished");
            Ok(String::from_utf8_lossy(&captured).into_owned())
        }
    }
}

/// Kill the child's whole process group, then reap the child itself.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child is its own group leader (process_group(0) at spawn).
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    if let Err(err) = child.kill().await {
        warn!(%err, "failed to kill timed-out child");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    fn commands(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn echo_produces_separated_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = run_commands(&commands(&["echo hello"]), 60, dir.path()).await;
        assert_eq!(
            verdict,
            Verdict::Passed("hello\nEND echo hello\n".to_string())
        );
    }

    #[tokio::test]
    async fn sequence_keeps_per_command_blocks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = run_commands(&commands(&["echo one", "echo two"]), 60, dir.path()).await;
        assert_eq!(
            verdict,
            Verdict::Passed("one\nEND echo one\ntwo\nEND echo two\n".to_string())
        );
    }

    #[tokio::test]
    async fn commands_run_in_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"contents\n").unwrap();
        let verdict = run_commands(&commands(&["cat a.txt"]), 60, dir.path()).await;
        assert_eq!(
            verdict,
            Verdict::Passed("contents\nEND cat a.txt\n".to_string())
        );
    }

    #[tokio::test]
    async fn nonzero_exit_fails_and_aborts_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = run_commands(&commands(&["false", "echo unreachable"]), 60, dir.path()).await;
        assert_eq!(verdict, Verdict::Failed);
    }

    #[tokio::test]
    async fn missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let verdict =
            run_commands(&commands(&["definitely-not-a-real-binary"]), 60, dir.path()).await;
        assert_eq!(verdict, Verdict::Failed);
    }

    #[tokio::test]
    async fn empty_command_line_fails() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = run_commands(&commands(&["   "]), 60, dir.path()).await;
        assert_eq!(verdict, Verdict::Failed);
    }

    #[tokio::test]
    async fn deadline_kills_a_sleeping_child() {
        let dir = tempfile::tempdir().unwrap();
        let started = StdInstant::now();
        let verdict = run_commands(&commands(&["sleep 100"]), 1, dir.path()).await;
        assert_eq!(verdict, Verdict::Failed);
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "kill must not wait out the sleep"
        );
    }

    #[tokio::test]
    async fn budget_is_shared_across_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let started = StdInstant::now();
        let verdict = run_commands(&commands(&["sleep 1", "sleep 100"]), 2, dir.path()).await;
        assert_eq!(verdict, Verdict::Failed);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn failed_report_body_is_the_literal_string() {
        assert_eq!(Verdict::Failed.report_bytes(), b"Failed");
    }
}
