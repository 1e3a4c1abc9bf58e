// Warden — sandboxed skill execution.
// A fresh child process with a stripped environment and a hard wall-clock
// cap. Process boundary only — namespaces, seccomp, and resource limits are
// the surrounding runtime's concern. Sandbox failures are never fatal to the
// caller.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{CoreError, CoreResult};

use super::Language;

const STDOUT_HEAD_BYTES: usize = 1000;
const STDERR_HEAD_BYTES: usize = 500;
const KILL_ESCALATION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub exit_code: i32,
    pub stdout_head: String,
    pub stderr_head: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

fn interpreter(language: Language, code_file: &Path) -> Command {
    let mut cmd = match language {
        Language::Python => {
            let mut c = Command::new("python3");
            // -I: isolated mode, no user site-packages or env hooks.
            c.arg("-I").arg(code_file);
            c
        }
        Language::Javascript | Language::Typescript => {
            let mut c = Command::new("node");
            c.arg(code_file);
            c
        }
    };
    cmd.env_clear()
        .env("PATH", "/usr/bin:/bin")
        .env("HOME", "/tmp")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Run a skill's code file. The working directory is the skill's own
/// directory; stdout/stderr come back truncated to their head bytes.
pub async fn execute(
    code_file: &Path,
    language: Language,
    limit: Duration,
) -> CoreResult<SandboxResult> {
    let workdir = code_file
        .parent()
        .ok_or_else(|| CoreError::Sandbox("code file has no parent directory".into()))?;

    let mut cmd = interpreter(language, code_file);
    cmd.current_dir(workdir);

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| CoreError::Sandbox(format!("spawn failed: {e}")))?;
    let pid = child.id();

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| CoreError::Sandbox("stdout pipe missing".into()))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| CoreError::Sandbox("stderr pipe missing".into()))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(|e| CoreError::Sandbox(format!("wait failed: {e}")))?;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok(SandboxResult {
                exit_code: status.code().unwrap_or(-1),
                stdout_head: head_utf8(&stdout, STDOUT_HEAD_BYTES),
                stderr_head: head_utf8(&stderr, STDERR_HEAD_BYTES),
                duration_ms: start.elapsed().as_millis() as u64,
                timed_out: false,
            })
        }
        Err(_) => {
            tracing::warn!(
                "sandbox: execution exceeded {:?}, signalling pid {:?}",
                limit,
                pid
            );
            graceful_signal(&child);
            if tokio::time::timeout(KILL_ESCALATION, child.wait()).await.is_err() {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
            stdout_task.abort();
            stderr_task.abort();
            Ok(SandboxResult {
                exit_code: -1,
                stdout_head: String::new(),
                stderr_head: String::new(),
                duration_ms: start.elapsed().as_millis() as u64,
                timed_out: true,
            })
        }
    }
}

#[cfg(unix)]
fn graceful_signal(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn graceful_signal(_child: &tokio::process::Child) {}

fn head_utf8(bytes: &[u8], cap: usize) -> String {
    let slice = &bytes[..bytes.len().min(cap)];
    String::from_utf8_lossy(slice).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_respects_byte_cap() {
        let text = "a".repeat(2000);
        assert_eq!(head_utf8(text.as_bytes(), 1000).len(), 1000);
        assert_eq!(head_utf8(b"short", 1000), "short");
    }
}
