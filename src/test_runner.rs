//! Workspace test execution.
//!
//! Resolves the project's test command and runs it through the platform
//! shell (`sh -c`, or `cmd /C` on Windows) with the workspace root as the
//! working directory. Standard output and standard error are captured into
//! one buffer in arrival order.
//!
//! Nothing here returns an error: a missing command, a spawn failure, or a
//! timeout are all reported as a [`TestResult`] so the caller can record
//! them on the step and keep going.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::TestResult;

pub const SKIPPED_MESSAGE: &str = "No test command configured; skipping tests.";

/// How long to keep draining pipes after the child was killed. A grandchild
/// spawned by the shell can keep them open past the kill.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Pick the test command for `root`.
///
/// `tests.command` wins. Otherwise, when detection is enabled, a
/// `package.json` declaring a `"test"` script selects `pnpm test --silent`
/// (if the manifest mentions pnpm) or `npm test --silent`.
pub fn resolve_test_command(config: &Config, root: &Path) -> Option<String> {
    if let Some(cmd) = &config.tests.command {
        let cmd = cmd.trim();
        if !cmd.is_empty() {
            return Some(cmd.to_string());
        }
    }
    if !config.tests.detect {
        return None;
    }

    let manifest = std::fs::read_to_string(root.join("package.json")).ok()?;
    if !manifest.contains("\"test\"") {
        return None;
    }
    if manifest.contains("pnpm") {
        Some("pnpm test --silent".to_string())
    } else {
        Some("npm test --silent".to_string())
    }
}

/// Run the workspace's tests with the configured timeout.
pub async fn run_tests(config: &Config, root: &Path) -> TestResult {
    match resolve_test_command(config, root) {
        Some(command) => {
            run_command(root, &command, Duration::from_secs(config.tests.timeout_secs)).await
        }
        None => TestResult {
            passed: true,
            output: SKIPPED_MESSAGE.to_string(),
        },
    }
}

/// Run `command` in `root`, killing it after `timeout`.
pub async fn run_command(root: &Path, command: &str, timeout: Duration) -> TestResult {
    info!(command, root = %root.display(), "running tests");

    let mut child = match shell(command)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(command, error = %e, "failed to spawn test command");
            return TestResult {
                passed: false,
                output: format!("Test execution error: {}", e),
            };
        }
    };

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(drain(out, buffer.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(drain(err, buffer.clone()));
    }

    let outcome = tokio::time::timeout(timeout, child.wait()).await;
    let timed_out = outcome.is_err();
    if timed_out {
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill timed-out test process");
        }
    }

    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(DRAIN_GRACE, reader).await.is_err() {
            abort.abort();
        }
    }

    let mut output = buffer
        .lock()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();

    match outcome {
        Ok(Ok(status)) => {
            let passed = status.success();
            info!(passed, code = ?status.code(), "tests finished");
            TestResult { passed, output }
        }
        Ok(Err(e)) => TestResult {
            passed: false,
            output: format!("Test execution error: {}", e),
        },
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "tests timed out");
            output.push_str(&format!("\n[timeout after {}s]", timeout.as_secs()));
            TestResult {
                passed: false,
                output,
            }
        }
    }
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Copy a pipe into the shared buffer chunk by chunk, so output read before
/// a kill survives even if the task is aborted.
fn drain<R>(mut pipe: R, buffer: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut b) = buffer.lock() {
                        b.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}
