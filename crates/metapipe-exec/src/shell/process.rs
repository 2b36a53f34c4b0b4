//! Child process execution with a deadline, graceful termination and
//! capped output capture.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use metapipe_core::domain::{ShellResult, SENTINEL_EXIT_CODE};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A fully rendered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Rendered form reported as `ShellResult.cmd`.
    pub display: String,
    pub working_dir: Option<PathBuf>,
    /// Merged onto the inherited environment.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub grace: Duration,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
}

/// Kills the child's process group when dropped while armed.
///
/// Covers the task being aborted mid-wait under fail-fast.
struct ProcessGroupGuard {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
            armed: true,
        }
    }

    #[cfg(unix)]
    fn signal(&self, signal: i32) {
        if let Some(pgid) = self.pgid {
            // SAFETY: killpg has no memory-safety preconditions; a stale group
            // id only yields ESRCH.
            unsafe {
                libc::killpg(pgid, signal);
            }
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            #[cfg(unix)]
            self.signal(libc::SIGKILL);
        }
    }
}

/// Read everything from `reader`, keeping at most `cap` bytes.
pub async fn read_capped<R>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        if room > 0 {
            kept.extend_from_slice(&chunk[..n.min(room)]);
        }
        if n > room {
            truncated = true;
        }
    }
    Ok((kept, truncated))
}

type Capture = JoinHandle<std::io::Result<(Vec<u8>, bool)>>;

fn spawn_capture<R>(reader: Option<R>, cap: usize) -> Option<Capture>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    reader.map(|r| tokio::spawn(read_capped(r, cap)))
}

async fn collect(capture: Option<Capture>, bound: Duration) -> (Option<String>, bool) {
    let Some(handle) = capture else {
        return (None, false);
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(bound, handle).await {
        Ok(Ok(Ok((bytes, truncated)))) => (Some(String::from_utf8_lossy(&bytes).into_owned()), truncated),
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "failed reading child output");
            (Some(String::new()), false)
        }
        Ok(Err(_)) => (Some(String::new()), false),
        Err(_) => {
            // A descendant outside the process group still holds the pipe.
            abort.abort();
            (Some(String::new()), false)
        }
    }
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    SENTINEL_EXIT_CODE
}

async fn terminate(child: &mut Child, guard: &ProcessGroupGuard, grace: Duration) {
    #[cfg(unix)]
    {
        guard.signal(libc::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            debug!("child ignored SIGTERM, killing process group");
        }
        guard.signal(libc::SIGKILL);
        let _ = child.wait().await;
    }
    #[cfg(not(unix))]
    {
        let _ = (guard, grace);
        let _ = child.kill().await;
    }
}

/// Run `spec` to completion or until `limits.timeout` elapses.
pub async fn run_command(spec: &CommandSpec, limits: &ProcessLimits) -> ShellResult {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(if limits.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(if limits.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .envs(&spec.env)
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ShellResult::not_run(&spec.display, format!("failed to spawn {}: {e}", spec.program));
        }
    };
    let mut guard = ProcessGroupGuard::new(child.id());

    let stdout = spawn_capture(child.stdout.take(), limits.max_stdout_bytes);
    let stderr = spawn_capture(child.stderr.take(), limits.max_stderr_bytes);

    let (status, timed_out) = match tokio::time::timeout(limits.timeout, child.wait()).await {
        Ok(Ok(status)) => (Some(status), false),
        Ok(Err(e)) => {
            terminate(&mut child, &guard, Duration::ZERO).await;
            guard.disarm();
            return ShellResult::not_run(&spec.display, format!("failed waiting for child: {e}"));
        }
        Err(_) => {
            debug!(cmd = %spec.display, "command timed out");
            terminate(&mut child, &guard, limits.grace).await;
            (None, true)
        }
    };
    guard.disarm();

    let bound = limits.grace.max(Duration::from_millis(100));
    let (stdout, stdout_truncated) = collect(stdout, bound).await;
    let (stderr, stderr_truncated) = collect(stderr, bound).await;

    ShellResult {
        cmd: spec.display.clone(),
        exit_code: match (&status, timed_out) {
            (Some(status), false) => exit_code(status),
            _ => SENTINEL_EXIT_CODE,
        },
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        duration_ms: Some(start.elapsed().as_millis() as u64),
        error: None,
    }
}
