//! Running backend child processes with deadlines, bounded output capture and
//! cooperative cancellation.
//!
//! A [`StopHandle`] is shared between the thread that owns the child and
//! whoever may want it gone (the shutdown registry, a timeout). Stopping is
//! always the same sequence: interrupt, wait up to the grace period, kill.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Stopped,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub termination: Termination,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr (falling back to stdout) for error messages.
    pub fn diagnostics(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        let mut text = if stderr.trim().is_empty() {
            String::from_utf8_lossy(&self.stdout).trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]",
                self.stderr_truncated
            ));
        }
        text
    }
}

#[derive(Debug, Default)]
struct StopState {
    requested: AtomicBool,
    running: Mutex<bool>,
    idle: Condvar,
}

/// Shared request-stop flag for one runner's child processes.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Set the stop flag and return at once. The owning thread notices it
    /// within one poll interval.
    pub fn raise(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
    }

    /// Ask the in-flight process to stop and wait up to `wait` for it to go.
    ///
    /// Returns `true` if nothing is running anymore when this returns. The
    /// owning thread does the actual interrupt/kill; this never signals the
    /// child itself so the backend sees exactly one interrupt.
    pub fn request_stop(&self, wait: Duration) -> bool {
        self.raise();
        let deadline = Instant::now() + wait;
        let mut running = match self.inner.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *running {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("process still running after stop wait elapsed");
                return false;
            }
            running = match self.inner.idle.wait_timeout(running, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Weak reference for registries that must not keep the runner alive.
    pub fn downgrade(&self) -> WeakStopHandle {
        WeakStopHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn set_running(&self, value: bool) {
        let mut running = match self.inner.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *running = value;
        if !value {
            self.inner.idle.notify_all();
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeakStopHandle {
    inner: std::sync::Weak<StopState>,
}

impl WeakStopHandle {
    pub fn upgrade(&self) -> Option<StopHandle> {
        self.inner.upgrade().map(|inner| StopHandle { inner })
    }
}

/// Limits applied to one child process run.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub timeout: Duration,
    /// Time between interrupt and kill.
    pub stop_grace: Duration,
    /// Bytes of stdout/stderr kept in memory (the rest is drained and dropped).
    pub output_limit_bytes: usize,
}

/// Run a command until it exits, the deadline passes or a stop is requested.
///
/// Output is read concurrently on helper threads so a chatty child never
/// blocks on a full pipe.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command_cancellable(
    mut cmd: Command,
    limits: RunLimits,
    stop: &StopHandle,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    stop.set_running(true);
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            stop.set_running(false);
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let result = supervise(&mut child, limits, stop);
    stop.set_running(false);
    result
}

fn supervise(child: &mut Child, limits: RunLimits, stop: &StopHandle) -> Result<CommandOutput> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let (status, termination) = match wait_for_exit(child, limits, stop) {
        Ok(ended) => ended,
        Err(err) => return Err(reap_after_error(child, err)),
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), ?termination, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        termination,
    })
}

fn wait_for_exit(
    child: &mut Child,
    limits: RunLimits,
    stop: &StopHandle,
) -> Result<(ExitStatus, Termination)> {
    let deadline = Instant::now() + limits.timeout;
    loop {
        if let Some(status) = child.wait_timeout(POLL_INTERVAL).context("wait for command")? {
            return Ok((status, Termination::Exited));
        }
        if stop.is_requested() {
            info!("stop requested, interrupting child process");
            return Ok((interrupt_then_kill(child, limits.stop_grace)?, Termination::Stopped));
        }
        if Instant::now() >= deadline {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, interrupting"
            );
            return Ok((interrupt_then_kill(child, limits.stop_grace)?, Termination::TimedOut));
        }
    }
}

/// Supervision failed: make sure the child is gone and reaped before the
/// error propagates. Its pipes close with it, so the reader threads finish.
fn reap_after_error(child: &mut Child, err: anyhow::Error) -> anyhow::Error {
    error!(err = %err, "supervising child process failed, killing it");
    if let Err(kill_err) = child.kill() {
        debug!(err = %kill_err, "kill after supervision error");
    }
    if let Err(wait_err) = child.wait() {
        warn!(err = %wait_err, "could not reap child process");
    }
    err
}

/// Interrupt, wait up to `grace`, then kill.
fn interrupt_then_kill(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    send_interrupt(child);
    if let Some(status) = child
        .wait_timeout(grace)
        .context("wait for command after interrupt")?
    {
        return Ok(status);
    }
    warn!(
        grace_secs = grace.as_secs(),
        "child ignored interrupt, killing"
    );
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGINT) {
        warn!(pid, err = %err, "failed to deliver SIGINT");
    }
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child) {
    if let Err(err) = child.kill() {
        warn!(err = %err, "failed to terminate child");
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn limits(timeout: Duration) -> RunLimits {
        RunLimits {
            timeout,
            stop_grace: Duration::from_secs(2),
            output_limit_bytes: 16,
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_truncates() {
        let stop = StopHandle::new();
        let output = run_command_cancellable(
            sh("printf 'hello world, this is long'; printf oops >&2; exit 3"),
            limits(Duration::from_secs(10)),
            &stop,
        )
        .expect("run");
        assert_eq!(output.termination, Termination::Exited);
        assert_eq!(output.status.code(), Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout, b"hello world, thi");
        assert_eq!(output.stdout_truncated, 10);
        assert_eq!(output.diagnostics(), "oops");
    }

    #[test]
    fn child_stdin_is_closed() {
        let stop = StopHandle::new();
        let output = run_command_cancellable(sh("cat"), limits(Duration::from_secs(10)), &stop)
            .expect("run");
        assert!(output.success());
        assert!(output.stdout.is_empty());
    }

    #[test]
    fn failed_supervision_kills_and_reaps_child() {
        let mut child = sh("exec sleep 30").spawn().expect("spawn");
        let err = reap_after_error(&mut child, anyhow!("wait for command"));
        assert_eq!(err.to_string(), "wait for command");
        assert!(child.try_wait().expect("try_wait").is_some());
    }

    #[test]
    fn raise_sets_flag_without_waiting_for_running_child() {
        let stop = StopHandle::new();
        let owner = stop.clone();
        let child = thread::spawn(move || {
            run_command_cancellable(
                sh("trap '' INT; sleep 5"),
                limits(Duration::from_secs(60)),
                &owner,
            )
        });
        thread::sleep(Duration::from_millis(300));
        let started = Instant::now();
        stop.raise();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(stop.is_requested());
        let output = child.join().expect("join").expect("run");
        assert_eq!(output.termination, Termination::Stopped);
    }

    #[test]
    fn deadline_interrupts_child() {
        let stop = StopHandle::new();
        let started = Instant::now();
        let output = run_command_cancellable(
            sh("exec sleep 30"),
            limits(Duration::from_millis(300)),
            &stop,
        )
        .expect("run");
        assert_eq!(output.termination, Termination::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn stop_request_interrupts_child() {
        let stop = StopHandle::new();
        let remote = stop.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            remote.request_stop(Duration::from_secs(10))
        });
        let output = run_command_cancellable(
            sh("exec sleep 30"),
            limits(Duration::from_secs(60)),
            &stop,
        )
        .expect("run");
        assert_eq!(output.termination, Termination::Stopped);
        assert!(stopper.join().expect("join stopper"));
    }

    #[test]
    fn request_stop_without_process_returns_immediately() {
        let stop = StopHandle::new();
        assert!(stop.request_stop(Duration::from_secs(5)));
        assert!(stop.is_requested());
    }

    #[test]
    fn weak_handle_does_not_keep_state_alive() {
        let stop = StopHandle::new();
        let weak = stop.downgrade();
        assert!(weak.upgrade().is_some());
        drop(stop);
        assert!(weak.upgrade().is_none());
    }
}
