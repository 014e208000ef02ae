//! Log-completion monitor.
//!
//! Runs a child process, follows its stdout through [`CompletionMatcher`] and
//! turns the first complete unittest summary into a verdict. The child is
//! stopped through one cleanup path whatever ends the watch.

pub mod fsm;

use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use fsm::CompletionMatcher;
pub use fsm::MonitorOutcome;

use crate::error::HarnessError;
use crate::error::HarnessResult;

const LIVENESS_TICK: Duration = Duration::from_secs(1);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
/// How long stderr may stay open once stdout has ended.
const STDERR_DRAIN: Duration = Duration::from_secs(5);

/// Where followed lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    /// `info` events under the `monitor` target
    Tracing,
    /// Verbatim on our own stdout, for in-pod runs whose stdout is the pod log
    Raw,
}

/// Build a `sh -c` command.
pub fn shell_command(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

/// Follows one child process until its test summary appears.
#[derive(Debug, Clone)]
pub struct CompletionMonitor {
    timeout: Duration,
    echo: Echo,
    parent_pid: Option<i32>,
}

impl CompletionMonitor {
    /// Watch for at most `timeout`. The monitor gives up early if the process
    /// that started us goes away.
    pub fn new(timeout: Duration) -> Self {
        // SAFETY: getppid has no preconditions
        let ppid = unsafe { libc::getppid() };
        Self {
            timeout,
            echo: Echo::Tracing,
            // orphaned from the start or running as init: nothing to watch
            parent_pid: (ppid > 1).then_some(ppid),
        }
    }

    pub fn with_echo(mut self, echo: Echo) -> Self {
        self.echo = echo;
        self
    }

    #[cfg(test)]
    fn with_parent_pid(mut self, parent_pid: i32) -> Self {
        self.parent_pid = Some(parent_pid);
        self
    }

    /// Run `command` and classify its output.
    ///
    /// Returns [`MonitorOutcome::Success`] or [`MonitorOutcome::Failure`].
    /// Output that is not valid UTF-8 is decoded lossily and never ends the watch.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::LaunchFailed`] if the command cannot be spawned
    /// - [`HarnessError::MonitorTimeout`] if no summary appears within the timeout
    /// - [`HarnessError::OrphanedMonitor`] if our parent process exits first
    /// - [`HarnessError::SubprocessFailed`] if output ends early and stderr is non-empty
    /// - [`HarnessError::PatternNotFound`] if output ends early with empty stderr
    #[tracing::instrument(skip(self, command), fields(timeout = ?self.timeout))]
    pub async fn run(&self, mut command: Command) -> HarnessResult<MonitorOutcome> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let what = format!("{:?}", command.as_std());
        let mut child = command
            .spawn()
            .change_context_lazy(|| HarnessError::LaunchFailed { what: what.clone() })?;
        info!(pid = child.id(), command = %what, "monitoring subprocess");

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(Report::new(HarnessError::LaunchFailed { what })
                .attach_printable("stdio not captured"));
        };
        let collected = Arc::new(Mutex::new(Vec::new()));
        let mut stderr_task = tokio::spawn(collect_stderr(stderr, collected.clone()));

        let started = Instant::now();
        let mut reader = BufReader::new(stdout);
        // read_until appends partial reads here when the tick wins the select
        let mut line_buf = Vec::new();
        let mut matcher = CompletionMatcher::new();
        let mut tick = tokio::time::interval(LIVENESS_TICK);

        let outcome = loop {
            tokio::select! {
                read = reader.read_until(b'\n', &mut line_buf) => match read {
                    Ok(0) if line_buf.is_empty() => break MonitorOutcome::PatternNotFound,
                    Ok(_) => {
                        let line = decode_line(&line_buf);
                        line_buf.clear();
                        self.echo_line(&line);
                        if let Some(outcome) = matcher.feed(&line) {
                            break outcome;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read subprocess output");
                        break MonitorOutcome::PatternNotFound;
                    }
                },
                _ = tick.tick() => {}
            }
            if let Some(outcome) = self.check_liveness(started) {
                break outcome;
            }
        };

        if outcome == MonitorOutcome::PatternNotFound {
            // give an exiting child the chance to finish on its own
            let _ = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await;
        }
        terminate(&mut child).await;

        info!(?outcome, elapsed = ?started.elapsed(), "monitor finished");
        if outcome != MonitorOutcome::PatternNotFound {
            stderr_task.abort();
        }
        match outcome {
            MonitorOutcome::Success | MonitorOutcome::Failure => Ok(outcome),
            MonitorOutcome::Timeout => Err(Report::new(HarnessError::MonitorTimeout {
                timeout: self.timeout,
            })
            .attach_printable(format!("command: {what}"))),
            MonitorOutcome::ParentDied => Err(Report::new(HarnessError::OrphanedMonitor {
                parent_pid: self.parent_pid.unwrap_or_default(),
            })),
            MonitorOutcome::PatternNotFound => {
                // a background grandchild can hold stderr open long after the child exited
                if tokio::time::timeout(STDERR_DRAIN, &mut stderr_task)
                    .await
                    .is_err()
                {
                    warn!(drain = ?STDERR_DRAIN, "stderr still open, classifying with what was read");
                    stderr_task.abort();
                }
                let stderr = collected
                    .lock()
                    .map(|buf| String::from_utf8_lossy(&buf).trim().to_string())
                    .unwrap_or_default();
                let error = if stderr.is_empty() {
                    HarnessError::PatternNotFound
                } else {
                    HarnessError::SubprocessFailed { stderr }
                };
                Err(Report::new(error).attach_printable(format!("command: {what}")))
            }
        }
    }

    fn echo_line(&self, line: &str) {
        match self.echo {
            Echo::Tracing => info!(target: "monitor", "{line}"),
            Echo::Raw => println!("{line}"),
        }
    }

    fn check_liveness(&self, started: Instant) -> Option<MonitorOutcome> {
        if started.elapsed() >= self.timeout {
            warn!(timeout = ?self.timeout, "monitor timed out");
            return Some(MonitorOutcome::Timeout);
        }
        if let Some(parent_pid) = self.parent_pid {
            if !parent_alive(parent_pid) {
                warn!(parent_pid, "parent process is gone");
                return Some(MonitorOutcome::ParentDied);
            }
        }
        None
    }
}

/// One output line without its terminator; invalid UTF-8 becomes U+FFFD.
fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

async fn collect_stderr(mut stderr: ChildStderr, sink: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => match sink.lock() {
                Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            },
            Err(e) => {
                debug!(error = %e, "stderr read ended");
                break;
            }
        }
    }
}

fn parent_alive(parent_pid: i32) -> bool {
    // reparented means the original parent exited
    // SAFETY: getppid has no preconditions
    if unsafe { libc::getppid() } != parent_pid {
        return false;
    }
    // SAFETY: signal 0 only checks for existence
    if unsafe { libc::kill(parent_pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// SIGTERM, wait out the grace period, then SIGKILL.
pub(crate) async fn terminate(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(%status, "subprocess already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to poll subprocess"),
    }

    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: pid belongs to our unreaped child
    if unsafe { libc::kill(pid as i32, libc::SIGTERM) } != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "failed to send SIGTERM");
    }
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(pid, %status, "subprocess terminated"),
        Ok(Err(e)) => warn!(pid, error = %e, "failed to wait for subprocess"),
        Err(_) => {
            warn!(pid, "subprocess ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "failed to kill subprocess");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn summary_script(verdict: &str) -> String {
        format!(
            "echo starting; printf '%s\\n' '{}' 'Ran 5 tests in 1.234s' '' '{verdict}'; sleep 30",
            "-".repeat(70)
        )
    }

    fn monitor(timeout: Duration) -> CompletionMonitor {
        CompletionMonitor::new(timeout)
    }

    #[test(tokio::test)]
    async fn ok_summary_passes_and_stops_child() {
        let started = std::time::Instant::now();
        let outcome = monitor(Duration::from_secs(20))
            .run(shell_command(&summary_script("OK")))
            .await
            .unwrap();

        assert_eq!(outcome, MonitorOutcome::Success);
        // the trailing sleep was cut short by SIGTERM
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test(tokio::test)]
    async fn failed_summary_is_failure() {
        let outcome = monitor(Duration::from_secs(20))
            .run(shell_command(&summary_script("FAILED (errors=2)")))
            .await
            .unwrap();

        assert_eq!(outcome, MonitorOutcome::Failure);
    }

    #[test(tokio::test)]
    async fn early_exit_without_summary() {
        let err = monitor(Duration::from_secs(20))
            .run(shell_command("echo hello; echo world"))
            .await
            .unwrap_err();

        assert!(matches!(err.current_context(), HarnessError::PatternNotFound));
    }

    #[test(tokio::test)]
    async fn early_exit_with_stderr_reports_it() {
        let err = monitor(Duration::from_secs(20))
            .run(shell_command("echo 'ModuleNotFoundError: sglang' >&2; exit 1"))
            .await
            .unwrap_err();

        match err.current_context() {
            HarnessError::SubprocessFailed { stderr } => {
                assert_eq!(stderr, "ModuleNotFoundError: sglang");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test(tokio::test)]
    async fn silent_child_times_out() {
        let err = monitor(Duration::from_secs(1))
            .run(shell_command("sleep 30"))
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            HarnessError::MonitorTimeout { .. }
        ));
    }

    #[test(tokio::test)]
    async fn missing_program_fails_to_launch() {
        let err = monitor(Duration::from_secs(1))
            .run(Command::new("/nonexistent/ci-harness-test-binary"))
            .await
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            HarnessError::LaunchFailed { .. }
        ));
    }

    #[test(tokio::test)]
    async fn invalid_utf8_line_does_not_end_the_watch() {
        let script = format!("printf 'progress \\377\\n'; {}", summary_script("OK"));

        let outcome = monitor(Duration::from_secs(20))
            .run(shell_command(&script))
            .await
            .unwrap();

        assert_eq!(outcome, MonitorOutcome::Success);
    }

    #[test]
    fn decode_line_strips_terminator_and_replaces_bad_bytes() {
        assert_eq!(decode_line(b"Ran 1 test in 0.1s\r\n"), "Ran 1 test in 0.1s");
        assert_eq!(decode_line(b"OK"), "OK");
        assert_eq!(decode_line(b"bar \xff\n"), "bar \u{fffd}");
    }

    #[test(tokio::test)]
    async fn stderr_held_open_by_grandchild_is_bounded() {
        let started = std::time::Instant::now();
        let err = monitor(Duration::from_secs(2))
            .run(shell_command("echo boom >&2; sleep 25 >/dev/null & echo hi"))
            .await
            .unwrap_err();

        // the background sleep keeps stderr open for 25s
        assert!(started.elapsed() < Duration::from_secs(15));
        match err.current_context() {
            HarnessError::SubprocessFailed { stderr } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test(tokio::test)]
    async fn lost_parent_stops_the_watch() {
        let mut exited = std::process::Command::new("true").spawn().unwrap();
        let exited_pid = exited.id() as i32;
        exited.wait().unwrap();

        let started = std::time::Instant::now();
        let err = monitor(Duration::from_secs(20))
            .with_parent_pid(exited_pid)
            .run(shell_command("sleep 30"))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        match err.current_context() {
            HarnessError::OrphanedMonitor { parent_pid } => assert_eq!(*parent_pid, exited_pid),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test(tokio::test)]
    async fn child_ignoring_sigterm_is_killed_after_grace() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = shell_command("trap '' TERM; echo ready; sleep 30")
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut ready = String::new();
        BufReader::new(stdout).read_line(&mut ready).await.unwrap();
        assert_eq!(ready.trim(), "ready");

        let started = std::time::Instant::now();
        terminate(&mut child).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= TERMINATE_GRACE, "killed after {elapsed:?}");
        assert!(elapsed < TERMINATE_GRACE + Duration::from_secs(5));
        let status = child.try_wait().unwrap().expect("child reaped");
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }
}
