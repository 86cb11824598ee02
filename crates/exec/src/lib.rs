//! dx execution engine.
//!
//! Runs external processes one at a time with live output, as a fail-stop
//! sequence, or as a bounded worker pool. All concurrency comes from child
//! processes; orchestration itself runs on one task.

#![forbid(unsafe_code)]

use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info_span, warn, Instrument};

mod command;

pub use command::{shell, CommandSpec, ExecOptions, ExecResult};

/// How long output pumps may linger after a timed-out child is killed.
fn drain_grace() -> Duration {
    let ms = std::env::var("DX_EXEC_DRAIN_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(500);
    Duration::from_millis(ms)
}

#[derive(Clone, Copy)]
enum Sink {
    Stdout,
    Stderr,
}

/// Process runner. Tracks how many children it has in flight.
#[derive(Debug, Default)]
pub struct Executor {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!("exec_in_flight", now as f64);
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest number of simultaneously running children seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        gauge!("exec_in_flight", now as f64);
        InFlight(&self.in_flight)
    }

    /// Spawn, relay output as it arrives, enforce the timeout, and report.
    pub async fn run_streaming(&self, spec: &CommandSpec) -> ExecResult {
        let span = info_span!("exec", service = spec.options.service.as_deref().unwrap_or("-"));
        self.run_inner(spec).instrument(span).await
    }

    async fn run_inner(&self, spec: &CommandSpec) -> ExecResult {
        let started = Instant::now();
        counter!("exec_commands_total", 1u64);
        debug!(command = %spec.display(), "executing");

        let mut cmd = tokio::process::Command::from(spec.to_std());
        cmd.stdin(std::process::Stdio::inherit())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let _guard = self.enter();
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                counter!("exec_failures_total", 1u64);
                error!(command = %spec.display(), error = %e, "failed to execute command");
                return ExecResult::spawn_failure(e.to_string(), started.elapsed());
            }
        };

        let echo = spec.options.echo;
        let out_task = tokio::spawn(pump(child.stdout.take(), Sink::Stdout, echo));
        let err_task = tokio::spawn(pump(child.stderr.take(), Sink::Stderr, echo));

        let (status, timed_out) = wait_with_timeout(&mut child, spec.options.timeout).await;
        // a killed shell can leave grandchildren holding the pipes
        let grace = timed_out.then(drain_grace);
        let stdout = collect(out_task, grace).await;
        let stderr = collect(err_task, grace).await;

        let duration = started.elapsed();
        histogram!("exec_duration_ms", duration.as_secs_f64() * 1000.0);

        let result = match status {
            Ok(status) => {
                let success = status.success() && !timed_out;
                ExecResult { code: exit_code(status), stdout, stderr, success, timed_out, duration }
            }
            Err(e) => {
                let mut r = ExecResult::spawn_failure(e.to_string(), duration);
                r.stdout = stdout;
                r
            }
        };

        if timed_out {
            counter!("exec_timeouts_total", 1u64);
            let timeout_ms = spec.options.timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
            if spec.options.ignore_errors {
                warn!(timeout_ms, "command timed out");
            } else {
                error!(timeout_ms, "command timed out");
            }
        }
        if !result.success {
            counter!("exec_failures_total", 1u64);
            if !spec.options.ignore_errors && !timed_out {
                error!(code = result.code, command = %spec.display(), "command failed");
            }
        }
        result
    }

    /// Run in order. With `stop_on_error`, the first failure ends the run and later commands
    /// are neither started nor reported.
    pub async fn run_sequence(&self, specs: &[CommandSpec], stop_on_error: bool) -> Vec<ExecResult> {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            let r = self.run_streaming(spec).await;
            let failed = !r.success;
            results.push(r);
            if stop_on_error && failed {
                error!("stopping sequence due to error");
                break;
            }
        }
        results
    }

    /// Worker pool of `min(concurrency, n)` workers claiming indices from a shared counter.
    /// Each worker has at most one child in flight. Results are index-aligned with `specs`.
    pub async fn run_parallel(&self, specs: &[CommandSpec], concurrency: usize) -> Vec<ExecResult> {
        if specs.is_empty() {
            return Vec::new();
        }
        let workers = concurrency.max(1).min(specs.len());
        let next = AtomicUsize::new(0);
        let next = &next;

        let batches = join_all((0..workers).map(|_| async move {
            let mut done = Vec::new();
            loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(spec) = specs.get(idx) else {
                    break;
                };
                done.push((idx, self.run_streaming(spec).await));
            }
            done
        }))
        .await;

        let mut slots: Vec<Option<ExecResult>> = vec![None; specs.len()];
        for (idx, r) in batches.into_iter().flatten() {
            slots[idx] = Some(r);
        }
        slots.into_iter().flatten().collect()
    }

    /// Captured synchronous run for short probes. Built from the same spec as the async path;
    /// no timeout and no live relay.
    pub fn run_blocking(&self, spec: &CommandSpec) -> ExecResult {
        let started = Instant::now();
        debug!(command = %spec.display(), "executing (blocking)");
        match spec.to_std().stdin(std::process::Stdio::null()).output() {
            Ok(out) => {
                let success = out.status.success();
                if !success && !spec.options.ignore_errors {
                    warn!(code = exit_code(out.status), command = %spec.display(), "command failed");
                }
                ExecResult {
                    code: exit_code(out.status),
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                    success,
                    timed_out: false,
                    duration: started.elapsed(),
                }
            }
            Err(e) => {
                if !spec.options.ignore_errors {
                    warn!(command = %spec.display(), error = %e, "failed to execute command");
                }
                ExecResult::spawn_failure(e.to_string(), started.elapsed())
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

async fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> (std::io::Result<ExitStatus>, bool) {
    let Some(limit) = timeout else {
        return (child.wait().await, false);
    };
    let waited = tokio::time::timeout(limit, child.wait()).await;
    match waited {
        Ok(status) => (status, false),
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill timed-out child");
            }
            (child.wait().await, true)
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, sink: Sink, echo: bool) -> Vec<u8> {
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut stream = ReaderStream::new(reader);
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if echo {
                    relay(sink, &bytes).await;
                }
                buf.extend_from_slice(&bytes);
            }
            Err(e) => {
                warn!(error = %e, "output read failed");
                break;
            }
        }
    }
    buf
}

async fn relay(sink: Sink, bytes: &[u8]) {
    let res = match sink {
        Sink::Stdout => {
            let mut out = tokio::io::stdout();
            match out.write_all(bytes).await {
                Ok(()) => out.flush().await,
                Err(e) => Err(e),
            }
        }
        Sink::Stderr => {
            let mut err = tokio::io::stderr();
            match err.write_all(bytes).await {
                Ok(()) => err.flush().await,
                Err(e) => Err(e),
            }
        }
    };
    if let Err(e) = res {
        debug!(error = %e, "relay write failed");
    }
}

async fn collect(mut task: JoinHandle<Vec<u8>>, grace: Option<Duration>) -> String {
    let bytes = match grace {
        None => task.await.unwrap_or_default(),
        Some(g) => match tokio::time::timeout(g, &mut task).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                task.abort();
                Vec::new()
            }
        },
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let ex = Executor::new();
        let ok = ex.run_streaming(&shell("echo hello; echo oops >&2").quiet()).await;
        assert!(ok.success);
        assert_eq!(ok.code, 0);
        assert_eq!(ok.stdout, "hello\n");
        assert_eq!(ok.stderr, "oops\n");

        let bad = ex.run_streaming(&shell("exit 3").quiet().ignore_errors(true)).await;
        assert!(!bad.success);
        assert_eq!(bad.code, 3);
        assert!(!bad.timed_out);
    }

    #[tokio::test]
    async fn missing_program_is_a_failed_result() {
        let ex = Executor::new();
        let r = ex.run_streaming(&CommandSpec::new("dx-definitely-not-a-binary", Vec::<String>::new()).quiet()).await;
        assert!(!r.success);
        assert_eq!(r.code, 1);
        assert!(!r.stderr.is_empty());
    }

    #[tokio::test]
    async fn env_and_cwd_reach_the_child() {
        let ex = Executor::new();
        let dir = std::env::temp_dir();
        let r = ex.run_streaming(&shell("echo \"$DX_NAMESPACE\"; pwd").env("DX_NAMESPACE", "dev-alice").cwd(&dir).quiet()).await;
        assert!(r.success);
        let mut lines = r.stdout.lines();
        assert_eq!(lines.next(), Some("dev-alice"));
        assert!(lines.next().is_some());
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn ignored_timeout_logs_a_warning_not_an_error() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let ex = Executor::new();
        let spec = shell("exec sleep 5").quiet().ignore_errors(true).timeout(Some(Duration::from_millis(100)));
        let r = ex.run_streaming(&spec).await;
        assert!(r.timed_out);

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("command timed out"), "{}", logs);
        assert!(logs.contains("WARN"), "{}", logs);
        assert!(!logs.contains("ERROR"), "{}", logs);
    }

    #[test]
    fn blocking_run_shares_the_builder() {
        let ex = Executor::new();
        let r = ex.run_blocking(&shell("printf abc; exit 2").ignore_errors(true));
        assert_eq!(r.stdout, "abc");
        assert_eq!(r.code, 2);
        assert!(!r.success);
        let missing = ex.run_blocking(&CommandSpec::new("dx-definitely-not-a-binary", ["x"]).ignore_errors(true));
        assert!(!missing.success);
    }
}
