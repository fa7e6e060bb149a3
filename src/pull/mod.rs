// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pull orchestration: presence check, progress supervision, terminal state.
//!
//! [`PullOrchestrator::ensure`] turns "pull this model" into a supervised,
//! observable, idempotent operation:
//!
//! ```text
//! Idle -> CheckingPresence -> AlreadyPresent (terminal success)
//!                          -> NotPresent -> Pulling -> StreamingProgress*
//!                                                   -> Succeeded | Failed
//! ```
//!
//! Two sources of progress lines exist: the daemon's own streaming pull
//! endpoint and an external CLI executed as a subprocess. Both satisfy the
//! same [`ProgressEvent`] contract and the same idempotency and deadline
//! rules, so there is one consumer loop, not two call paths.
//!
//! Concurrent `ensure` calls for the same model name are serialized through
//! a per-name gate; the second caller re-checks presence after acquiring
//! the gate and finds the winner's artifact already installed, so the same
//! model never transfers twice.
//!
//! # Example
//!
//! ```no_run
//! use stablehand::config::ManagerConfig;
//! use stablehand::pull::{PullOrchestrator, PullResult, PullSource};
//! use stablehand::registry::RegistryClient;
//! use stablehand::transport::HttpTransport;
//!
//! let config = ManagerConfig::default();
//! let transport = HttpTransport::new(&config.host, config.connect_timeout())?;
//! let registry = RegistryClient::new(transport, &config);
//! let orchestrator = PullOrchestrator::new(registry, PullSource::Http);
//!
//! let result = orchestrator.ensure(
//!     "qwen3:0.6b",
//!     |event| {
//!         match event.percentage() {
//!             Some(pct) => println!("{}: {:.1}%", event.status, pct),
//!             None => println!("{}", event.status),
//!         }
//!         Ok(())
//!     },
//!     None,
//! );
//! assert!(matches!(result, PullResult::Success | PullResult::Failure(_) | PullResult::Cancelled));
//! # Ok::<(), stablehand::Error>(())
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io::BufRead;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::locks::resilient_lock;
use crate::progress::ProgressEvent;
use crate::registry::RegistryClient;
use crate::transport::Transport;

/// How often the process path wakes up to check cancellation and the
/// deadline while no line is arriving.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Terminal outcome of one pull request. Exactly one per `ensure` call.
#[derive(Debug, Clone, PartialEq)]
pub enum PullResult {
    Success,
    Failure(FailureCause),
    Cancelled,
}

impl PullResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for PullResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(cause) => write!(f, "failed: {}", cause),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a pull failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// Transport-level failure before or during the stream.
    Transport(Error),
    /// The deadline elapsed mid-pull.
    Timeout,
    /// The external pull command exited non-zero (code when available).
    ProcessExit(Option<i32>),
    /// The caller-supplied progress callback failed.
    Callback(String),
    /// The event stream broke, or closed reporting an error status.
    Stream(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Timeout => write!(f, "deadline exceeded"),
            Self::ProcessExit(Some(code)) => write!(f, "pull command exited with code {}", code),
            Self::ProcessExit(None) => write!(f, "pull command terminated by signal"),
            Self::Callback(msg) => write!(f, "progress callback failed: {}", msg),
            Self::Stream(msg) => write!(f, "pull stream failed: {}", msg),
        }
    }
}

/// Which transport carries the progress lines.
#[derive(Debug, Clone)]
pub enum PullSource {
    /// The daemon's streaming pull endpoint (NDJSON records).
    Http,
    /// An external CLI invoked as `<tool> pull <name>`; its combined
    /// stdout and stderr are treated as unstructured status text.
    Process(ProcessPull),
}

/// Configuration for the subprocess pull source.
#[derive(Debug, Clone)]
pub struct ProcessPull {
    tool: String,
}

impl ProcessPull {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }
}

/// Classify a stream that closed without an explicit terminal marker.
///
/// Inherited from the consumed protocol: a close whose last observed status
/// carries no error keyword is a successful pull. The daemon usually emits
/// a final `success` record, but its absence alone is benign.
pub(crate) fn classify_close(last_status: Option<&str>) -> PullResult {
    match last_status {
        Some(status) if status.to_ascii_lowercase().contains("error") => {
            PullResult::Failure(FailureCause::Stream(status.to_string()))
        }
        _ => PullResult::Success,
    }
}

fn deadline_exceeded(deadline: Option<Duration>, started: Instant) -> bool {
    deadline.is_some_and(|limit| started.elapsed() >= limit)
}

fn remaining(deadline: Option<Duration>, started: Instant) -> Option<Duration> {
    deadline.map(|limit| limit.saturating_sub(started.elapsed()))
}

/// Supervises pulls against one daemon.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct PullOrchestrator<T: Transport> {
    registry: RegistryClient<T>,
    source: PullSource,
    cancel: Arc<AtomicBool>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<T: Transport> PullOrchestrator<T> {
    pub fn new(registry: RegistryClient<T>, source: PullSource) -> Self {
        Self {
            registry,
            source,
            cancel: Arc::new(AtomicBool::new(false)),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Flag that cooperatively cancels in-flight pulls. Typically wired to
    /// a Ctrl+C handler by the binary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn registry(&self) -> &RegistryClient<T> {
        &self.registry
    }

    /// Ensure `name` is installed, pulling it if absent.
    ///
    /// * Already-installed models return `Success` immediately without a
    ///   transfer; calling `ensure` twice, sequentially or concurrently,
    ///   never re-downloads.
    /// * `on_progress` is invoked synchronously per event in stream order.
    ///   An `Err` from it aborts the pull; the stream is released (and the
    ///   subprocess reaped) before the failure is returned.
    /// * `deadline`, when given, bounds the whole operation. Expiry closes
    ///   the stream or kills the subprocess and yields a timeout failure.
    pub fn ensure<F>(
        &self,
        name: &str,
        mut on_progress: F,
        deadline: Option<Duration>,
    ) -> PullResult
    where
        F: FnMut(&ProgressEvent) -> anyhow::Result<()>,
    {
        let gate = self.gate_for(name);
        let _held = resilient_lock(&gate);

        // Presence is checked under the gate so a caller that lost the race
        // observes the winner's artifact instead of starting a second pull.
        match self.registry.has_model(name) {
            Ok(true) => {
                tracing::debug!(model = name, "already installed, skipping pull");
                return PullResult::Success;
            }
            Ok(false) => {}
            Err(e) => return PullResult::Failure(FailureCause::Transport(e)),
        }

        if self.cancel.load(Ordering::SeqCst) {
            return PullResult::Cancelled;
        }

        tracing::info!(model = name, "pulling");
        let started = Instant::now();
        let result = match &self.source {
            PullSource::Http => self.drive_http(name, &mut on_progress, deadline, started),
            PullSource::Process(process) => {
                self.drive_process(process, name, &mut on_progress, deadline, started)
            }
        };
        match &result {
            PullResult::Success => tracing::info!(model = name, "pull complete"),
            PullResult::Failure(cause) => tracing::warn!(model = name, cause = %cause, "pull failed"),
            PullResult::Cancelled => tracing::info!(model = name, "pull cancelled"),
        }
        result
    }

    fn gate_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut gates = resilient_lock(&self.gates);
        gates
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn drive_http<F>(
        &self,
        name: &str,
        on_progress: &mut F,
        deadline: Option<Duration>,
        started: Instant,
    ) -> PullResult
    where
        F: FnMut(&ProgressEvent) -> anyhow::Result<()>,
    {
        // The remaining deadline bounds the whole request, body reads
        // included, so a silent daemon cannot hold us past it.
        let attempt = match remaining(deadline, started) {
            Some(left) if left.is_zero() => return PullResult::Failure(FailureCause::Timeout),
            Some(left) => self.registry.pull_with_timeout(name, left),
            None => self.registry.pull(name),
        };
        let mut stream = match attempt {
            Ok(stream) => stream,
            Err(Error::Timeout(_)) => return PullResult::Failure(FailureCause::Timeout),
            Err(e) => return PullResult::Failure(FailureCause::Transport(e)),
        };

        while let Some(event) = stream.next() {
            if self.cancel.load(Ordering::SeqCst) {
                // dropping the stream closes the connection
                return PullResult::Cancelled;
            }
            if deadline_exceeded(deadline, started) {
                return PullResult::Failure(FailureCause::Timeout);
            }
            if let Err(e) = on_progress(&event) {
                tracing::warn!(model = name, error = %e, "progress callback failed, aborting");
                return PullResult::Failure(FailureCause::Callback(e.to_string()));
            }
        }

        stream.finish()
    }

    fn drive_process<F>(
        &self,
        process: &ProcessPull,
        name: &str,
        on_progress: &mut F,
        deadline: Option<Duration>,
        started: Instant,
    ) -> PullResult
    where
        F: FnMut(&ProgressEvent) -> anyhow::Result<()>,
    {
        let mut child = match spawn_pull_command(&process.tool, name) {
            Ok(child) => child,
            Err(e) => {
                return PullResult::Failure(FailureCause::Transport(Error::Io(format!(
                    "failed to spawn {}: {}",
                    process.tool, e
                ))))
            }
        };

        let lines = spawn_line_readers(&mut child);
        let mut last_status: Option<String> = None;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                kill_and_reap(child);
                return PullResult::Cancelled;
            }
            if deadline_exceeded(deadline, started) {
                kill_and_reap(child);
                return PullResult::Failure(FailureCause::Timeout);
            }

            match lines.recv_timeout(IDLE_POLL) {
                Ok(line) => {
                    let Some(event) = ProgressEvent::from_text_line(&line) else {
                        continue;
                    };
                    last_status = Some(event.status.clone());
                    if let Err(e) = on_progress(&event) {
                        tracing::warn!(model = name, error = %e, "progress callback failed, aborting");
                        kill_and_reap(child);
                        return PullResult::Failure(FailureCause::Callback(e.to_string()));
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Both pipes closed: the command is exiting. Reap it, bounded by
        // whatever deadline budget is left.
        match reap(child, remaining(deadline, started)) {
            Ok(status) if status.success() => classify_close(last_status.as_deref()),
            Ok(status) => PullResult::Failure(FailureCause::ProcessExit(status.code())),
            Err(e) => PullResult::Failure(FailureCause::Stream(e.to_string())),
        }
    }
}

fn spawn_pull_command(tool: &str, name: &str) -> std::io::Result<Child> {
    Command::new(tool)
        .args(["pull", name])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

/// Drain the child's stdout and stderr into one channel.
///
/// One reader thread per pipe; each preserves its own line order. The
/// channel disconnects once both pipes hit EOF, which is the consumer's
/// signal to reap.
fn spawn_line_readers(child: &mut Child) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();

    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        thread::spawn(move || {
            for line in std::io::BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        thread::spawn(move || {
            for line in std::io::BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }

    rx
}

/// Kill and reap a child whose outcome is already decided. Errors are
/// ignored; the child may have exited on its own in the meantime.
fn kill_and_reap(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Wait for the child to exit, bounded by the remaining deadline budget.
/// On expiry the child is killed first, so the wait always completes and
/// the process is never left as a zombie.
fn reap(
    mut child: Child,
    limit: Option<Duration>,
) -> std::io::Result<std::process::ExitStatus> {
    let Some(limit) = limit else {
        return child.wait();
    };

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if start.elapsed() >= limit {
            let _ = child.kill();
            return child.wait();
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_close_benign() {
        assert_eq!(classify_close(None), PullResult::Success);
        assert_eq!(classify_close(Some("success")), PullResult::Success);
        assert_eq!(
            classify_close(Some("verifying sha256 digest")),
            PullResult::Success
        );
    }

    #[test]
    fn test_classify_close_error_keyword() {
        match classify_close(Some("Error: manifest unknown")) {
            PullResult::Failure(FailureCause::Stream(status)) => {
                assert!(status.contains("manifest unknown"));
            }
            other => panic!("expected stream failure, got {:?}", other),
        }
    }

    #[test]
    fn test_failure_cause_display() {
        let cause = FailureCause::ProcessExit(Some(3));
        assert!(cause.to_string().contains("code 3"));

        let cause = FailureCause::ProcessExit(None);
        assert!(cause.to_string().contains("signal"));

        let cause = FailureCause::Callback("sink full".to_string());
        assert!(cause.to_string().contains("sink full"));
    }

    #[test]
    fn test_pull_result_display() {
        assert_eq!(PullResult::Success.to_string(), "success");
        assert_eq!(PullResult::Cancelled.to_string(), "cancelled");
        assert!(PullResult::Failure(FailureCause::Timeout)
            .to_string()
            .contains("deadline"));
    }

    #[test]
    fn test_deadline_helpers() {
        let started = Instant::now();
        assert!(!deadline_exceeded(None, started));
        assert!(deadline_exceeded(Some(Duration::ZERO), started));
        assert_eq!(remaining(None, started), None);
        assert!(remaining(Some(Duration::from_secs(60)), started).unwrap() > Duration::ZERO);
    }
}
