//! Runs one external tool to completion, cancellation or failure.
//!
//! The supervisor starts the command described by an [`OperationRequest`],
//! follows its stderr for `<N> bytes` status lines, and turns whatever
//! happens into exactly one [`Outcome`]:
//!
//! - exit code 0: [`Outcome::Succeeded`], even if no progress was ever seen;
//! - the [`CancelToken`] was set: [`Outcome::Cancelled`], after terminating
//!   the child (SIGTERM, then SIGKILL once the grace period runs out);
//! - anything else: [`Outcome::Failed`] with the tool's own error output.
//!
//! The request's [`crate::request::CleanupPolicy`] is applied before
//! returning.
use crate::cancel::CancelToken;
use crate::outcome::Outcome;
use crate::process::SupervisedProcess;
use crate::progress::{ProgressSample, parse_bytes};
use crate::request::OperationRequest;
use nix::sys::signal::Signal;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::process::{ChildStderr, ExitStatus};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Upper bound on the stderr text kept for a failure report. Only a runaway
/// tool gets near it; the oldest lines are dropped first and counted.
const DIAGNOSTIC_LIMIT: usize = 1 << 20;

#[derive(Clone, Copy, Debug)]
pub struct SupervisorConfig {
    /// How long a terminated child gets to exit before it is killed.
    pub grace_period: Duration,
    /// Upper bound on how long a cancellation can go unnoticed.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Supervisor {
    cancel: CancelToken,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(cancel: CancelToken) -> Self {
        Self::with_config(cancel, SupervisorConfig::default())
    }

    pub fn with_config(cancel: CancelToken, config: SupervisorConfig) -> Self {
        Self { cancel, config }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Runs `request`, reporting each parsed status line to `on_progress`.
    ///
    /// Samples are delivered on the calling thread, in the order the tool
    /// printed them. Counts that go backwards are passed through as-is.
    pub fn run<F>(&self, request: OperationRequest, mut on_progress: F) -> Outcome
    where
        F: FnMut(ProgressSample),
    {
        let outcome = if self.cancel.is_cancelled() {
            log::info!("Not starting {}: cancellation already requested", request.command);
            Outcome::Cancelled
        } else {
            self.supervise(&request, Some(&self.cancel), &mut on_progress)
        };

        log::info!("{} {}", request.command.program_name(), outcome);
        request.cleanup.apply(&request.destination, &outcome);
        outcome
    }

    /// Runs a short teardown step (closing a mapping, detaching a loop
    /// device) that must happen even after a cancellation.
    ///
    /// The step neither observes nor can be terminated by the cancel token.
    pub fn run_teardown(&self, request: OperationRequest) -> Outcome {
        let outcome = self.supervise(&request, None, &mut |_: ProgressSample| {});
        if !outcome.is_success() {
            log::warn!("Teardown {} {}", request.command, outcome);
        }
        request.cleanup.apply(&request.destination, &outcome);
        outcome
    }

    fn supervise(
        &self,
        request: &OperationRequest,
        cancel: Option<&CancelToken>,
        on_progress: &mut dyn FnMut(ProgressSample),
    ) -> Outcome {
        let program = request.command.program_name();
        let cancelled = || cancel.is_some_and(CancelToken::is_cancelled);

        let (mut process, stderr) = match SupervisedProcess::spawn(&request.command, cancel) {
            Ok(started) => started,
            Err(e) => {
                log::error!("Failed to start {}: {}", program, e);
                return Outcome::failed(None, format!("failed to start {program}: {e}"));
            }
        };

        let lines = spawn_line_reader(stderr);
        let mut diagnostic = Diagnostic::default();

        loop {
            if cancelled() {
                return self.terminate(process, &program);
            }
            match lines.recv_timeout(self.config.poll_interval) {
                Ok(line) => match parse_bytes(&line) {
                    Some(bytes) => on_progress(ProgressSample::new(bytes, request.total_bytes)),
                    None => diagnostic.push(line),
                },
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = loop {
            if cancelled() {
                return self.terminate(process, &program);
            }
            match process.try_reap() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(self.config.poll_interval),
                Err(e) => return Outcome::failed(None, format!("failed to wait for {program}: {e}")),
            }
        };

        // A tool that already finished its work keeps its success, even if the
        // signal arrived while it was being reaped.
        if cancelled() && !status.success() {
            return Outcome::Cancelled;
        }
        classify(status, &program, diagnostic)
    }

    /// Stops reading, asks the child to exit, and escalates if it does not.
    fn terminate(&self, mut process: SupervisedProcess, program: &str) -> Outcome {
        let SupervisorConfig {
            grace_period,
            poll_interval,
        } = self.config;

        if let Ok(Some(status)) = process.try_reap() {
            if status.success() {
                log::info!("{} finished before the cancellation reached it", program);
                return Outcome::Succeeded;
            }
            return Outcome::Cancelled;
        }

        log::warn!("Terminating {} (process {})", program, process.pid());
        process.signal(Signal::SIGTERM);
        if let Ok(Some(_)) = process.wait_timeout(grace_period, poll_interval) {
            return Outcome::Cancelled;
        }

        log::warn!(
            "{} did not exit within {:?}, sending SIGKILL",
            program,
            grace_period
        );
        process.signal(Signal::SIGKILL);
        if !matches!(process.wait_timeout(grace_period, poll_interval), Ok(Some(_))) {
            log::warn!(
                "{} (process {}) could not be confirmed dead; it will be reaped in the background",
                program,
                process.pid()
            );
        }
        Outcome::Cancelled
    }
}

fn classify(status: ExitStatus, program: &str, diagnostic: Diagnostic) -> Outcome {
    if status.success() {
        return Outcome::Succeeded;
    }
    let text = diagnostic
        .into_text()
        .unwrap_or_else(|| format!("{program} exited with {status}"));
    Outcome::failed(status.code(), text)
}

/// The tool's non-progress output, line for line as it was written.
struct Diagnostic {
    lines: VecDeque<String>,
    bytes: usize,
    omitted: usize,
    limit: usize,
}

impl Default for Diagnostic {
    fn default() -> Self {
        Self::with_limit(DIAGNOSTIC_LIMIT)
    }
}

impl Diagnostic {
    fn with_limit(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            omitted: 0,
            limit,
        }
    }

    fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
                self.omitted += 1;
            }
        }
    }

    /// The kept lines joined with `\n`, or `None` if the tool said nothing
    /// but whitespace.
    fn into_text(self) -> Option<String> {
        if self.lines.iter().all(|l| l.trim().is_empty()) && self.omitted == 0 {
            return None;
        }
        let body = Vec::from(self.lines).join("\n");
        Some(if self.omitted > 0 {
            format!("[… {} earlier lines omitted]\n{}", self.omitted, body)
        } else {
            body
        })
    }
}

/// Forwards stderr line by line from a dedicated thread.
///
/// Both `\n` and `\r` end a line: `dd status=progress` redraws its status
/// line with carriage returns and only prints a newline at the very end. The
/// channel disconnects when the stream reaches end-of-file.
fn spawn_line_reader(mut stderr: ChildStderr) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        let mut splitter = LineSplitter::default();
        loop {
            let n = match stderr.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            for line in splitter.feed(&chunk[..n]) {
                if tx.send(line).is_err() {
                    return;
                }
            }
        }
        if let Some(line) = splitter.finish() {
            let _ = tx.send(line);
        }
    });
    rx
}

/// Splits a byte stream into lines on `\n`, `\r` and `\r\n`.
///
/// Blank lines ended by `\n` are kept. An empty segment before a lone `\r` is
/// a status-line redraw and is dropped.
#[derive(Default)]
struct LineSplitter {
    line: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            match byte {
                b'\n' => {
                    if !(self.after_cr && self.line.is_empty()) {
                        lines.push(self.take());
                    }
                    self.after_cr = false;
                }
                b'\r' => {
                    if !self.line.is_empty() {
                        lines.push(self.take());
                    }
                    self.after_cr = true;
                }
                _ => {
                    self.line.push(byte);
                    self.after_cr = false;
                }
            }
        }
        lines
    }

    fn finish(mut self) -> Option<String> {
        (!self.line.is_empty()).then(|| self.take())
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        line
    }
}
