//! Ownership of one running external command.
use crate::cancel::{self, CancelToken, Tracked};
use crate::request::CommandSpec;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::io::{self, Write};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// A child process owned by exactly one supervisor.
///
/// While it is alive its PID is published in the [`CancelToken`] (when one is
/// given) so that a cancellation can terminate it. Reaping and un-publishing
/// happen under the token's lock, so a late cancellation never signals a PID
/// that has already been reaped.
///
/// Dropping a process that has not been reaped kills it and reaps it on a
/// background thread.
pub(crate) struct SupervisedProcess {
    child: Option<Child>,
    pid: Pid,
    status: Option<ExitStatus>,
    token: Option<CancelToken>,
    signaller: Option<Vec<OsString>>,
}

impl SupervisedProcess {
    /// Starts `spec` with stdout discarded and stderr piped.
    ///
    /// The returned stderr handle belongs to the caller. Any `spec.input` is
    /// written to stdin, which is then closed.
    pub(crate) fn spawn(
        spec: &CommandSpec,
        token: Option<&CancelToken>,
    ) -> io::Result<(Self, ChildStderr)> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .stdin(if spec.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        log::debug!("Started {} as process {}", spec, pid);

        if let Some(token) = token {
            *token.lock_active() = Some(Tracked {
                pid,
                signaller: spec.signaller.clone(),
            });
        }

        let stderr = child.stderr.take();
        let mut process = Self {
            child: Some(child),
            pid,
            status: None,
            token: token.cloned(),
            signaller: spec.signaller.clone(),
        };

        if let (Some(input), Some(mut stdin)) = (
            spec.input.as_deref(),
            process.child.as_mut().and_then(|c| c.stdin.take()),
        ) {
            // A tool that exits early closes the pipe; that shows up in its exit status.
            if let Err(e) = stdin.write_all(input) {
                log::debug!("Writing stdin of process {} failed: {}", pid, e);
            }
        }

        match stderr {
            Some(stderr) => Ok((process, stderr)),
            None => {
                process.kill();
                Err(io::Error::other("child stderr was not captured"))
            }
        }
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    /// Non-blocking reap. Returns the exit status once the process has exited.
    pub(crate) fn try_reap(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };

        match &self.token {
            Some(token) => {
                let mut active = token.lock_active();
                let status = child.try_wait()?;
                if status.is_some() {
                    cancel::release(&mut active, self.pid);
                }
                self.status = status;
            }
            None => self.status = child.try_wait()?,
        }
        Ok(self.status)
    }

    /// Polls until the process exits or `timeout` elapses.
    pub(crate) fn wait_timeout(
        &mut self,
        timeout: Duration,
        poll: Duration,
    ) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_reap()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    /// Sends `sig` unless the process has already been reaped.
    pub(crate) fn signal(&self, sig: Signal) {
        if self.status.is_some() {
            return;
        }
        deliver(self.pid, sig, self.signaller.as_deref());
    }

    fn kill(&mut self) {
        self.signal(Signal::SIGKILL);
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        if let Some(token) = &self.token {
            cancel::release(&mut token.lock_active(), self.pid);
        }
        if self.status.is_some() {
            return;
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let pid = self.pid;
            thread::spawn(move || match child.wait() {
                Ok(status) => log::debug!("Reaped process {} in background ({})", pid, status),
                Err(e) => log::warn!("Could not reap process {}: {}", pid, e),
            });
        }
    }
}

/// Sends `sig` to `pid`. Returns `true` if the signal was delivered.
///
/// A child started through `sudo` runs as another user, so a direct `kill`
/// fails with `EPERM`; the signal then goes through `signaller`.
pub(crate) fn deliver(pid: Pid, sig: Signal, signaller: Option<&[OsString]>) -> bool {
    deliver_with(pid, sig, signaller, |pid, sig| signal::kill(pid, sig))
}

fn deliver_with<K>(pid: Pid, sig: Signal, signaller: Option<&[OsString]>, kill: K) -> bool
where
    K: FnOnce(Pid, Signal) -> nix::Result<()>,
{
    match kill(pid, sig) {
        Ok(()) => true,
        Err(Errno::ESRCH) => {
            log::debug!("{} to process {}: already gone", sig, pid);
            false
        }
        Err(Errno::EPERM) => match signaller {
            Some(prefix) if !prefix.is_empty() => signal_through(prefix, pid, sig),
            _ => {
                log::warn!("Not permitted to send {} to process {}", sig, pid);
                false
            }
        },
        Err(e) => {
            log::warn!("{} to process {} failed: {}", sig, pid, e);
            false
        }
    }
}

/// Runs `<prefix> kill -s <SIG> <pid>`.
fn signal_through(prefix: &[OsString], pid: Pid, sig: Signal) -> bool {
    let name = sig.as_str().trim_start_matches("SIG");
    let mut command = Command::new(&prefix[0]);
    command
        .args(&prefix[1..])
        .args(["kill", "-s", name])
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    log::debug!("Sending {} to process {} through {:?}", sig, pid, prefix[0]);
    match command.status() {
        Ok(status) if status.success() => true,
        Ok(status) => {
            log::warn!("Sending {} to process {} through {:?} {}", sig, pid, prefix[0], status);
            false
        }
        Err(e) => {
            log::warn!("Could not run {:?} to send {} to process {}: {}", prefix[0], sig, pid, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn publishes_and_clears_pid() {
        let token = CancelToken::new();
        let (mut process, _stderr) = SupervisedProcess::spawn(&sh("exit 0"), Some(&token)).unwrap();
        assert_eq!(token.lock_active().as_ref().map(|t| t.pid), Some(process.pid()));

        let status = process
            .wait_timeout(Duration::from_secs(5), Duration::from_millis(10))
            .unwrap()
            .expect("process should exit");
        assert!(status.success());
        assert!(token.lock_active().is_none());

        // Signalling a reaped process is a no-op.
        process.signal(Signal::SIGTERM);
        token.cancel();
    }

    #[test]
    fn feeds_stdin_then_closes_it() {
        let spec = sh("read line; echo \"got $line\" >&2").input("secret\n");
        let (mut process, mut stderr) = SupervisedProcess::spawn(&spec, None).unwrap();
        let mut text = String::new();
        stderr.read_to_string(&mut text).unwrap();
        assert_eq!(text.trim(), "got secret");
        let status = process
            .wait_timeout(Duration::from_secs(5), Duration::from_millis(10))
            .unwrap();
        assert!(status.is_some_and(|s| s.success()));
    }

    #[test]
    fn drop_kills_a_running_child() {
        let token = CancelToken::new();
        let (process, _stderr) = SupervisedProcess::spawn(&sh("exec sleep 30"), Some(&token)).unwrap();
        let pid = process.pid();
        drop(process);
        assert!(token.lock_active().is_none());

        // Give the background reaper a moment; afterwards the PID is gone.
        let deadline = Instant::now() + Duration::from_secs(5);
        while signal::kill(pid, None).is_ok() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(signal::kill(pid, None).is_err());
    }

    fn refuse(_: Pid, _: Signal) -> nix::Result<()> {
        Err(Errno::EPERM)
    }

    #[test]
    fn refused_signal_goes_through_signaller() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("signalled");
        let prefix: Vec<OsString> = vec![
            "/bin/sh".into(),
            "-c".into(),
            format!("echo \"$@\" > '{}'", record.display()).into(),
            "sh".into(),
        ];

        assert!(deliver_with(Pid::from_raw(4242), Signal::SIGTERM, Some(&prefix), refuse));
        let recorded = std::fs::read_to_string(&record).unwrap();
        assert_eq!(recorded.trim(), "kill -s TERM 4242");
    }

    #[test]
    fn signaller_reaches_a_running_child() {
        let (mut process, _stderr) = SupervisedProcess::spawn(&sh("exec sleep 30"), None).unwrap();
        // Stands in for `sudo -n`: runs the shell's own `kill`.
        let prefix: Vec<OsString> = vec!["/bin/sh".into(), "-c".into(), "\"$@\"".into(), "sh".into()];

        assert!(deliver_with(process.pid(), Signal::SIGKILL, Some(&prefix), refuse));
        let status = process
            .wait_timeout(Duration::from_secs(5), Duration::from_millis(10))
            .unwrap();
        assert!(status.is_some_and(|s| !s.success()));
    }

    #[test]
    fn refused_signal_without_signaller_is_reported() {
        assert!(!deliver_with(Pid::from_raw(4242), Signal::SIGTERM, None, refuse));
    }

    #[test]
    fn failing_signaller_is_reported() {
        let prefix: Vec<OsString> = vec!["/bin/sh".into(), "-c".into(), "exit 1".into()];
        assert!(!deliver_with(Pid::from_raw(4242), Signal::SIGTERM, Some(&prefix), refuse));
    }
}
