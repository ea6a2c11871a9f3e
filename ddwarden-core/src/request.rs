//! The description of one supervised tool invocation.
use crate::outcome::Outcome;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// An external program with its arguments and optional standard input.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Bytes written to the child's stdin before it is closed. `None` means
    /// stdin is connected to `/dev/null`.
    pub input: Option<Vec<u8>>,
    /// Command prefix that runs `kill` with the child's privileges, for
    /// children this process is not allowed to signal (e.g. `sudo -n`).
    pub signaller: Option<Vec<OsString>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input: None,
            signaller: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.input = Some(bytes.into());
        self
    }

    pub fn signal_via<I, S>(mut self, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.signaller = Some(prefix.into_iter().map(Into::into).collect());
        self
    }

    /// Runs this command through `prefix` (e.g. `sudo`), if any.
    pub fn elevated(self, prefix: Option<&str>) -> Self {
        match prefix {
            None => self,
            Some(prefix) => {
                let mut args = Vec::with_capacity(self.args.len() + 1);
                args.push(self.program);
                args.extend(self.args);
                Self {
                    program: prefix.into(),
                    args,
                    input: self.input,
                    signaller: self.signaller,
                }
            }
        }
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

// Input may hold a passphrase, so it is never printed.
impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("input", &self.input.as_ref().map(|_| "<redacted>"))
            .field("signaller", &self.signaller)
            .finish()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// What to do with the destination after a run that did not succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// In-place device operations: nothing to undo.
    #[default]
    None,
    /// The destination is a file this request creates; remove it.
    DeleteDestination,
}

impl CleanupPolicy {
    /// Applies the policy to `destination` given the run's `outcome`.
    ///
    /// Returns `true` if a file was removed.
    pub fn apply(self, destination: &Path, outcome: &Outcome) -> bool {
        if self != CleanupPolicy::DeleteDestination || outcome.is_success() {
            return false;
        }
        match fs::remove_file(destination) {
            Ok(()) => {
                log::info!("Removed partial artifact {}", destination.display());
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                log::warn!(
                    "Could not remove partial artifact {}: {}",
                    destination.display(),
                    e
                );
                false
            }
        }
    }
}

/// One destructive action, ready to be handed to the supervisor.
///
/// A request is consumed by [`crate::supervisor::Supervisor::run`].
#[derive(Clone, Debug)]
pub struct OperationRequest {
    pub source: Option<PathBuf>,
    pub destination: PathBuf,
    /// Expected number of bytes the tool will report, or 0 if unknown.
    pub total_bytes: u64,
    pub command: CommandSpec,
    pub cleanup: CleanupPolicy,
}

impl OperationRequest {
    pub fn new(destination: impl Into<PathBuf>, command: CommandSpec) -> Self {
        Self {
            source: None,
            destination: destination.into(),
            total_bytes: 0,
            command,
            cleanup: CleanupPolicy::None,
        }
    }

    pub fn source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn total_bytes(mut self, total: u64) -> Self {
        self.total_bytes = total;
        self
    }

    pub fn cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }
}
