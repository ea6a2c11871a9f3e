//! The destructive operations ddwarden offers.
//!
//! Every operation moves through the same states:
//!
//! 1. **Validated**: an [`Operation`] built by one of its constructors, which
//!    check the parameters and measure sizes up front.
//! 2. **Confirmed**: [`Operation::confirm`] asks a gate (normally a yes/no
//!    prompt) and only then yields a [`Confirmed`] operation.
//! 3. **Executing**: [`Confirmed::execute`] consumes the operation and runs
//!    one or more supervised tool invocations.
//! 4. **Terminal**: the returned [`Outcome`], after the operation's cleanup
//!    policy has been applied.
//!
//! Multi-step operations stop at the first step that does not succeed.
//! Teardown steps (closing a LUKS mapping, detaching a loop device) still run
//! once the matching setup step has succeeded, even after a cancellation.
use crate::command::{self, Filesystem, PartitionTable, Tools, WipeMethod};
use crate::error::{Error, Result};
use crate::outcome::Outcome;
use crate::passes::run_passes;
use crate::platform;
use crate::progress::ProgressSample;
use crate::request::{CleanupPolicy, OperationRequest};
use crate::size::DiskSize;
use crate::supervisor::Supervisor;
use std::fmt;
use std::path::{Path, PathBuf};

/// A LUKS passphrase. Never shown by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(Error::Validation("passphrase must not be empty".into()));
        }
        Ok(Self(secret))
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Something worth telling the operator while an operation runs.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A new step started.
    Stage(String),
    Progress(ProgressSample),
    /// A loop device was attached for an image.
    LoopDevice(PathBuf),
}

#[derive(Clone, Debug)]
pub enum Operation {
    /// File to disk.
    Flash {
        image: PathBuf,
        device: PathBuf,
        total: u64,
    },
    /// Disk to disk.
    Clone {
        source: PathBuf,
        device: PathBuf,
        total: u64,
    },
    /// Disk to a new image file.
    Image {
        device: PathBuf,
        output: PathBuf,
        total: u64,
    },
    Wipe {
        device: PathBuf,
        method: WipeMethod,
        total: u64,
    },
    PartitionTable {
        device: PathBuf,
        table: PartitionTable,
    },
    Format {
        target: PathBuf,
        filesystem: Filesystem,
    },
    EncryptedFormat {
        target: PathBuf,
        filesystem: Filesystem,
        passphrase: Passphrase,
    },
    VirtualDisk {
        path: PathBuf,
        size: DiskSize,
        filesystem: Filesystem,
    },
    Attach {
        image: PathBuf,
    },
    Detach {
        device: PathBuf,
    },
}

fn require_exists(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(Error::Validation(format!("{} does not exist", path.display())))
    }
}

fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::Validation(format!("{} is not a file", path.display())))
    }
}

/// The destination must be a file this operation creates, so that removing
/// it after a failure never destroys anything that existed before.
fn require_new_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(Error::Validation(format!(
            "{} already exists",
            path.display()
        )));
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if !parent.is_dir() {
        return Err(Error::Validation(format!(
            "{} is not a directory",
            parent.display()
        )));
    }
    Ok(())
}

fn require_distinct(a: &Path, b: &Path) -> Result<()> {
    if a == b {
        return Err(Error::Validation(format!(
            "source and destination are both {}",
            a.display()
        )));
    }
    Ok(())
}

impl Operation {
    pub fn flash(image: impl Into<PathBuf>, device: impl Into<PathBuf>) -> Result<Self> {
        let (image, device) = (image.into(), device.into());
        require_file(&image)?;
        require_exists(&device)?;
        require_distinct(&image, &device)?;
        let total = platform::device_size(&image)?;
        Ok(Operation::Flash {
            image,
            device,
            total,
        })
    }

    pub fn clone_disk(source: impl Into<PathBuf>, device: impl Into<PathBuf>) -> Result<Self> {
        let (source, device) = (source.into(), device.into());
        require_exists(&device)?;
        require_distinct(&source, &device)?;
        let total = platform::device_size(&source)?;
        Ok(Operation::Clone {
            source,
            device,
            total,
        })
    }

    pub fn image(device: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Result<Self> {
        let (device, output) = (device.into(), output.into());
        require_new_file(&output)?;
        let total = platform::device_size(&device)?;
        Ok(Operation::Image {
            device,
            output,
            total,
        })
    }

    pub fn wipe(device: impl Into<PathBuf>, method: WipeMethod) -> Result<Self> {
        let device = device.into();
        let total = platform::device_size(&device)?;
        Ok(Operation::Wipe {
            device,
            method,
            total,
        })
    }

    pub fn partition_table(device: impl Into<PathBuf>, table: PartitionTable) -> Result<Self> {
        let device = device.into();
        require_exists(&device)?;
        Ok(Operation::PartitionTable { device, table })
    }

    pub fn format(target: impl Into<PathBuf>, filesystem: Filesystem) -> Result<Self> {
        let target = target.into();
        require_exists(&target)?;
        Ok(Operation::Format { target, filesystem })
    }

    pub fn encrypted_format(
        target: impl Into<PathBuf>,
        filesystem: Filesystem,
        passphrase: Passphrase,
    ) -> Result<Self> {
        let target = target.into();
        require_exists(&target)?;
        Ok(Operation::EncryptedFormat {
            target,
            filesystem,
            passphrase,
        })
    }

    pub fn virtual_disk(
        path: impl Into<PathBuf>,
        size: DiskSize,
        filesystem: Filesystem,
    ) -> Result<Self> {
        let path = path.into();
        require_new_file(&path)?;
        Ok(Operation::VirtualDisk {
            path,
            size,
            filesystem,
        })
    }

    pub fn attach(image: impl Into<PathBuf>) -> Result<Self> {
        let image = image.into();
        require_file(&image)?;
        Ok(Operation::Attach { image })
    }

    pub fn detach(device: impl Into<PathBuf>) -> Result<Self> {
        let device = device.into();
        require_exists(&device)?;
        Ok(Operation::Detach { device })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Operation::Flash { .. } => "File to Disk",
            Operation::Clone { .. } => "Disk to Disk",
            Operation::Image { .. } => "Create Disk Image",
            Operation::Wipe { .. } => "Secure Erase",
            Operation::PartitionTable { .. } => "Create Partition Table",
            Operation::Format { .. } => "Format",
            Operation::EncryptedFormat { .. } => "Encrypted Format",
            Operation::VirtualDisk { .. } => "Create Virtual Disk",
            Operation::Attach { .. } => "Attach Image",
            Operation::Detach { .. } => "Detach Loop Device",
        }
    }

    /// Labelled parameters to show before asking for confirmation.
    pub fn details(&self) -> Vec<(&'static str, String)> {
        let size = |bytes: &u64| format!("{:.1} GB", *bytes as f64 / (1024.0 * 1024.0 * 1024.0));
        match self {
            Operation::Flash {
                image,
                device,
                total,
            } => vec![
                ("Image", image.display().to_string()),
                ("Device", device.display().to_string()),
                ("Size", size(total)),
            ],
            Operation::Clone {
                source,
                device,
                total,
            } => vec![
                ("Source", source.display().to_string()),
                ("Device", device.display().to_string()),
                ("Size", size(total)),
            ],
            Operation::Image {
                device,
                output,
                total,
            } => vec![
                ("Device", device.display().to_string()),
                ("Output", output.display().to_string()),
                ("Size", size(total)),
            ],
            Operation::Wipe {
                device,
                method,
                total,
            } => vec![
                ("Device", device.display().to_string()),
                ("Method", method.to_string()),
                ("Size", size(total)),
            ],
            Operation::PartitionTable { device, table } => vec![
                ("Device", device.display().to_string()),
                ("Table", table.to_string()),
            ],
            Operation::Format { target, filesystem } => vec![
                ("Target", target.display().to_string()),
                ("Filesystem", filesystem.to_string()),
            ],
            Operation::EncryptedFormat {
                target, filesystem, ..
            } => vec![
                ("Target", target.display().to_string()),
                ("Container", "LUKS".to_string()),
                ("Filesystem", filesystem.to_string()),
            ],
            Operation::VirtualDisk {
                path,
                size,
                filesystem,
            } => vec![
                ("Location", path.display().to_string()),
                ("Size", size.to_string()),
                ("Filesystem", filesystem.to_string()),
            ],
            Operation::Attach { image } => vec![("Image", image.display().to_string())],
            Operation::Detach { device } => vec![("Device", device.display().to_string())],
        }
    }

    /// The data-loss warning for this operation, if it destroys anything.
    pub fn warning(&self) -> Option<String> {
        match self {
            Operation::Flash { device, .. }
            | Operation::Clone { device, .. }
            | Operation::Wipe { device, .. }
            | Operation::PartitionTable { device, .. } => Some(format!(
                "This will destroy all data on {}!",
                device.display()
            )),
            Operation::Format { target, .. } | Operation::EncryptedFormat { target, .. } => Some(
                format!("This will destroy all data on {}!", target.display()),
            ),
            Operation::Image { .. }
            | Operation::VirtualDisk { .. }
            | Operation::Attach { .. }
            | Operation::Detach { .. } => None,
        }
    }

    /// Passes the operation through `gate`; `Ok(None)` means it was declined
    /// and nothing will run.
    pub fn confirm<E>(
        self,
        gate: impl FnOnce(&Operation) -> std::result::Result<bool, E>,
    ) -> std::result::Result<Option<Confirmed>, E> {
        if gate(&self)? {
            log::info!("{} confirmed", self.label());
            Ok(Some(Confirmed(self)))
        } else {
            log::info!("{} declined", self.label());
            Ok(None)
        }
    }
}

/// An operation the operator has agreed to. It can be executed once.
#[derive(Debug)]
pub struct Confirmed(Operation);

impl Confirmed {
    pub fn operation(&self) -> &Operation {
        &self.0
    }

    pub fn execute<F>(self, supervisor: &Supervisor, tools: &Tools, mut on_event: F) -> Outcome
    where
        F: FnMut(Event),
    {
        let label = self.0.label();
        let outcome = match self.0 {
            Operation::Flash {
                image,
                device,
                total,
            } => {
                on_event(Event::Stage("Writing".into()));
                let request = OperationRequest::new(&device, tools.dd_copy(&image, &device))
                    .source(&image)
                    .total_bytes(total);
                supervisor.run(request, |s| on_event(Event::Progress(s)))
            }
            Operation::Clone {
                source,
                device,
                total,
            } => {
                on_event(Event::Stage("Cloning".into()));
                let request = OperationRequest::new(&device, tools.dd_copy(&source, &device))
                    .source(&source)
                    .total_bytes(total);
                supervisor.run(request, |s| on_event(Event::Progress(s)))
            }
            Operation::Image {
                device,
                output,
                total,
            } => {
                on_event(Event::Stage("Imaging".into()));
                let request = OperationRequest::new(&output, tools.dd_copy(&device, &output))
                    .source(&device)
                    .total_bytes(total)
                    .cleanup(CleanupPolicy::DeleteDestination);
                supervisor.run(request, |s| on_event(Event::Progress(s)))
            }
            Operation::Wipe {
                device,
                method,
                total,
            } => {
                on_event(Event::Stage(format!("Erasing with {method}")));
                let mut size = total;
                run_passes(
                    supervisor,
                    method.passes(),
                    |pass| {
                        if pass > 0 {
                            size = recheck_size(&device, size);
                        }
                        OperationRequest::new(&device, tools.dd_wipe(method.source(), &device, size))
                            .source(method.source())
                            .total_bytes(size)
                    },
                    |s| on_event(Event::Progress(s)),
                )
            }
            Operation::PartitionTable { device, table } => {
                on_event(Event::Stage(format!(
                    "Creating {} partition table",
                    table.label()
                )));
                supervisor.run(
                    OperationRequest::new(&device, tools.mklabel(&device, table)),
                    |_| {},
                )
            }
            Operation::Format { target, filesystem } => {
                on_event(Event::Stage(format!("Creating {filesystem} filesystem")));
                supervisor.run(
                    OperationRequest::new(&target, tools.mkfs(filesystem, &target)),
                    |_| {},
                )
            }
            Operation::EncryptedFormat {
                target,
                filesystem,
                passphrase,
            } => encrypted_format(
                supervisor,
                tools,
                &target,
                filesystem,
                &passphrase,
                &mut on_event,
            ),
            Operation::VirtualDisk {
                path,
                size,
                filesystem,
            } => create_virtual_disk(supervisor, tools, &path, size, filesystem, &mut on_event),
            Operation::Attach { image } => {
                on_event(Event::Stage("Attaching loop device".into()));
                match attach_loop(supervisor, tools, &image) {
                    Ok(device) => {
                        on_event(Event::LoopDevice(device));
                        Outcome::Succeeded
                    }
                    Err(outcome) => outcome,
                }
            }
            Operation::Detach { device } => {
                on_event(Event::Stage("Detaching loop device".into()));
                supervisor.run(
                    OperationRequest::new(&device, tools.loop_detach(&device)),
                    |_| {},
                )
            }
        };

        log::info!("{} {}", label, outcome);
        outcome
    }
}

/// Re-reads the device size before a further wipe pass.
///
/// A changed size is used for the new pass; a failed read keeps the previous
/// value.
fn recheck_size(device: &Path, previous: u64) -> u64 {
    match platform::device_size(device) {
        Ok(size) if size != previous => {
            log::warn!(
                "Size of {} changed from {} to {} bytes between passes",
                device.display(),
                previous,
                size
            );
            size
        }
        Ok(size) => size,
        Err(e) => {
            log::warn!("{}; keeping {} bytes for this pass", e, previous);
            previous
        }
    }
}

fn mapping_name(target: &Path) -> String {
    let base = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "ddwarden".to_string());
    format!("{base}_crypt")
}

fn encrypted_format(
    supervisor: &Supervisor,
    tools: &Tools,
    target: &Path,
    filesystem: Filesystem,
    passphrase: &Passphrase,
    on_event: &mut dyn FnMut(Event),
) -> Outcome {
    let mapping = mapping_name(target);
    let mapped = Path::new("/dev/mapper").join(&mapping);

    on_event(Event::Stage("Creating encrypted container".into()));
    let outcome = supervisor.run(
        OperationRequest::new(target, tools.luks_format(target, passphrase.expose())),
        |_| {},
    );
    if !outcome.is_success() {
        return outcome;
    }

    on_event(Event::Stage("Opening encrypted container".into()));
    let outcome = supervisor.run(
        OperationRequest::new(target, tools.luks_open(target, &mapping, passphrase.expose())),
        |_| {},
    );
    if !outcome.is_success() {
        return outcome;
    }

    on_event(Event::Stage(format!("Creating {filesystem} filesystem")));
    let outcome = supervisor.run(
        OperationRequest::new(&mapped, tools.mkfs(filesystem, &mapped)),
        |_| {},
    );

    on_event(Event::Stage("Closing encrypted container".into()));
    let closed = supervisor.run_teardown(OperationRequest::new(&mapped, tools.luks_close(&mapping)));

    if outcome.is_success() { closed } else { outcome }
}

/// Allocates, attaches, formats and detaches a new image file.
///
/// The image is removed after any non-success, unless it is still attached to
/// a loop device because detaching failed.
fn create_virtual_disk(
    supervisor: &Supervisor,
    tools: &Tools,
    path: &Path,
    size: DiskSize,
    filesystem: Filesystem,
    on_event: &mut dyn FnMut(Event),
) -> Outcome {
    on_event(Event::Stage(format!("Allocating {size} image")));
    let request = OperationRequest::new(path, tools.dd_sparse(path, size))
        .cleanup(CleanupPolicy::DeleteDestination);
    let outcome = supervisor.run(request, |_| {});
    if !outcome.is_success() {
        return outcome;
    }

    on_event(Event::Stage("Attaching loop device".into()));
    let loop_device = match attach_loop(supervisor, tools, path) {
        Ok(device) => device,
        Err(outcome) => {
            CleanupPolicy::DeleteDestination.apply(path, &outcome);
            return outcome;
        }
    };

    on_event(Event::Stage(format!("Creating {filesystem} filesystem")));
    let outcome = supervisor.run(
        OperationRequest::new(&loop_device, tools.mkfs(filesystem, &loop_device)),
        |_| {},
    );

    on_event(Event::Stage("Detaching loop device".into()));
    let detached =
        supervisor.run_teardown(OperationRequest::new(&loop_device, tools.loop_detach(&loop_device)));

    if !detached.is_success() {
        log::warn!(
            "Keeping {}: it is still attached to {}",
            path.display(),
            loop_device.display()
        );
        return if outcome.is_success() { detached } else { outcome };
    }
    CleanupPolicy::DeleteDestination.apply(path, &outcome);
    outcome
}

/// Attaches `image` to the first free loop device and returns its path.
fn attach_loop(
    supervisor: &Supervisor,
    tools: &Tools,
    image: &Path,
) -> std::result::Result<PathBuf, Outcome> {
    if supervisor.cancel_token().is_cancelled() {
        return Err(Outcome::Cancelled);
    }
    match command::probe(&tools.loop_attach(image)) {
        Ok(device) if !device.is_empty() => Ok(PathBuf::from(device)),
        Ok(_) => Err(Outcome::failed(None, "losetup did not report a loop device")),
        Err(Error::Probe { code, stderr, .. }) => Err(Outcome::failed(code, stderr)),
        Err(e) => Err(Outcome::failed(None, e.to_string())),
    }
}
