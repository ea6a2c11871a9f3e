mod ui;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use console::style;
use ddwarden_core::cancel::CancelToken;
use ddwarden_core::catalog::Operation;
use ddwarden_core::command::{Filesystem, PartitionTable, Privilege, Tools, WipeMethod};
use ddwarden_core::device::Device;
use ddwarden_core::outcome::Outcome;
use ddwarden_core::platform;
use ddwarden_core::size::DiskSize;
use ddwarden_core::supervisor::{Supervisor, SupervisorConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use ui::{ProgressView, Targets};

#[derive(Parser)]
#[command(name = "ddwarden")]
#[command(about = "A supervised console for dd, wipe, partition and format operations", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// How tools get root privileges
    #[arg(long, value_enum, default_value_t = PrivilegeArg::Auto, global = true)]
    privilege: PrivilegeArg,

    /// Seconds a cancelled tool gets to exit before it is killed
    #[arg(long, value_name = "SECS", default_value_t = 5, global = true)]
    grace: u64,

    /// Log more (-v for info, -vv for debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image file to a disk
    Flash {
        /// Image file to write
        image: PathBuf,
    },
    /// Copy one disk onto another
    Clone,
    /// Save a disk to a new image file
    Image {
        /// Output image file; must not exist yet
        output: PathBuf,
    },
    /// Overwrite a disk in one or more passes
    Wipe {
        #[arg(long, value_enum, default_value_t = MethodArg::Zero)]
        method: MethodArg,
    },
    /// Write a new, empty partition table
    Mklabel {
        #[arg(long, value_enum, default_value_t = TableArg::Gpt)]
        table: TableArg,
    },
    /// Create a filesystem on a disk or partition
    Format {
        #[arg(long = "fs", default_value = "ext4")]
        filesystem: Filesystem,

        /// Put the filesystem inside a LUKS container
        #[arg(long)]
        encrypt: bool,
    },
    /// Manage file-backed virtual disks
    #[command(subcommand)]
    Vdisk(VdiskCommands),
    /// List block devices
    List,
}

#[derive(Subcommand)]
enum VdiskCommands {
    /// Create a sparse image and format it through a loop device
    Create {
        path: PathBuf,

        /// Size such as 500M or 4G
        #[arg(long)]
        size: DiskSize,

        #[arg(long = "fs", default_value = "ext4")]
        filesystem: Filesystem,
    },
    /// Attach an image to a free loop device
    Attach { image: PathBuf },
    /// Detach a loop device
    Detach { device: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum PrivilegeArg {
    /// sudo unless already root
    Auto,
    Sudo,
    /// Run tools directly
    #[value(name = "none")]
    Direct,
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    /// One pass from /dev/zero
    Zero,
    /// Three passes from /dev/random
    Random,
    /// Seven passes from /dev/urandom
    Urandom,
}

impl From<MethodArg> for WipeMethod {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Zero => WipeMethod::Zero,
            MethodArg::Random => WipeMethod::Random,
            MethodArg::Urandom => WipeMethod::Urandom,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TableArg {
    Msdos,
    Gpt,
}

impl From<TableArg> for PartitionTable {
    fn from(arg: TableArg) -> Self {
        match arg {
            TableArg::Msdos => PartitionTable::Msdos,
            TableArg::Gpt => PartitionTable::Gpt,
        }
    }
}

/// Everything an operation needs to run, shared by all of a session's
/// operations.
struct Session {
    supervisor: Supervisor,
    tools: Tools,
}

impl Session {
    fn cancelled(&self) -> bool {
        self.supervisor.cancel_token().is_cancelled()
    }

    /// Confirms `op` with the operator and runs it with a progress view.
    ///
    /// A declined operation counts as a success: nothing was asked to happen.
    fn perform(&self, op: Operation) -> Result<Outcome> {
        let Some(confirmed) = op.confirm(ui::confirm_operation)? else {
            return Ok(Outcome::Succeeded);
        };
        let label = confirmed.operation().label();

        println!();
        let mut view = ProgressView::new();
        let outcome = confirmed.execute(&self.supervisor, &self.tools, |e| view.on_event(e));
        view.finish(&outcome);

        match &outcome {
            Outcome::Succeeded => println!("\n✨ {} completed successfully.", label),
            Outcome::Cancelled => println!("\n{} {} was cancelled.", style("Cancelled:").yellow().bold(), label),
            Outcome::Failed { diagnostic, .. } => {
                eprintln!("\n{} {} failed:", style("Error:").red().bold(), label);
                for line in diagnostic.lines() {
                    eprintln!("  {line}");
                }
            }
        }
        Ok(outcome)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn devices() -> Result<Vec<Device>> {
    Ok(platform::list_devices()?)
}

/// `disk_image_<unix seconds>.img` style names for new image files.
fn default_file_name(stem: &str) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{stem}_{secs}.img")
}

fn pick_filesystem() -> Result<Filesystem> {
    let default = Filesystem::ALL
        .iter()
        .position(|fs| *fs == Filesystem::Ext4)
        .unwrap_or(0);
    ui::choose("Select filesystem", &Filesystem::ALL, default)
}

fn flash_op(image: PathBuf) -> Result<Operation> {
    let device = ui::select_device(&devices()?, Targets::Disks, "Select the target device to WRITE to")?;
    Ok(Operation::flash(image, device.path)?)
}

fn clone_op() -> Result<Operation> {
    let devices = devices()?;
    let source = ui::select_device(&devices, Targets::Disks, "Select the SOURCE disk")?;
    let target = ui::select_device(&devices, Targets::Disks, "Select the TARGET disk")?;
    Ok(Operation::clone_disk(source.path, target.path)?)
}

fn image_op(output: PathBuf) -> Result<Operation> {
    let device = ui::select_device(&devices()?, Targets::Disks, "Select the source device to READ from")?;
    Ok(Operation::image(device.path, output)?)
}

fn wipe_op(method: WipeMethod) -> Result<Operation> {
    let device = ui::select_device(&devices()?, Targets::Disks, "Select the device to ERASE")?;
    Ok(Operation::wipe(device.path, method)?)
}

fn mklabel_op(table: PartitionTable) -> Result<Operation> {
    let device = ui::select_device(&devices()?, Targets::Disks, "Select the device to partition")?;
    Ok(Operation::partition_table(device.path, table)?)
}

fn format_op(filesystem: Filesystem, encrypt: bool) -> Result<Operation> {
    let target = ui::select_device(&devices()?, Targets::Any, "Select the device or partition to FORMAT")?;
    if encrypt {
        let passphrase = ui::ask_passphrase()?;
        Ok(Operation::encrypted_format(target.path, filesystem, passphrase)?)
    } else {
        Ok(Operation::format(target.path, filesystem)?)
    }
}

fn detach_op(device: Option<PathBuf>) -> Result<Operation> {
    let device = match device {
        Some(device) => device,
        None => ui::select_device(&devices()?, Targets::Loops, "Select the loop device to detach")?.path,
    };
    Ok(Operation::detach(device)?)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MenuItem {
    Flash,
    Clone,
    PartitionTable,
    Format,
    Wipe,
    Image,
    VirtualDisk,
    Attach,
    Detach,
    List,
    Exit,
}

impl MenuItem {
    const ALL: [MenuItem; 11] = [
        MenuItem::Flash,
        MenuItem::Clone,
        MenuItem::PartitionTable,
        MenuItem::Format,
        MenuItem::Wipe,
        MenuItem::Image,
        MenuItem::VirtualDisk,
        MenuItem::Attach,
        MenuItem::Detach,
        MenuItem::List,
        MenuItem::Exit,
    ];
}

impl std::fmt::Display for MenuItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MenuItem::Flash => "File to Disk",
            MenuItem::Clone => "Disk to Disk",
            MenuItem::PartitionTable => "Create Partition Table",
            MenuItem::Format => "Format",
            MenuItem::Wipe => "Secure Erase",
            MenuItem::Image => "Create Disk Image",
            MenuItem::VirtualDisk => "Create Virtual Disk",
            MenuItem::Attach => "Attach Image",
            MenuItem::Detach => "Detach Loop Device",
            MenuItem::List => "List Disks",
            MenuItem::Exit => "Exit",
        })
    }
}

/// Gathers the parameters for one menu entry. `None` for entries that run no
/// operation.
fn menu_operation(item: MenuItem) -> Result<Option<Operation>> {
    let op = match item {
        MenuItem::Flash => flash_op(ui::ask_text("Path to the image file", None)?.into())?,
        MenuItem::Clone => clone_op()?,
        MenuItem::PartitionTable => {
            mklabel_op(ui::choose("Select partition table type", &PartitionTable::ALL, 1)?)?
        }
        MenuItem::Format => {
            let filesystem = pick_filesystem()?;
            let encrypt = ui::ask_yes_no("Encrypt with LUKS?", false)?;
            format_op(filesystem, encrypt)?
        }
        MenuItem::Wipe => wipe_op(ui::choose("Select erase method", &WipeMethod::ALL, 0)?)?,
        MenuItem::Image => {
            let output = ui::ask_text("Output image file", Some(default_file_name("disk_image")))?;
            image_op(output.into())?
        }
        MenuItem::VirtualDisk => {
            let path = ui::ask_text("Virtual disk location", Some(default_file_name("virtual_disk")))?;
            let size = ui::ask_size("Size (e.g. 500M, 1G)")?;
            Operation::virtual_disk(path, size, pick_filesystem()?)?
        }
        MenuItem::Attach => Operation::attach(ui::ask_text("Path to the image file", None)?)?,
        MenuItem::Detach => detach_op(None)?,
        MenuItem::List => {
            ui::print_devices(&devices()?);
            return Ok(None);
        }
        MenuItem::Exit => return Ok(None),
    };
    Ok(Some(op))
}

/// The interactive console. Runs until Exit is chosen or an operation is
/// cancelled; the cancellation signal cannot be reset within a session.
fn menu(session: &Session) -> Result<Outcome> {
    loop {
        println!();
        let item = ui::choose(&format!("{}", style("ddwarden").bold()), &MenuItem::ALL, 0)?;
        if item == MenuItem::Exit {
            return Ok(Outcome::Succeeded);
        }

        let outcome = match menu_operation(item) {
            Ok(Some(op)) => session.perform(op)?,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{} {:#}", style("Error:").red().bold(), e);
                continue;
            }
        };

        if session.cancelled() {
            return Ok(Outcome::Cancelled);
        }
        log::debug!("Menu operation {}", outcome);
    }
}

fn run(cli: Cli, session: &Session) -> Result<Outcome> {
    let op = match cli.command {
        None => return menu(session),
        Some(Commands::List) => {
            ui::print_devices(&devices()?);
            return Ok(Outcome::Succeeded);
        }
        Some(Commands::Flash { image }) => flash_op(image)?,
        Some(Commands::Clone) => clone_op()?,
        Some(Commands::Image { output }) => image_op(output)?,
        Some(Commands::Wipe { method }) => wipe_op(method.into())?,
        Some(Commands::Mklabel { table }) => mklabel_op(table.into())?,
        Some(Commands::Format { filesystem, encrypt }) => format_op(filesystem, encrypt)?,
        Some(Commands::Vdisk(VdiskCommands::Create {
            path,
            size,
            filesystem,
        })) => Operation::virtual_disk(path, size, filesystem)?,
        Some(Commands::Vdisk(VdiskCommands::Attach { image })) => Operation::attach(image)?,
        Some(Commands::Vdisk(VdiskCommands::Detach { device })) => detach_op(Some(device))?,
    };
    session.perform(op)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Restores the terminal when main() returns.
    let _echo_guard = ui::EchoGuard::new();

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        return ExitCode::FAILURE;
    }

    let privilege = match cli.privilege {
        PrivilegeArg::Auto => Privilege::detect(),
        PrivilegeArg::Sudo => Privilege::Sudo,
        PrivilegeArg::Direct => Privilege::Direct,
    };
    let config = SupervisorConfig {
        grace_period: Duration::from_secs(cli.grace),
        ..SupervisorConfig::default()
    };
    let session = Session {
        supervisor: Supervisor::with_config(cancel, config),
        tools: Tools::new(privilege),
    };

    match run(cli, &session) {
        Ok(Outcome::Succeeded) => ExitCode::SUCCESS,
        Ok(Outcome::Cancelled) => ExitCode::from(130),
        Ok(Outcome::Failed { .. }) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            if session.cancelled() {
                ExitCode::from(130)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::parse_from(["ddwarden", "wipe", "--method", "urandom", "--grace", "2", "-vv"]);
        assert_eq!(cli.grace, 2);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Commands::Wipe { method }) => {
                assert_eq!(WipeMethod::from(method), WipeMethod::Urandom)
            }
            _ => panic!("expected wipe"),
        }
    }

    #[test]
    fn vdisk_create_parses_size_and_filesystem() {
        let cli = Cli::parse_from(["ddwarden", "vdisk", "create", "disk.img", "--size", "512M", "--fs", "btrfs"]);
        match cli.command {
            Some(Commands::Vdisk(VdiskCommands::Create {
                path,
                size,
                filesystem,
            })) => {
                assert_eq!(path, PathBuf::from("disk.img"));
                assert_eq!(size.bytes(), 512 * 1024 * 1024);
                assert_eq!(filesystem, Filesystem::Btrfs);
            }
            _ => panic!("expected vdisk create"),
        }
    }

    #[test]
    fn bad_size_is_rejected() {
        assert!(Cli::try_parse_from(["ddwarden", "vdisk", "create", "d.img", "--size", "12T"]).is_err());
    }

    #[test]
    fn no_subcommand_means_menu() {
        let cli = Cli::parse_from(["ddwarden"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn default_names_are_timestamped_images() {
        let name = default_file_name("disk_image");
        assert!(name.starts_with("disk_image_"));
        assert!(name.ends_with(".img"));
    }
}
