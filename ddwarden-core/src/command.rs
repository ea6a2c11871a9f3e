//! Command templates for the external tools ddwarden drives.
//!
//! This is the one place that knows how `dd`, `parted`, `mkfs.*`,
//! `cryptsetup` and `losetup` are invoked. Everything here only builds
//! [`CommandSpec`]s; running them is the supervisor's job, except for
//! [`probe`], which captures the stdout of short query commands.
use crate::error::{Error, Result};
use crate::request::CommandSpec;
use crate::size::DiskSize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::FromStr;

/// How tool invocations gain the privileges they need.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    /// Already privileged (or testing against files); run tools directly.
    Direct,
    /// Prefix every tool with `sudo`.
    Sudo,
}

impl Privilege {
    /// `Direct` when running as root, `Sudo` otherwise.
    pub fn detect() -> Self {
        if nix::unistd::geteuid().is_root() {
            Privilege::Direct
        } else {
            Privilege::Sudo
        }
    }

    fn prefix(self) -> Option<&'static str> {
        match self {
            Privilege::Direct => None,
            Privilege::Sudo => Some("sudo"),
        }
    }

    /// How to signal a child started with [`Privilege::prefix`]. `-n` keeps
    /// sudo from prompting in the middle of a cancellation.
    fn signaller(self) -> Option<[&'static str; 2]> {
        match self {
            Privilege::Direct => None,
            Privilege::Sudo => Some(["sudo", "-n"]),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionTable {
    Msdos,
    Gpt,
}

impl PartitionTable {
    pub const ALL: [PartitionTable; 2] = [PartitionTable::Msdos, PartitionTable::Gpt];

    pub fn label(self) -> &'static str {
        match self {
            PartitionTable::Msdos => "msdos",
            PartitionTable::Gpt => "gpt",
        }
    }
}

impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionTable::Msdos => write!(f, "MBR (msdos)"),
            PartitionTable::Gpt => write!(f, "GPT"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filesystem {
    Fat16,
    Fat32,
    Exfat,
    Ntfs,
    Btrfs,
    Ext2,
    Ext3,
    Ext4,
}

impl Filesystem {
    pub const ALL: [Filesystem; 8] = [
        Filesystem::Fat16,
        Filesystem::Fat32,
        Filesystem::Exfat,
        Filesystem::Ntfs,
        Filesystem::Btrfs,
        Filesystem::Ext2,
        Filesystem::Ext3,
        Filesystem::Ext4,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Filesystem::Fat16 => "fat16",
            Filesystem::Fat32 => "fat32",
            Filesystem::Exfat => "exfat",
            Filesystem::Ntfs => "ntfs",
            Filesystem::Btrfs => "btrfs",
            Filesystem::Ext2 => "ext2",
            Filesystem::Ext3 => "ext3",
            Filesystem::Ext4 => "ext4",
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name().to_uppercase())
    }
}

impl FromStr for Filesystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Filesystem::ALL
            .into_iter()
            .find(|fs| fs.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("unknown filesystem '{s}'")))
    }
}

/// Overwrite source and pass count for a secure erase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WipeMethod {
    Zero,
    Random,
    Urandom,
}

impl WipeMethod {
    pub const ALL: [WipeMethod; 3] = [WipeMethod::Zero, WipeMethod::Random, WipeMethod::Urandom];

    pub fn source(self) -> &'static Path {
        Path::new(match self {
            WipeMethod::Zero => "/dev/zero",
            WipeMethod::Random => "/dev/random",
            WipeMethod::Urandom => "/dev/urandom",
        })
    }

    pub fn passes(self) -> usize {
        match self {
            WipeMethod::Zero => 1,
            WipeMethod::Random => 3,
            WipeMethod::Urandom => 7,
        }
    }
}

impl fmt::Display for WipeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let passes = self.passes();
        write!(
            f,
            "{} ({} pass{})",
            self.source().display(),
            passes,
            if passes == 1 { "" } else { "es" }
        )
    }
}

fn kv(key: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(key);
    arg.push("=");
    arg.push(path);
    arg
}

/// Builds tool invocations with the configured privilege prefix.
#[derive(Clone, Debug)]
pub struct Tools {
    privilege: Privilege,
    /// Tool name → replacement argv prefix.
    programs: BTreeMap<String, Vec<OsString>>,
}

impl Tools {
    pub fn new(privilege: Privilege) -> Self {
        Self {
            privilege,
            programs: BTreeMap::new(),
        }
    }

    /// Runs `argv` (program plus leading arguments) wherever `tool` would run,
    /// e.g. `.with_program("mkfs.ext4", ["/usr/local/sbin/mkfs.ext4"])`.
    ///
    /// The tool's own arguments follow `argv`.
    pub fn with_program<I, S>(mut self, tool: &str, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();
        if !argv.is_empty() {
            self.programs.insert(tool.to_string(), argv);
        }
        self
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    fn tool(&self, spec: CommandSpec) -> CommandSpec {
        let spec = match self.programs.get(&spec.program_name()) {
            Some(argv) => {
                let mut args = argv[1..].to_vec();
                args.extend(spec.args);
                CommandSpec {
                    program: argv[0].clone(),
                    args,
                    ..spec
                }
            }
            None => spec,
        };
        let spec = spec.elevated(self.privilege.prefix());
        match self.privilege.signaller() {
            Some(prefix) => spec.signal_via(prefix),
            None => spec,
        }
    }

    /// Raw copy with periodic status and a flush before exit. Used for
    /// file→disk, disk→disk and disk→image.
    pub fn dd_copy(&self, source: &Path, destination: &Path) -> CommandSpec {
        self.tool(CommandSpec::new("dd").args([
            kv("if", source),
            kv("of", destination),
            "bs=4M".into(),
            "conv=fdatasync".into(),
            "status=progress".into(),
        ]))
    }

    /// One overwrite pass. The byte count bounds the pass so `dd` stops at the
    /// end of the device instead of failing with "No space left on device".
    pub fn dd_wipe(&self, source: &Path, device: &Path, bytes: u64) -> CommandSpec {
        self.tool(CommandSpec::new("dd").args([
            kv("if", source),
            kv("of", device),
            "bs=1M".into(),
            "iflag=count_bytes,fullblock".into(),
            format!("count={bytes}").into(),
            "conv=fdatasync".into(),
            "status=progress".into(),
        ]))
    }

    /// Creates a sparse file of `size` without writing data.
    pub fn dd_sparse(&self, path: &Path, size: DiskSize) -> CommandSpec {
        self.tool(CommandSpec::new("dd").args([
            "if=/dev/zero".into(),
            kv("of", path),
            "bs=1".into(),
            "count=0".into(),
            format!("seek={size}").into(),
        ]))
    }

    pub fn mklabel(&self, device: &Path, table: PartitionTable) -> CommandSpec {
        self.tool(
            CommandSpec::new("parted")
                .arg("-s")
                .arg(device)
                .arg("mklabel")
                .arg(table.label()),
        )
    }

    pub fn mkfs(&self, filesystem: Filesystem, target: &Path) -> CommandSpec {
        let spec = match filesystem {
            Filesystem::Fat16 => CommandSpec::new("mkfs.vfat").args(["-F", "16"]),
            Filesystem::Fat32 => CommandSpec::new("mkfs.vfat").args(["-F", "32"]),
            Filesystem::Exfat => CommandSpec::new("mkfs.exfat"),
            Filesystem::Ntfs => CommandSpec::new("mkfs.ntfs").args(["-Q", "-F"]),
            Filesystem::Btrfs => CommandSpec::new("mkfs.btrfs").arg("-f"),
            Filesystem::Ext2 => CommandSpec::new("mkfs.ext2").arg("-F"),
            Filesystem::Ext3 => CommandSpec::new("mkfs.ext3").arg("-F"),
            Filesystem::Ext4 => CommandSpec::new("mkfs.ext4").arg("-F"),
        };
        self.tool(spec.arg(target))
    }

    /// The passphrase is passed on stdin, never on the command line.
    pub fn luks_format(&self, target: &Path, passphrase: &str) -> CommandSpec {
        self.tool(
            CommandSpec::new("cryptsetup")
                .args(["-q", "luksFormat", "--key-file=-"])
                .arg(target)
                .input(passphrase.as_bytes()),
        )
    }

    pub fn luks_open(&self, target: &Path, mapping: &str, passphrase: &str) -> CommandSpec {
        self.tool(
            CommandSpec::new("cryptsetup")
                .args(["open", "--key-file=-"])
                .arg(target)
                .arg(mapping)
                .input(passphrase.as_bytes()),
        )
    }

    pub fn luks_close(&self, mapping: &str) -> CommandSpec {
        self.tool(CommandSpec::new("cryptsetup").arg("close").arg(mapping))
    }

    /// Prints the loop device it attached; run it with [`probe`].
    pub fn loop_attach(&self, image: &Path) -> CommandSpec {
        self.tool(CommandSpec::new("losetup").args(["--find", "--show"]).arg(image))
    }

    pub fn loop_detach(&self, device: &Path) -> CommandSpec {
        self.tool(CommandSpec::new("losetup").arg("-d").arg(device))
    }
}

/// Runs a short query command and returns its trimmed stdout.
pub fn probe(spec: &CommandSpec) -> Result<String> {
    log::debug!("Probing with {}", spec);
    let output = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::Probe {
            program: spec.program_name(),
            code: output.status.code(),
            stderr: if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            },
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(spec: CommandSpec) -> String {
        spec.to_string()
    }

    #[test]
    fn copy_matches_dd_conventions() {
        let tools = Tools::new(Privilege::Direct);
        assert_eq!(
            render(tools.dd_copy(Path::new("/tmp/os.img"), Path::new("/dev/sdz"))),
            "dd if=/tmp/os.img of=/dev/sdz bs=4M conv=fdatasync status=progress"
        );
    }

    #[test]
    fn sudo_prefixes_every_tool() {
        let tools = Tools::new(Privilege::Sudo);
        assert_eq!(
            render(tools.mklabel(Path::new("/dev/sdz"), PartitionTable::Gpt)),
            "sudo parted -s /dev/sdz mklabel gpt"
        );
        assert_eq!(
            render(tools.loop_detach(Path::new("/dev/loop4"))),
            "sudo losetup -d /dev/loop4"
        );
    }

    #[test]
    fn sudo_children_are_signalled_through_sudo() {
        let spec = Tools::new(Privilege::Sudo).dd_copy(Path::new("a.img"), Path::new("/dev/sdz"));
        assert_eq!(
            spec.signaller,
            Some(vec![OsString::from("sudo"), OsString::from("-n")])
        );
        let direct = Tools::new(Privilege::Direct).dd_copy(Path::new("a.img"), Path::new("/dev/sdz"));
        assert_eq!(direct.signaller, None);
    }

    #[test]
    fn overridden_program_takes_the_tool_arguments() {
        let tools = Tools::new(Privilege::Sudo)
            .with_program("losetup", ["/opt/bin/losetup-wrapper", "--quiet"]);
        assert_eq!(
            render(tools.loop_detach(Path::new("/dev/loop4"))),
            "sudo /opt/bin/losetup-wrapper --quiet -d /dev/loop4"
        );
        assert_eq!(
            render(tools.mklabel(Path::new("/dev/sdz"), PartitionTable::Msdos)),
            "sudo parted -s /dev/sdz mklabel msdos"
        );
    }

    #[test]
    fn wipe_pass_is_bounded_by_device_size() {
        let tools = Tools::new(Privilege::Direct);
        let spec = tools.dd_wipe(WipeMethod::Urandom.source(), Path::new("/dev/sdz"), 1 << 30);
        let rendered = render(spec);
        assert!(rendered.starts_with("dd if=/dev/urandom of=/dev/sdz bs=1M"));
        assert!(rendered.contains("iflag=count_bytes,fullblock count=1073741824"));
        assert!(rendered.ends_with("status=progress"));
    }

    #[test]
    fn wipe_methods_match_menu() {
        assert_eq!(WipeMethod::Zero.passes(), 1);
        assert_eq!(WipeMethod::Random.passes(), 3);
        assert_eq!(WipeMethod::Urandom.passes(), 7);
        assert_eq!(WipeMethod::Random.to_string(), "/dev/random (3 passes)");
        assert_eq!(WipeMethod::Zero.to_string(), "/dev/zero (1 pass)");
    }

    #[test]
    fn mkfs_table() {
        let tools = Tools::new(Privilege::Direct);
        let dev = Path::new("/dev/sdz1");
        let cases = [
            (Filesystem::Fat16, "mkfs.vfat -F 16 /dev/sdz1"),
            (Filesystem::Fat32, "mkfs.vfat -F 32 /dev/sdz1"),
            (Filesystem::Exfat, "mkfs.exfat /dev/sdz1"),
            (Filesystem::Ntfs, "mkfs.ntfs -Q -F /dev/sdz1"),
            (Filesystem::Btrfs, "mkfs.btrfs -f /dev/sdz1"),
            (Filesystem::Ext2, "mkfs.ext2 -F /dev/sdz1"),
            (Filesystem::Ext3, "mkfs.ext3 -F /dev/sdz1"),
            (Filesystem::Ext4, "mkfs.ext4 -F /dev/sdz1"),
        ];
        for (fs, expected) in cases {
            assert_eq!(render(tools.mkfs(fs, dev)), expected);
        }
    }

    #[test]
    fn passphrase_goes_to_stdin_only() {
        let tools = Tools::new(Privilege::Sudo);
        let spec = tools.luks_format(Path::new("/dev/sdz2"), "correct horse");
        assert!(!spec.to_string().contains("correct horse"));
        assert_eq!(spec.input.as_deref(), Some(b"correct horse".as_slice()));
        assert_eq!(
            spec.to_string(),
            "sudo cryptsetup -q luksFormat --key-file=- /dev/sdz2"
        );
    }

    #[test]
    fn filesystem_names_round_trip_through_from_str() {
        assert_eq!("EXT4".parse::<Filesystem>().unwrap(), Filesystem::Ext4);
        assert!("zfs".parse::<Filesystem>().is_err());
    }

    #[test]
    fn probe_reports_stdout_and_failures() {
        let ok = CommandSpec::new("/bin/sh").args(["-c", "echo /dev/loop9"]);
        assert_eq!(probe(&ok).unwrap(), "/dev/loop9");

        let failing = CommandSpec::new("/bin/sh").args(["-c", "echo 'no free loop' >&2; exit 1"]);
        match probe(&failing) {
            Err(Error::Probe { code, stderr, .. }) => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "no free loop");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
