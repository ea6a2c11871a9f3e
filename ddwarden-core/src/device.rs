use std::fmt;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Disk,
    Partition,
    Loop,
}

/// A block device discovered on the system.
///
/// Populated by [`crate::platform::list_devices`]. The executor treats these
/// values as opaque; they only feed menus and operation validation.
#[derive(Clone, Debug)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda` or `/dev/sda1`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda1").
    pub name: String,
    pub kind: DeviceKind,
    /// The total size of the device in bytes.
    pub size_bytes: u64,
    /// Model string for disks, backing file for loop devices.
    pub model: String,
    /// The primary mount point of the device, if any.
    pub mount_point: String,
}

impl Device {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indent = if self.kind == DeviceKind::Partition { "  " } else { "" };
        let mount_info = if !self.mount_point.is_empty() {
            format!("[Mounted at {}]", self.mount_point)
        } else {
            "[Not mounted]".to_string()
        };

        write!(
            f,
            "{}{:<15} {:>8.1} GB  {:<24} {}",
            indent,
            self.path.display(),
            self.size_gb(),
            self.model,
            mount_info
        )
    }
}
