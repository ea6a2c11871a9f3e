use crate::device::{Device, DeviceKind};
use crate::error::{Error, Result};
use nix::ioctl_read;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Name prefixes of the block devices worth offering to an operator.
const DISK_PREFIXES: [&str; 6] = ["sd", "mmcblk", "nvme", "vd", "xvd", "loop"];

/// Helper to read a specific file below `/sys/block`.
fn read_sys_file(rel: impl AsRef<Path>) -> io::Result<String> {
    let path = Path::new("/sys/block").join(rel);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

fn read_sectors(rel: impl AsRef<Path>) -> u64 {
    read_sys_file(rel)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Strips the partition suffix from a kernel device name
/// (`sda1` → `sda`, `nvme0n1p2` → `nvme0n1`, `mmcblk0p1` → `mmcblk0`).
pub(crate) fn parent_disk_name(name: &str) -> &str {
    if name.starts_with("nvme") || name.starts_with("mmcblk") || name.starts_with("loop") {
        if let Some(index) = name.rfind('p') {
            let suffix = &name[index + 1..];
            let after_number = name[..index].ends_with(|c: char| c.is_ascii_digit());
            if after_number && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                return &name[..index];
            }
        }
        return name;
    }
    name.trim_end_matches(|c: char| c.is_ascii_digit())
}

/// Finds the disk that holds the root filesystem, by kernel name.
fn system_disk_name(disks: &sysinfo::Disks) -> Option<String> {
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .and_then(|disk| {
            Path::new(disk.name())
                .file_name()
                .map(|n| parent_disk_name(&n.to_string_lossy()).to_string())
        })
}

fn mount_point_of(disks: &sysinfo::Disks, name: &str) -> String {
    disks
        .iter()
        .find(|disk| Path::new(disk.name()).file_name().is_some_and(|n| n == name))
        .map(|disk| disk.mount_point().to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Scans `/sys/block` for disks, their partitions and attached loop devices.
///
/// The disk holding `/` is left out, as are devices reporting a size of zero
/// (empty card readers, detached loop devices). Partitions follow their disk.
pub fn list_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk = system_disk_name(&disks);
    if system_disk.is_none() {
        log::warn!("Could not determine the system drive; it will not be hidden");
    }

    let mut names: Vec<String> = fs::read_dir("/sys/block")?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| DISK_PREFIXES.iter().any(|p| name.starts_with(p)))
        .collect();
    names.sort();

    let mut devices = Vec::new();
    for name in names {
        if system_disk.as_deref() == Some(name.as_str()) {
            continue;
        }

        let sectors = read_sectors(Path::new(&name).join("size"));
        if sectors == 0 {
            continue;
        }

        let (kind, model) = if name.starts_with("loop") {
            let backing = read_sys_file(Path::new(&name).join("loop/backing_file"))
                .unwrap_or_default();
            (DeviceKind::Loop, backing)
        } else {
            let model = read_sys_file(Path::new(&name).join("device/model"))
                .unwrap_or_else(|_| "Unknown".to_string());
            (DeviceKind::Disk, model)
        };

        devices.push(Device {
            path: PathBuf::from("/dev").join(&name),
            mount_point: mount_point_of(&disks, &name),
            name: name.clone(),
            kind,
            size_bytes: sectors * 512,
            model,
        });

        devices.extend(list_partitions(&disks, &name));
    }

    Ok(devices)
}

fn list_partitions(disks: &sysinfo::Disks, disk: &str) -> Vec<Device> {
    let Ok(entries) = fs::read_dir(Path::new("/sys/block").join(disk)) else {
        return Vec::new();
    };

    let mut partitions: Vec<Device> = entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.path().join("partition").exists())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let sectors = read_sectors(Path::new(disk).join(&name).join("size"));
            (sectors > 0).then(|| Device {
                path: PathBuf::from("/dev").join(&name),
                mount_point: mount_point_of(disks, &name),
                name,
                kind: DeviceKind::Partition,
                size_bytes: sectors * 512,
                model: String::new(),
            })
        })
        .collect();
    partitions.sort_by(|a, b| a.name.cmp(&b.name));
    partitions
}

/// Returns the size in bytes of a regular file or block device.
///
/// Block devices are asked directly with `BLKGETSIZE64`; opening one usually
/// needs privileges, so sysfs is consulted when that fails.
pub fn device_size(path: &Path) -> Result<u64> {
    let size_error = |source: io::Error| Error::DeviceSize {
        path: path.to_path_buf(),
        source,
    };

    let meta = fs::metadata(path).map_err(size_error)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    if !meta.file_type().is_block_device() {
        return Err(Error::Validation(format!(
            "{} is neither a block device nor a regular file",
            path.display()
        )));
    }

    match block_device_size(path) {
        Ok(size) if size > 0 => return Ok(size),
        Ok(_) => {}
        Err(e) => log::debug!("BLKGETSIZE64 on {} failed: {}", path.display(), e),
    }

    let canonical = fs::canonicalize(path).map_err(size_error)?;
    let name = canonical
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let sectors = fs::read_to_string(Path::new("/sys/class/block").join(&name).join("size"))
        .map_err(size_error)?
        .trim()
        .parse::<u64>()
        .map_err(|e| size_error(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    if sectors == 0 {
        return Err(size_error(io::Error::new(
            io::ErrorKind::InvalidData,
            "device size is reported as zero",
        )));
    }
    Ok(sectors * 512)
}

fn block_device_size(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    let mut size_bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes).map_err(io::Error::from)?;
    }
    Ok(size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_partitions() {
        assert_eq!(parent_disk_name("sda1"), "sda");
        assert_eq!(parent_disk_name("sda"), "sda");
        assert_eq!(parent_disk_name("vdb12"), "vdb");
        assert_eq!(parent_disk_name("nvme0n1p2"), "nvme0n1");
        assert_eq!(parent_disk_name("nvme0n1"), "nvme0n1");
        assert_eq!(parent_disk_name("mmcblk0p1"), "mmcblk0");
        assert_eq!(parent_disk_name("mmcblk0"), "mmcblk0");
        assert_eq!(parent_disk_name("loop3p1"), "loop3");
        assert_eq!(parent_disk_name("loop3"), "loop3");
    }

    #[test]
    fn size_of_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        fs::write(&path, vec![0u8; 4096]).unwrap();
        assert_eq!(device_size(&path).unwrap(), 4096);
    }

    #[test]
    fn size_of_missing_path_is_an_error() {
        let err = device_size(Path::new("/nonexistent/ddwarden/disk")).unwrap_err();
        assert!(matches!(err, Error::DeviceSize { .. }));
    }

    #[test]
    fn directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(device_size(dir.path()), Err(Error::Validation(_))));
    }
}
