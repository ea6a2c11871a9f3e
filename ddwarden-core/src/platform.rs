//! Provides platform-specific functionality.
//!
//! Device discovery and device size queries talk to the kernel directly
//! (`/sys/block`, `BLKGETSIZE64`), so they live behind `#[cfg]` here. Only
//! Linux is implemented; the external tools ddwarden supervises are Linux
//! tools as well.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
