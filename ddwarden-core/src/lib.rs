//! The core, UI-agnostic library for the `ddwarden` disk console.
//!
//! `ddwarden-core` does not move any data itself. Every destructive operation
//! (flashing, cloning, imaging, wiping, partitioning, formatting) is carried
//! out by a system tool such as `dd`, `parted`, `mkfs.*`, `cryptsetup` or
//! `losetup`. This crate supervises those tools: it starts them, follows
//! their progress output, terminates them on request, cleans up partial
//! output files and reports one uniform [`outcome::Outcome`].
//!
//! The library is structured into several key modules:
//! - [`device`] and [`platform`]: discovering block devices and their sizes.
//! - [`progress`]: parsing `<N> bytes` status lines into progress samples.
//! - [`cancel`]: the session-wide cancellation token.
//! - [`supervisor`]: running one external command to a terminal outcome.
//! - [`passes`]: running a command several times in sequence (multi-pass wipe).
//! - [`command`]: the invocation templates of the external tools.
//! - [`catalog`]: the operations themselves, from validation through
//!   confirmation to execution.
//!
//! ## Example: Flashing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use ddwarden_core::cancel::CancelToken;
//! use ddwarden_core::catalog::{Event, Operation};
//! use ddwarden_core::command::{Privilege, Tools};
//! use ddwarden_core::supervisor::Supervisor;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // One token per session; a Ctrl+C handler would call `cancel()` on a clone.
//!     let cancel = CancelToken::new();
//!     let supervisor = Supervisor::new(cancel.clone());
//!     let tools = Tools::new(Privilege::detect());
//!
//!     let operation = Operation::flash("path/to/image.img", "/dev/sdX")?;
//!
//!     // A real front-end would ask the operator here.
//!     let Some(confirmed) = operation.confirm(|_| Ok::<_, std::io::Error>(true))? else {
//!         return Ok(());
//!     };
//!
//!     let outcome = confirmed.execute(&supervisor, &tools, |event| {
//!         if let Event::Progress(sample) = event {
//!             if let Some(pct) = sample.overall_percentage() {
//!                 println!("{pct:.0}%");
//!             }
//!         }
//!     });
//!
//!     println!("Flash {outcome}");
//!     Ok(())
//! }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("ddwarden-core currently supports Linux only.");

pub mod cancel;
pub mod catalog;
pub mod command;
pub mod device;
pub mod error;
pub mod outcome;
pub mod passes;
pub mod platform;
mod process;
pub mod progress;
pub mod request;
pub mod size;
pub mod supervisor;

pub use error::{Error, Result};
