use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures that happen before a request ever reaches the supervisor.
///
/// Anything that goes wrong *inside* a supervised run is reported through
/// [`crate::outcome::Outcome`] instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid size '{0}'. Use a number followed by M or G, e.g. 500M or 1G")]
    InvalidSize(String),

    #[error("Could not determine the size of {path}: {source}")]
    DeviceSize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{program} failed: {stderr}")]
    Probe {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
