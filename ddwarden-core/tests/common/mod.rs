#![allow(dead_code)]

use ddwarden_core::cancel::CancelToken;
use ddwarden_core::request::CommandSpec;
use ddwarden_core::supervisor::{Supervisor, SupervisorConfig};
use std::path::Path;
use std::time::Duration;

/// A shell one-liner standing in for an external tool.
pub fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("/bin/sh").arg("-c").arg(script)
}

/// Like [`sh`], with `path` available to the script as `$1`.
pub fn sh_with(script: &str, path: &Path) -> CommandSpec {
    sh(script).arg("sh").arg(path)
}

/// Short grace period and poll interval so cancellation tests stay fast.
pub fn fast_supervisor() -> (Supervisor, CancelToken) {
    let token = CancelToken::new();
    let config = SupervisorConfig {
        grace_period: Duration::from_millis(300),
        poll_interval: Duration::from_millis(10),
    };
    (Supervisor::with_config(token.clone(), config), token)
}
