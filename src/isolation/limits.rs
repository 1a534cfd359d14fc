//! Resource limits applied to the child between fork and exec.

use crate::config::ResourceLimits;
use std::io;

/// Apply the configured rlimits to the current process
///
/// Runs post-fork, pre-exec: plain setrlimit syscalls, soft and hard
/// set to the same value.
pub fn apply_rlimits(limits: &ResourceLimits) -> io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    if let Some(bytes) = limits.max_memory {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(io::Error::from)?;
    }
    if let Some(count) = limits.max_open_files {
        setrlimit(Resource::RLIMIT_NOFILE, count, count).map_err(io::Error::from)?;
    }
    if let Some(count) = limits.max_processes {
        setrlimit(Resource::RLIMIT_NPROC, count, count).map_err(io::Error::from)?;
    }

    Ok(())
}
