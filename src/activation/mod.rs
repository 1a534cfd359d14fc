//! Socket activation: pre-binds listening sockets and exposes them to
//! children as inherited descriptors with the systemd environment
//! contract (`LISTEN_FDS`, `LISTEN_PID`, `LISTEN_FDNAMES`).

use crate::config::SocketSpec;
use crate::error::{Result, WardenError};
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use tracing::{debug, info};

/// First inherited descriptor index, by convention
pub const LISTEN_FDS_START: RawFd = 3;

pub const LISTEN_FDS_VAR: &str = "LISTEN_FDS";
pub const LISTEN_PID_VAR: &str = "LISTEN_PID";
pub const LISTEN_FDNAMES_VAR: &str = "LISTEN_FDNAMES";

/// A bound, listening socket owned by the supervisor
///
/// The listener stays open for the lifetime of the process entry so a
/// restarted child inherits the same descriptor without a bind race.
#[derive(Debug)]
pub struct BoundSocket {
    name: String,
    listener: Listener,
}

#[derive(Debug)]
enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl BoundSocket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_raw_fd(&self) -> RawFd {
        match &self.listener {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix { listener, .. } => listener.as_raw_fd(),
        }
    }

    /// Local address the socket is actually bound to (TCP only; useful
    /// when the spec asked for port 0)
    pub fn tcp_local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }
}

/// The ordered set of bound activation sockets for one process
///
/// The Nth declared socket ends up at inherited descriptor index
/// `LISTEN_FDS_START + N` and at position N in the name list.
#[derive(Debug, Default)]
pub struct ActivationSet {
    sockets: Vec<BoundSocket>,
}

impl ActivationSet {
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn sockets(&self) -> &[BoundSocket] {
        &self.sockets
    }

    /// Descriptor names, colon-joined in binding order
    pub fn names(&self) -> String {
        self.sockets
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Raw descriptors in binding order
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.sockets.iter().map(|s| s.as_raw_fd()).collect()
    }

    /// Environment variables for the child
    ///
    /// `LISTEN_PID` is deliberately absent: it must carry the child's
    /// own pid, which is only known after fork (see the spawner).
    pub fn env(&self) -> Vec<(String, String)> {
        if self.sockets.is_empty() {
            return Vec::new();
        }
        vec![
            (LISTEN_FDS_VAR.to_string(), self.len().to_string()),
            (LISTEN_FDNAMES_VAR.to_string(), self.names()),
        ]
    }
}

/// Binds activation sockets before any supervisory loop starts
pub struct SocketActivator;

impl SocketActivator {
    /// Bind and listen on each socket, preserving declaration order
    ///
    /// Any failure aborts the whole batch: already-bound listeners are
    /// dropped (and unix socket files removed) before the error is
    /// returned, so no partially-activated process is ever visible.
    pub fn prepare(specs: &[SocketSpec]) -> Result<ActivationSet> {
        let mut sockets = Vec::with_capacity(specs.len());

        for spec in specs {
            let socket = Self::bind_one(spec)?;
            debug!(
                socket = %spec.name,
                addr = %spec.address(),
                fd = socket.as_raw_fd(),
                "Activation socket bound"
            );
            sockets.push(socket);
        }

        if !sockets.is_empty() {
            info!(
                count = sockets.len(),
                names = %sockets
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect::<Vec<_>>()
                    .join(":"),
                "Activation sockets ready"
            );
        }

        Ok(ActivationSet { sockets })
    }

    fn bind_one(spec: &SocketSpec) -> Result<BoundSocket> {
        let listener = if let Some(ref addr) = spec.tcp {
            let listener = TcpListener::bind(addr).map_err(|source| WardenError::Bind {
                addr: addr.clone(),
                source,
            })?;
            // Children expect blocking listeners
            listener
                .set_nonblocking(false)
                .map_err(|source| WardenError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            Listener::Tcp(listener)
        } else if let Some(ref path) = spec.unix {
            // Remove a stale socket file from a previous run
            let _ = std::fs::remove_file(path);

            let listener = UnixListener::bind(path).map_err(|source| WardenError::Bind {
                addr: path.display().to_string(),
                source,
            })?;
            listener
                .set_nonblocking(false)
                .map_err(|source| WardenError::Bind {
                    addr: path.display().to_string(),
                    source,
                })?;
            Listener::Unix {
                listener,
                path: path.clone(),
            }
        } else {
            // Unreachable for validated specs
            return Err(WardenError::Bind {
                addr: format!("{}:<unset>", spec.name),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "socket spec has no address",
                ),
            });
        };

        Ok(BoundSocket {
            name: spec.name.clone(),
            listener,
        })
    }
}
