//! Ordered volume mounting with full rollback on mid-sequence failure.

use crate::config::{VolumeKind, VolumeMount};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One step of a resolved mount sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountStep {
    Bind {
        source: PathBuf,
        target: PathBuf,
        read_only: bool,
    },
    Tmpfs {
        target: PathBuf,
    },
}

impl MountStep {
    pub fn target(&self) -> &Path {
        match self {
            MountStep::Bind { target, .. } => target,
            MountStep::Tmpfs { target } => target,
        }
    }
}

/// Mount syscall boundary
///
/// The real engine touches the live mount table, so tests drive the plan
/// through a recording fake instead.
pub trait MountEngine {
    fn bind(&mut self, source: &Path, target: &Path, read_only: bool) -> io::Result<()>;
    fn tmpfs(&mut self, target: &Path) -> io::Result<()>;
    fn unmount(&mut self, target: &Path) -> io::Result<()>;
}

/// The resolved, ordered mount sequence for one process
///
/// Order follows the declaration order of the spec's volumes; rollback
/// unwinds in reverse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPlan {
    steps: Vec<MountStep>,
}

impl MountPlan {
    /// Resolve a volume list into concrete steps
    ///
    /// Persistent volumes get their managed source directory created if
    /// missing; bind sources must already exist.
    pub fn resolve(volumes: &[VolumeMount]) -> io::Result<MountPlan> {
        let mut steps = Vec::with_capacity(volumes.len());

        for volume in volumes {
            match volume.kind {
                VolumeKind::Bind => {
                    if !volume.source.exists() {
                        return Err(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("bind source does not exist: {}", volume.source.display()),
                        ));
                    }
                    steps.push(MountStep::Bind {
                        source: volume.source.clone(),
                        target: volume.target.clone(),
                        read_only: volume.read_only(),
                    });
                }
                VolumeKind::Persistent => {
                    std::fs::create_dir_all(&volume.source)?;
                    steps.push(MountStep::Bind {
                        source: volume.source.clone(),
                        target: volume.target.clone(),
                        read_only: volume.read_only(),
                    });
                }
                VolumeKind::Tmpfs => {
                    steps.push(MountStep::Tmpfs {
                        target: volume.target.clone(),
                    });
                }
            }
        }

        Ok(MountPlan { steps })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[MountStep] {
        &self.steps
    }

    /// Apply every step in order
    ///
    /// A failure mid-sequence unmounts the already-applied targets in
    /// reverse order before returning, so no partial mount state is left
    /// behind.
    pub fn apply(&self, engine: &mut dyn MountEngine) -> io::Result<()> {
        let mut applied: Vec<&Path> = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let result = match step {
                MountStep::Bind {
                    source,
                    target,
                    read_only,
                } => engine.bind(source, target, *read_only),
                MountStep::Tmpfs { target } => engine.tmpfs(target),
            };

            match result {
                Ok(()) => {
                    debug!(target = %step.target().display(), "Mounted");
                    applied.push(step.target());
                }
                Err(e) => {
                    warn!(
                        target = %step.target().display(),
                        error = %e,
                        "Mount failed, rolling back {} mount(s)",
                        applied.len()
                    );
                    for target in applied.into_iter().rev() {
                        if let Err(ue) = engine.unmount(target) {
                            warn!(
                                target = %target.display(),
                                error = %ue,
                                "Rollback unmount failed"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

/// Mount engine backed by the kernel mount table
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct LinuxMountEngine;

#[cfg(target_os = "linux")]
impl MountEngine for LinuxMountEngine {
    fn bind(&mut self, source: &Path, target: &Path, read_only: bool) -> io::Result<()> {
        use nix::mount::{mount, MsFlags};

        std::fs::create_dir_all(target)?;

        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(io::Error::from)?;

        if read_only {
            // Read-only requires a remount pass on the bind
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(io::Error::from)?;
        }

        Ok(())
    }

    fn tmpfs(&mut self, target: &Path) -> io::Result<()> {
        use nix::mount::{mount, MsFlags};

        std::fs::create_dir_all(target)?;

        mount(
            Some("tmpfs"),
            target,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(io::Error::from)
    }

    fn unmount(&mut self, target: &Path) -> io::Result<()> {
        use nix::mount::{umount2, MntFlags};

        umount2(target, MntFlags::MNT_DETACH).map_err(io::Error::from)
    }
}

/// Mark the whole tree private so child mounts never propagate back to
/// the host
#[cfg(target_os = "linux")]
pub fn make_mounts_private() -> io::Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(io::Error::from)
}
