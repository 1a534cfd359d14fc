//! Per-process isolation: namespace flags, the ordered mount plan and
//! host-side bridge attachment, staged before spawn and torn down on
//! every exit path.

pub mod bridge;
pub mod limits;
pub mod mounts;

pub use bridge::BridgeAttachment;
pub use mounts::{MountEngine, MountPlan, MountStep};

use crate::config::{Namespaces, ProcessSpec};
use crate::error::{Result, WardenError};
use tracing::debug;

/// Translate the requested namespace set into unshare flags
#[cfg(target_os = "linux")]
pub fn clone_flags(ns: &Namespaces) -> nix::sched::CloneFlags {
    use nix::sched::CloneFlags;

    let mut flags = CloneFlags::empty();
    if ns.mount {
        flags |= CloneFlags::CLONE_NEWNS;
    }
    if ns.net {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    if ns.pid {
        flags |= CloneFlags::CLONE_NEWPID;
    }
    if ns.ipc {
        flags |= CloneFlags::CLONE_NEWIPC;
    }
    if ns.uts {
        flags |= CloneFlags::CLONE_NEWUTS;
    }
    if ns.user {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    flags
}

/// Staged isolation state for one process
///
/// Owned by the process's supervisory task. Host-side resources (the
/// bridge veth pair) are released on every exit path; in-namespace state
/// (mounts, unshared namespaces) dies with the child.
#[derive(Debug)]
pub struct IsolationContext {
    name: String,
    namespaces: Namespaces,
    mount_plan: MountPlan,
    bridge: Option<BridgeAttachment>,
    bridge_address: Option<String>,
}

impl IsolationContext {
    /// Stage isolation for a spec
    ///
    /// Resolves the mount plan (validating bind sources, creating
    /// persistent directories) and creates the host side of the bridge
    /// attachment. Any failure rolls back what was staged and surfaces a
    /// setup error.
    pub fn prepare(spec: &ProcessSpec) -> Result<IsolationContext> {
        let mount_plan = MountPlan::resolve(&spec.volumes)
            .map_err(|e| WardenError::Setup(spec.name.clone(), e.to_string()))?;

        let bridge = match &spec.bridge {
            Some(config) => Some(
                BridgeAttachment::create(&spec.name, config)
                    .map_err(|e| WardenError::Setup(spec.name.clone(), e.to_string()))?,
            ),
            None => None,
        };

        debug!(
            process = %spec.name,
            mounts = mount_plan.steps().len(),
            bridged = bridge.is_some(),
            "Isolation context prepared"
        );

        Ok(IsolationContext {
            name: spec.name.clone(),
            namespaces: spec.namespaces,
            mount_plan,
            bridge,
            bridge_address: spec.bridge.as_ref().and_then(|b| b.address.clone()),
        })
    }

    pub fn namespaces(&self) -> &Namespaces {
        &self.namespaces
    }

    pub fn mount_plan(&self) -> &MountPlan {
        &self.mount_plan
    }

    pub fn has_bridge(&self) -> bool {
        self.bridge.is_some()
    }

    /// Finish network setup once the child exists: move the veth peer
    /// into its namespace and assign the configured address
    pub fn after_spawn(&self, pid: u32) -> Result<()> {
        if let Some(ref bridge) = self.bridge {
            bridge
                .attach_to_pid(pid, self.bridge_address.as_deref())
                .map_err(|e| WardenError::Setup(self.name.clone(), e.to_string()))?;
        }
        Ok(())
    }

    /// Tear down host-side isolation state
    pub fn release(&mut self) {
        if let Some(ref mut bridge) = self.bridge {
            bridge.release();
        }
        self.bridge = None;
    }
}

impl Drop for IsolationContext {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MountMode, ProcessSpec, VolumeKind, VolumeMount};
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_clone_flags_mapping() {
        use nix::sched::CloneFlags;

        let ns = Namespaces {
            mount: true,
            net: true,
            ..Default::default()
        };
        let flags = clone_flags(&ns);
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWPID));

        assert!(clone_flags(&Namespaces::default()).is_empty());
    }

    #[test]
    fn test_prepare_without_isolation() {
        let spec = ProcessSpec::new("plain", "/bin/true");
        let ctx = IsolationContext::prepare(&spec).unwrap();

        assert!(ctx.mount_plan().is_empty());
        assert!(!ctx.has_bridge());
        assert!(ctx.after_spawn(1).is_ok());
    }

    #[test]
    fn test_prepare_resolves_mounts() {
        let temp_dir = TempDir::new().unwrap();
        let mut spec = ProcessSpec::new("mounted", "/bin/true");
        spec.namespaces.mount = true;
        spec.volumes = vec![VolumeMount {
            source: temp_dir.path().to_path_buf(),
            target: PathBuf::from("/data"),
            mode: MountMode::ReadOnly,
            kind: VolumeKind::Bind,
        }];

        let ctx = IsolationContext::prepare(&spec).unwrap();
        assert_eq!(ctx.mount_plan().steps().len(), 1);
    }

    #[test]
    fn test_prepare_fails_on_missing_bind_source() {
        let mut spec = ProcessSpec::new("broken", "/bin/true");
        spec.namespaces.mount = true;
        spec.volumes = vec![VolumeMount {
            source: PathBuf::from("/nonexistent/source"),
            target: PathBuf::from("/data"),
            mode: MountMode::ReadWrite,
            kind: VolumeKind::Bind,
        }];

        assert!(matches!(
            IsolationContext::prepare(&spec),
            Err(WardenError::Setup(_, _))
        ));
    }
}
