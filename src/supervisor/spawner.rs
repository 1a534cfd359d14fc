use crate::activation::{ActivationSet, LISTEN_FDS_START, LISTEN_PID_VAR};
use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use crate::isolation::IsolationContext;
use std::ffi::{CString, OsString};
use std::os::raw::c_char;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

extern "C" {
    static mut environ: *const *const c_char;
}

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,
}

/// Room for the decimal digits of any 32-bit pid
const PID_DIGITS_MAX: usize = 10;

/// Complete environment table for the child, laid out before fork
///
/// `Command::env` cannot carry `LISTEN_PID`: its value is the child's
/// own pid, which does not exist until after fork, and the spawn
/// machinery installs its environment table after `pre_exec` closures
/// run (discarding anything they set). The Rust env API also takes a
/// lock the spawn machinery holds across fork, so the forked half must
/// never call it. Instead the whole table is prepared up front; after
/// fork the child only writes pid digits into a reserved slot and
/// points `environ` at the table.
///
/// All pointers target heap buffers owned by this block, so they stay
/// valid wherever the block moves.
struct EnvBlock {
    // Owns the buffers the table points into
    #[allow(dead_code)]
    entries: Vec<CString>,
    pid_entry: Option<Vec<u8>>,
    table: Vec<*const c_char>,
}

// The raw pointers only reference buffers owned by the same block.
unsafe impl Send for EnvBlock {}
unsafe impl Sync for EnvBlock {}

impl EnvBlock {
    /// Inherited environment plus the spec's variables and, when
    /// sockets are present, the activation contract
    fn build(spec: &ProcessSpec, sockets: &ActivationSet) -> EnvBlock {
        let mut vars: Vec<(OsString, OsString)> = std::env::vars_os().collect();
        for (key, value) in &spec.env {
            upsert(&mut vars, key, value);
        }
        for (key, value) in sockets.env() {
            upsert(&mut vars, &key, &value);
        }

        let mut entries = Vec::with_capacity(vars.len());
        for (key, value) in vars {
            let mut bytes = key.into_vec();
            bytes.push(b'=');
            bytes.extend_from_slice(value.as_os_str().as_bytes());
            // Interior NULs cannot come from a real environment
            if let Ok(entry) = CString::new(bytes) {
                entries.push(entry);
            }
        }

        let pid_entry = if sockets.is_empty() {
            None
        } else {
            let mut buf = Vec::with_capacity(LISTEN_PID_VAR.len() + 1 + PID_DIGITS_MAX + 1);
            buf.extend_from_slice(LISTEN_PID_VAR.as_bytes());
            buf.push(b'=');
            buf.resize(buf.capacity(), 0);
            Some(buf)
        };

        let mut table: Vec<*const c_char> = entries.iter().map(|e| e.as_ptr()).collect();
        if let Some(ref buf) = pid_entry {
            table.push(buf.as_ptr() as *const c_char);
        }
        table.push(std::ptr::null());

        EnvBlock {
            entries,
            pid_entry,
            table,
        }
    }

    /// Write the pid digits into the reserved slot; no allocation, safe
    /// between fork and exec
    fn write_pid(&mut self, pid: u32) {
        let buf = match self.pid_entry {
            Some(ref mut buf) => buf,
            None => return,
        };

        let offset = LISTEN_PID_VAR.len() + 1;
        let mut digits = [0u8; PID_DIGITS_MAX];
        let mut rest = pid;
        let mut n = 0;
        loop {
            digits[n] = b'0' + (rest % 10) as u8;
            rest /= 10;
            n += 1;
            if rest == 0 {
                break;
            }
        }
        for i in 0..n {
            buf[offset + i] = digits[n - 1 - i];
        }
        buf[offset + n] = 0;
    }

    /// Install the table as the process environment
    ///
    /// # Safety
    /// Must only be called between fork and exec, while the block is
    /// still alive.
    unsafe fn install(&self) {
        environ = self.table.as_ptr();
    }
}

fn upsert(vars: &mut Vec<(OsString, OsString)>, key: &str, value: &str) {
    let key_os = OsString::from(key);
    if let Some(slot) = vars.iter_mut().find(|(k, _)| *k == key_os) {
        slot.1 = OsString::from(value);
    } else {
        vars.push((key_os, OsString::from(value)));
    }
}

/// Spawn one managed process
///
/// Applies the spec's command line, environment and working directory,
/// injects the activation descriptors at fd 3.. with the environment
/// contract, and enters the staged isolation (namespaces, mounts,
/// rlimits) between fork and exec. `LISTEN_PID` carries the child's own
/// pid via the precomputed environment block.
pub fn spawn_process(
    spec: &ProcessSpec,
    sockets: &ActivationSet,
    isolation: &IsolationContext,
) -> Result<SpawnedProcess> {
    if !spec.command.exists() {
        return Err(WardenError::Spawn(
            spec.name.clone(),
            format!("Command does not exist: {}", spec.command.display()),
        ));
    }

    let mut command = Command::new(&spec.command);

    if !spec.args.is_empty() {
        command.args(&spec.args);
    }

    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }

    command.stdin(Stdio::null());

    // Environment goes through the block, never Command::env (see
    // EnvBlock)
    let mut env_block = EnvBlock::build(spec, sockets);

    let fds = sockets.raw_fds();
    let has_fds = !fds.is_empty();
    let limits = spec.limits;

    #[cfg(target_os = "linux")]
    let flags = crate::isolation::clone_flags(isolation.namespaces());
    #[cfg(target_os = "linux")]
    let mount_plan = isolation.mount_plan().clone();
    #[cfg(not(target_os = "linux"))]
    let _ = isolation;

    // Between fork and exec: enter namespaces, apply mounts and limits,
    // remap the activation descriptors, install the environment. Only
    // async-signal-safe work here.
    unsafe {
        command.pre_exec(move || {
            #[cfg(target_os = "linux")]
            {
                if !flags.is_empty() {
                    nix::sched::unshare(flags).map_err(std::io::Error::from)?;
                }
                if flags.contains(nix::sched::CloneFlags::CLONE_NEWNS) {
                    crate::isolation::mounts::make_mounts_private()?;
                    let mut engine = crate::isolation::mounts::LinuxMountEngine;
                    // No rollback here: a failed exec dies with its
                    // mount namespace
                    mount_plan.apply(&mut engine)?;
                }
            }

            if limits.any() {
                crate::isolation::limits::apply_rlimits(&limits)?;
            }

            if has_fds {
                remap_inherited_fds(&fds)?;
            }

            env_block.write_pid(nix::unistd::getpid().as_raw() as u32);
            env_block.install();

            Ok(())
        });
    }

    let child = command
        .spawn()
        .map_err(|e| WardenError::Spawn(spec.name.clone(), e.to_string()))?;

    let pid = child
        .id()
        .ok_or_else(|| WardenError::Spawn(spec.name.clone(), "Failed to get PID".to_string()))?;

    debug!(process = %spec.name, pid, fds = sockets.len(), "Process spawned");

    Ok(SpawnedProcess { child, pid })
}

/// Move the bound descriptors to fd 3, 4, 5, … in binding order with
/// `FD_CLOEXEC` cleared
///
/// Sources are first duplicated above the target range so a source fd
/// that happens to sit inside it is never clobbered mid-remap.
fn remap_inherited_fds(fds: &[RawFd]) -> std::io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg};
    use nix::unistd::{close, dup2};

    let floor = LISTEN_FDS_START + fds.len() as RawFd;

    let mut staged = Vec::with_capacity(fds.len());
    for &fd in fds {
        let tmp = fcntl(fd, FcntlArg::F_DUPFD(floor)).map_err(std::io::Error::from)?;
        staged.push(tmp);
    }

    for (index, &tmp) in staged.iter().enumerate() {
        let target = LISTEN_FDS_START + index as RawFd;
        // dup2 leaves FD_CLOEXEC cleared on the target
        dup2(tmp, target).map_err(std::io::Error::from)?;
        close(tmp).map_err(std::io::Error::from)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{SocketActivator, LISTEN_FDNAMES_VAR, LISTEN_FDS_VAR};
    use crate::config::SocketSpec;
    use std::ffi::CStr;

    fn plain_context(spec: &ProcessSpec) -> IsolationContext {
        IsolationContext::prepare(spec).unwrap()
    }

    fn one_socket(name: &str) -> ActivationSet {
        SocketActivator::prepare(&[SocketSpec {
            name: name.to_string(),
            tcp: Some("127.0.0.1:0".to_string()),
            unix: None,
        }])
        .unwrap()
    }

    fn table_entries(block: &EnvBlock) -> Vec<String> {
        block
            .table
            .iter()
            .take_while(|p| !p.is_null())
            .map(|&p| unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_env_block_merges_spec_and_activation_vars() {
        std::env::set_var("WARDEN_INHERITED", "from-parent");

        let mut spec = ProcessSpec::new("web", "/bin/true");
        spec.env
            .insert("WARDEN_SPEC_VAR".to_string(), "from-spec".to_string());
        let sockets = one_socket("http");

        let block = EnvBlock::build(&spec, &sockets);
        let entries = table_entries(&block);

        assert!(entries.contains(&"WARDEN_INHERITED=from-parent".to_string()));
        assert!(entries.contains(&"WARDEN_SPEC_VAR=from-spec".to_string()));
        assert!(entries.contains(&format!("{}=1", LISTEN_FDS_VAR)));
        assert!(entries.contains(&format!("{}=http", LISTEN_FDNAMES_VAR)));
    }

    #[test]
    fn test_env_block_spec_overrides_inherited() {
        std::env::set_var("WARDEN_OVERRIDE", "old");

        let mut spec = ProcessSpec::new("web", "/bin/true");
        spec.env
            .insert("WARDEN_OVERRIDE".to_string(), "new".to_string());

        let block = EnvBlock::build(&spec, &ActivationSet::default());
        let entries = table_entries(&block);

        assert!(entries.contains(&"WARDEN_OVERRIDE=new".to_string()));
        assert!(!entries.contains(&"WARDEN_OVERRIDE=old".to_string()));
    }

    #[test]
    fn test_env_block_pid_slot() {
        let spec = ProcessSpec::new("web", "/bin/true");
        let sockets = one_socket("http");

        let mut block = EnvBlock::build(&spec, &sockets);
        block.write_pid(12345);

        let entries = table_entries(&block);
        assert!(entries.contains(&format!("{}=12345", LISTEN_PID_VAR)));

        // The slot is rewritten in place on a restart
        block.write_pid(7);
        let entries = table_entries(&block);
        assert!(entries.contains(&format!("{}=7", LISTEN_PID_VAR)));
    }

    #[test]
    fn test_env_block_no_pid_slot_without_sockets() {
        let spec = ProcessSpec::new("web", "/bin/true");
        let block = EnvBlock::build(&spec, &ActivationSet::default());

        assert!(block.pid_entry.is_none());
        assert!(!table_entries(&block)
            .iter()
            .any(|e| e.starts_with(LISTEN_PID_VAR)));
    }

    #[tokio::test]
    async fn test_spawn_simple_process() {
        let spec = ProcessSpec::new("echo", "/bin/echo");
        let sockets = ActivationSet::default();
        let isolation = plain_context(&spec);

        let mut spawned = spawn_process(&spec, &sockets, &isolation).unwrap();
        assert!(spawned.pid > 0);

        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let spec = ProcessSpec::new("ghost", "/nonexistent/command");
        let sockets = ActivationSet::default();
        let isolation = plain_context(&spec);

        let result = spawn_process(&spec, &sockets, &isolation);
        match result {
            Err(WardenError::Spawn(name, msg)) => {
                assert_eq!(name, "ghost");
                assert!(msg.contains("does not exist"));
            }
            other => panic!("Expected Spawn error, got {:?}", other.map(|s| s.pid)),
        }
    }

    #[tokio::test]
    async fn test_spawn_with_env() {
        let mut spec = ProcessSpec::new("env-check", "/bin/sh");
        spec.args = vec![
            "-c".to_string(),
            "test \"$WARDEN_SPAWN_TEST\" = yes".to_string(),
        ];
        spec.env
            .insert("WARDEN_SPAWN_TEST".to_string(), "yes".to_string());

        let sockets = ActivationSet::default();
        let isolation = plain_context(&spec);

        let mut spawned = spawn_process(&spec, &sockets, &isolation).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_applies_fd_limit() {
        let mut spec = ProcessSpec::new("limited", "/bin/sh");
        spec.args = vec!["-c".to_string(), "test \"$(ulimit -n)\" = 64".to_string()];
        spec.limits.max_open_files = Some(64);

        let sockets = ActivationSet::default();
        let isolation = plain_context(&spec);

        let mut spawned = spawn_process(&spec, &sockets, &isolation).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success(), "rlimit not visible in child");
    }

    #[tokio::test]
    async fn test_activation_env_and_descriptor_handoff() {
        let socket_specs = vec![
            SocketSpec {
                name: "http".to_string(),
                tcp: Some("127.0.0.1:0".to_string()),
                unix: None,
            },
            SocketSpec {
                name: "admin".to_string(),
                tcp: Some("127.0.0.1:0".to_string()),
                unix: None,
            },
        ];
        let sockets = SocketActivator::prepare(&socket_specs).unwrap();

        // The child verifies the full contract: count, names, pid
        // matching its own, and that fds 3 and 4 are really sockets.
        let script = r#"
            test "$LISTEN_FDS" = 2 || exit 1
            test "$LISTEN_FDNAMES" = "http:admin" || exit 2
            test "$LISTEN_PID" = "$$" || exit 3
            test -S /proc/self/fd/3 || exit 4
            test -S /proc/self/fd/4 || exit 5
        "#;

        let mut spec = ProcessSpec::new("activated", "/bin/sh");
        spec.args = vec!["-c".to_string(), script.to_string()];
        let isolation = plain_context(&spec);

        let mut spawned = spawn_process(&spec, &sockets, &isolation).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert_eq!(status.code(), Some(0), "activation contract violated");
    }

    /// The activated spawn path must complete promptly; the runtime
    /// must never end up waiting on the forked half.
    #[tokio::test]
    async fn test_activated_spawn_does_not_stall() {
        let sockets = one_socket("http");
        let mut spec = ProcessSpec::new("prompt", "/bin/sh");
        spec.args = vec!["-c".to_string(), "exit 0".to_string()];
        let isolation = plain_context(&spec);

        let waited = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let mut spawned = spawn_process(&spec, &sockets, &isolation).unwrap();
            spawned.child.wait().await.unwrap()
        })
        .await
        .expect("spawn path stalled");
        assert!(waited.success());
    }
}
