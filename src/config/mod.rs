use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Restart policy governing whether a terminated process is respawned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart, regardless of exit status
    Never,
    /// Restart only on non-zero or abnormal exit
    OnFailure,
    /// Restart on any exit
    Always,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::OnFailure
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Always => write!(f, "always"),
        }
    }
}

/// Mount mode for a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl Default for MountMode {
    fn default() -> Self {
        MountMode::ReadWrite
    }
}

/// Volume type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeKind {
    /// Bind-mount a host path into the namespace
    Bind,
    /// Fresh tmpfs at the target
    Tmpfs,
    /// Bind-mount of a supervisor-managed persistent directory
    Persistent,
}

impl Default for VolumeKind {
    fn default() -> Self {
        VolumeKind::Bind
    }
}

impl std::fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeKind::Bind => write!(f, "bind"),
            VolumeKind::Tmpfs => write!(f, "tmpfs"),
            VolumeKind::Persistent => write!(f, "persistent"),
        }
    }
}

/// A single volume mount inside a process's mount namespace
///
/// Mounts are applied in declaration order and unwound in reverse.
/// Targets must not nest: overlapping targets are rejected at
/// validation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host source path (ignored for tmpfs)
    #[serde(default)]
    pub source: PathBuf,

    /// Target path inside the namespace
    pub target: PathBuf,

    #[serde(default)]
    pub mode: MountMode,

    #[serde(default)]
    pub kind: VolumeKind,
}

impl VolumeMount {
    pub fn read_only(&self) -> bool {
        self.mode == MountMode::ReadOnly
    }
}

/// A listening socket to pre-bind and hand to the child as an inherited
/// descriptor
///
/// Exactly one of `tcp` or `unix` must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketSpec {
    /// Name exposed to the child via the descriptor-name list
    pub name: String,

    /// TCP listen address, e.g. "127.0.0.1:8080"
    #[serde(default)]
    pub tcp: Option<String>,

    /// Unix socket path
    #[serde(default)]
    pub unix: Option<PathBuf>,
}

impl SocketSpec {
    /// Human-readable bind address for error reporting
    pub fn address(&self) -> String {
        match (&self.tcp, &self.unix) {
            (Some(addr), _) => addr.clone(),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => String::from("<unset>"),
        }
    }
}

/// Network bridge attachment for a process with an isolated network
/// namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Host bridge device to enslave the veth peer to
    pub bridge: String,

    /// Address to assign inside the namespace, e.g. "10.0.0.2/24"
    #[serde(default)]
    pub address: Option<String>,
}

/// Per-process resource limits, applied between fork and exec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Virtual memory cap in bytes (RLIMIT_AS)
    #[serde(default)]
    pub max_memory: Option<u64>,

    /// Open file descriptor cap (RLIMIT_NOFILE)
    #[serde(default)]
    pub max_open_files: Option<u64>,

    /// Process/thread count cap (RLIMIT_NPROC)
    #[serde(default)]
    pub max_processes: Option<u64>,
}

impl ResourceLimits {
    pub fn any(&self) -> bool {
        self.max_memory.is_some() || self.max_open_files.is_some() || self.max_processes.is_some()
    }
}

/// Set of OS namespaces to unshare for a process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespaces {
    #[serde(default)]
    pub mount: bool,
    #[serde(default)]
    pub net: bool,
    #[serde(default)]
    pub pid: bool,
    #[serde(default)]
    pub ipc: bool,
    #[serde(default)]
    pub uts: bool,
    #[serde(default)]
    pub user: bool,
}

impl Namespaces {
    pub fn any(&self) -> bool {
        self.mount || self.net || self.pid || self.ipc || self.uts || self.user
    }
}

/// Desired state of one managed process
///
/// Immutable once loaded; a config reload replaces the whole spec set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Process name (unique identifier)
    pub name: String,

    /// Path to the executable to run
    pub command: PathBuf,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Volume mounts, applied in order
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,

    /// Namespaces to unshare
    #[serde(default)]
    pub namespaces: Namespaces,

    /// Resource limits applied before exec
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Network bridge attachment (requires `namespaces.net`)
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,

    /// Restart policy
    #[serde(default)]
    pub restart: RestartPolicy,

    /// Activation sockets, bound in order before the first spawn
    #[serde(default)]
    pub sockets: Vec<SocketSpec>,

    /// Signal to send on stop (default: SIGTERM)
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Timeout before force kill (in seconds)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Initial restart backoff delay (in seconds)
    #[serde(default = "default_restart_delay")]
    pub restart_initial_delay_secs: u64,

    /// Restart backoff cap (in seconds)
    #[serde(default = "default_restart_max_delay")]
    pub restart_max_delay_secs: u64,

    /// Maximum restarts within the restart window
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    /// Window for counting restarts (in seconds)
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
}

// Default value functions for serde
fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_restart_delay() -> u64 {
    1
}

fn default_restart_max_delay() -> u64 {
    60
}

fn default_max_restarts() -> usize {
    10
}

fn default_restart_window() -> u64 {
    60
}

/// Signals accepted for `stop_signal`
pub const VALID_STOP_SIGNALS: [&str; 7] = [
    "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
];

impl ProcessSpec {
    /// Minimal spec with defaults for everything but name and command
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            volumes: Vec::new(),
            namespaces: Namespaces::default(),
            limits: ResourceLimits::default(),
            bridge: None,
            restart: RestartPolicy::default(),
            sockets: Vec::new(),
            stop_signal: default_stop_signal(),
            stop_timeout_secs: default_stop_timeout(),
            restart_initial_delay_secs: default_restart_delay(),
            restart_max_delay_secs: default_restart_max_delay(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
        }
    }

    /// Validate the spec
    ///
    /// Rejects missing command, duplicate volume targets, duplicate
    /// socket names, malformed socket addresses and unknown stop signals.
    /// Side-effect free.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(WardenError::MissingField(
                "<unnamed>".to_string(),
                "name".to_string(),
            ));
        }

        if self.command.as_os_str().is_empty() {
            return Err(WardenError::MissingField(
                self.name.clone(),
                "command".to_string(),
            ));
        }

        // Volume targets must be absolute, unique and non-nesting
        let mut targets: Vec<PathBuf> = Vec::with_capacity(self.volumes.len());
        for volume in &self.volumes {
            if !volume.target.is_absolute() {
                return Err(WardenError::InvalidSpec(
                    self.name.clone(),
                    format!(
                        "volume target must be absolute: {}",
                        volume.target.display()
                    ),
                ));
            }
            if targets.contains(&volume.target) {
                return Err(WardenError::InvalidSpec(
                    self.name.clone(),
                    format!("duplicate volume target: {}", volume.target.display()),
                ));
            }
            if let Some(other) = targets.iter().find(|t| {
                t.starts_with(&volume.target) || volume.target.starts_with(t)
            }) {
                return Err(WardenError::InvalidSpec(
                    self.name.clone(),
                    format!(
                        "overlapping volume targets: {} and {}",
                        other.display(),
                        volume.target.display()
                    ),
                ));
            }
            targets.push(volume.target.clone());
            if volume.kind != VolumeKind::Tmpfs && volume.source.as_os_str().is_empty() {
                return Err(WardenError::InvalidSpec(
                    self.name.clone(),
                    format!(
                        "{} volume {} has no source",
                        volume.kind,
                        volume.target.display()
                    ),
                ));
            }
        }

        // Socket names are exposed through a single ordered name list,
        // so they must be unique process-wide
        let mut socket_names = HashSet::new();
        for socket in &self.sockets {
            if socket.name.is_empty() {
                return Err(WardenError::InvalidSpec(
                    self.name.clone(),
                    "socket with empty name".to_string(),
                ));
            }
            if !socket_names.insert(socket.name.clone()) {
                return Err(WardenError::InvalidSpec(
                    self.name.clone(),
                    format!("duplicate socket name: {}", socket.name),
                ));
            }
            match (&socket.tcp, &socket.unix) {
                (Some(_), Some(_)) => {
                    return Err(WardenError::InvalidSpec(
                        self.name.clone(),
                        format!("socket {} sets both tcp and unix", socket.name),
                    ));
                }
                (None, None) => {
                    return Err(WardenError::InvalidSpec(
                        self.name.clone(),
                        format!("socket {} sets neither tcp nor unix", socket.name),
                    ));
                }
                _ => {}
            }
        }

        if !VALID_STOP_SIGNALS.contains(&self.stop_signal.as_str()) {
            return Err(WardenError::InvalidSpec(
                self.name.clone(),
                format!(
                    "invalid stop_signal: {}. Must be one of: {}",
                    self.stop_signal,
                    VALID_STOP_SIGNALS.join(", ")
                ),
            ));
        }

        if self.stop_timeout_secs == 0 {
            return Err(WardenError::InvalidSpec(
                self.name.clone(),
                "stop_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.max_restarts == 0 {
            return Err(WardenError::InvalidSpec(
                self.name.clone(),
                "max_restarts must be at least 1".to_string(),
            ));
        }

        for (field, value) in [
            ("limits.max_memory", self.limits.max_memory),
            ("limits.max_open_files", self.limits.max_open_files),
            ("limits.max_processes", self.limits.max_processes),
        ] {
            if value == Some(0) {
                return Err(WardenError::InvalidSpec(
                    self.name.clone(),
                    format!("{} must be greater than zero", field),
                ));
            }
        }

        if !self.volumes.is_empty() && !self.namespaces.mount {
            return Err(WardenError::InvalidSpec(
                self.name.clone(),
                "volumes require namespaces.mount".to_string(),
            ));
        }

        if self.bridge.is_some() && !self.namespaces.net {
            return Err(WardenError::InvalidSpec(
                self.name.clone(),
                "bridge attachment requires namespaces.net".to_string(),
            ));
        }

        Ok(())
    }

    /// Expand environment variables in path and string fields
    fn expand_env_vars(&mut self) {
        self.command = expand_env_in_path(&self.command);

        if let Some(ref cwd) = self.cwd {
            self.cwd = Some(expand_env_in_path(cwd));
        }

        self.args = self.args.iter().map(|arg| expand_env_in_string(arg)).collect();

        self.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
            .collect();

        for volume in &mut self.volumes {
            volume.source = expand_env_in_path(&volume.source);
        }
    }

    /// Get stop timeout as Duration
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Expand `$VAR` and `${VAR}` in a string
///
/// A bare `$VAR` reference extends over the longest run of name
/// characters, so `$PATHS` looks up `PATHS`, never `PATH` plus a
/// literal `S`. Unknown references are left untouched.
fn expand_env_in_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                match std::env::var(&braced[..end]) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        result.push('$');
                        result.push_str(&after[..end + 2]);
                    }
                }
                rest = &braced[end + 1..];
                continue;
            }
            // Unterminated brace: keep the dollar literally
            result.push('$');
            rest = after;
            continue;
        }

        let name_len = after
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        if name_len == 0 || after.as_bytes()[0].is_ascii_digit() {
            result.push('$');
            rest = after;
            continue;
        }

        let name = &after[..name_len];
        match std::env::var(name) {
            Ok(value) => result.push_str(&value),
            Err(_) => {
                result.push('$');
                result.push_str(name);
            }
        }
        rest = &after[name_len..];
    }

    result.push_str(rest);
    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(expand_env_in_string(&path_str))
}

/// Load a validated spec set from a file (supports TOML and JSON)
///
/// The whole set is validated before anything is returned, so a bad file
/// never yields a partial set.
pub fn load_specs(path: &Path) -> Result<Vec<ProcessSpec>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| WardenError::Config(format!("Failed to read config file: {}", e)))?;

    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

    let specs = match extension {
        "toml" => parse_toml(&contents)?,
        "json" => parse_json(&contents)?,
        _ => {
            return Err(WardenError::Config(format!(
                "Unsupported file format: {}. Use .toml or .json",
                extension
            )))
        }
    };

    let specs: Vec<ProcessSpec> = specs
        .into_iter()
        .map(|mut spec| {
            spec.expand_env_vars();
            spec
        })
        .collect();

    validate_set(&specs)?;

    Ok(specs)
}

/// Validate every spec and reject duplicate names across the set
pub fn validate_set(specs: &[ProcessSpec]) -> Result<()> {
    let mut names = HashSet::new();
    for spec in specs {
        spec.validate()?;
        if !names.insert(spec.name.clone()) {
            return Err(WardenError::DuplicateName(spec.name.clone()));
        }
    }
    Ok(())
}

fn parse_toml(contents: &str) -> Result<Vec<ProcessSpec>> {
    #[derive(Deserialize)]
    struct ConfigFile {
        #[serde(default)]
        processes: Vec<ProcessSpec>,
    }

    let config_file: ConfigFile = toml::from_str(contents)
        .map_err(|e| WardenError::Config(format!("Failed to parse TOML: {}", e)))?;

    if config_file.processes.is_empty() {
        return Err(WardenError::Config(
            "No process configuration found in file".to_string(),
        ));
    }

    Ok(config_file.processes)
}

fn parse_json(contents: &str) -> Result<Vec<ProcessSpec>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ConfigFile {
        Single(ProcessSpec),
        Multiple { processes: Vec<ProcessSpec> },
    }

    let config_file: ConfigFile = serde_json::from_str(contents)
        .map_err(|e| WardenError::Config(format!("Failed to parse JSON: {}", e)))?;

    match config_file {
        ConfigFile::Single(spec) => Ok(vec![spec]),
        ConfigFile::Multiple { processes } => {
            if processes.is_empty() {
                Err(WardenError::Config(
                    "No process configuration found in file".to_string(),
                ))
            } else {
                Ok(processes)
            }
        }
    }
}
