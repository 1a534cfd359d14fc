//! Process supervision: one control loop per managed process, a shared
//! process table, policy-driven restarts and diff-based config reload.

pub mod backoff;
pub mod spawner;
pub mod state;
mod task;

pub use state::{ExitClass, ProcessState, ProcessStatus};
pub use task::Control;

use crate::activation::{ActivationSet, SocketActivator};
use crate::config::{self, ProcessSpec};
use crate::error::{Result, WardenError};
use crate::events::EventReporter;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use task::SupervisionTask;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Supervisor tuning knobs
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// How long a process must stay alive past spawn to count as Running
    pub grace_window: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_millis(500),
        }
    }
}

/// Table entry for one managed process
struct ProcessHandle {
    spec: Arc<ProcessSpec>,
    ctrl_tx: mpsc::UnboundedSender<Control>,
    status_rx: watch::Receiver<ProcessStatus>,
    task: JoinHandle<()>,
}

/// Owns the process table and the per-process supervision tasks
///
/// The table is the single point of mutation: tasks publish their state
/// over watch channels and are controlled over mpsc channels, so no two
/// loops ever touch the same entry concurrently. Must be created inside
/// a tokio runtime.
pub struct Supervisor {
    table: Arc<Mutex<HashMap<String, ProcessHandle>>>,
    reporter: Arc<dyn EventReporter>,
    settings: SupervisorSettings,
    reload_lock: Mutex<()>,
    done_tx: mpsc::UnboundedSender<String>,
}

impl Supervisor {
    pub fn new(reporter: Arc<dyn EventReporter>, settings: SupervisorSettings) -> Self {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
        let table: Arc<Mutex<HashMap<String, ProcessHandle>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Reaper: drops table entries once their task reached a terminal
        // state and reported it
        let reap_table = Arc::clone(&table);
        tokio::spawn(async move {
            while let Some(name) = done_rx.recv().await {
                let mut table = reap_table.lock().await;
                let terminal = table
                    .get(&name)
                    .map(|handle| handle.status_rx.borrow().state.is_terminal())
                    .unwrap_or(false);
                if terminal {
                    debug!(process = %name, "Reaping terminated process entry");
                    table.remove(&name);
                }
            }
        });

        Self {
            table,
            reporter,
            settings,
            reload_lock: Mutex::new(()),
            done_tx,
        }
    }

    /// Start supervising one spec
    ///
    /// Activation sockets are bound here, before the supervisory loop
    /// exists; a bind failure means no loop is ever started.
    pub async fn start(&self, spec: ProcessSpec) -> Result<()> {
        spec.validate()?;

        if self.table.lock().await.contains_key(&spec.name) {
            return Err(WardenError::ProcessAlreadyExists(spec.name));
        }

        // Bind outside the table lock; bind() blocks. A set bound on a
        // lost name race is simply dropped below.
        let sockets = SocketActivator::prepare(&spec.sockets)?;

        let mut table = self.table.lock().await;
        if table.contains_key(&spec.name) {
            return Err(WardenError::ProcessAlreadyExists(spec.name));
        }

        info!(process = %spec.name, sockets = sockets.len(), "Starting supervision");
        let name = spec.name.clone();
        let handle = self.spawn_entry(Arc::new(spec), Arc::new(sockets));
        table.insert(name, handle);

        Ok(())
    }

    /// Start a whole spec set
    ///
    /// All activation sockets across the set are bound before any loop
    /// starts; any validation or bind error aborts the entire startup
    /// with nothing running and nothing bound.
    pub async fn start_all(&self, specs: Vec<ProcessSpec>) -> Result<()> {
        config::validate_set(&specs)?;

        {
            let table = self.table.lock().await;
            for spec in &specs {
                if table.contains_key(&spec.name) {
                    return Err(WardenError::ProcessAlreadyExists(spec.name.clone()));
                }
            }
        }

        // Phase 1: bind everything, outside the table lock since bind()
        // blocks. A failure drops the already-bound sets before
        // returning.
        let mut prepared = Vec::with_capacity(specs.len());
        for spec in specs {
            let sockets = SocketActivator::prepare(&spec.sockets)?;
            prepared.push((spec, sockets));
        }

        // Phase 2: start the loops, re-checking names lost to a
        // concurrent start.
        let mut table = self.table.lock().await;
        for (spec, _) in &prepared {
            if table.contains_key(&spec.name) {
                return Err(WardenError::ProcessAlreadyExists(spec.name.clone()));
            }
        }
        for (spec, sockets) in prepared {
            let name = spec.name.clone();
            let handle = self.spawn_entry(Arc::new(spec), Arc::new(sockets));
            table.insert(name, handle);
        }

        Ok(())
    }

    fn spawn_entry(&self, spec: Arc<ProcessSpec>, sockets: Arc<ActivationSet>) -> ProcessHandle {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ProcessStatus::pending(spec.name.clone()));

        let task = SupervisionTask::new(
            Arc::clone(&spec),
            sockets,
            self.settings,
            status_tx,
            ctrl_rx,
            Arc::clone(&self.reporter),
            self.done_tx.clone(),
        );
        let join = tokio::spawn(task.run());

        ProcessHandle {
            spec,
            ctrl_tx,
            status_rx,
            task: join,
        }
    }

    /// Gracefully stop one process and reap its entry
    ///
    /// A stop that lands during restart backoff cancels the pending
    /// restart. Returns once the process reached a terminal state.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let (ctrl_tx, mut status_rx) = {
            let table = self.table.lock().await;
            let handle = table
                .get(name)
                .ok_or_else(|| WardenError::ProcessNotFound(name.to_string()))?;
            (handle.ctrl_tx.clone(), handle.status_rx.clone())
        };

        let _ = ctrl_tx.send(Control::Stop);

        // A closed sender means the task already finished
        let _ = status_rx.wait_for(|s| s.state.is_terminal()).await;

        let handle = self.table.lock().await.remove(name);
        if let Some(handle) = handle {
            let _ = handle.task.await;
        }

        Ok(())
    }

    /// Current snapshot for one process
    pub async fn status(&self, name: &str) -> Option<ProcessStatus> {
        let table = self.table.lock().await;
        table.get(name).map(|h| h.status_rx.borrow().clone())
    }

    /// Snapshots of every table entry
    pub async fn list(&self) -> Vec<ProcessStatus> {
        let table = self.table.lock().await;
        table.values().map(|h| h.status_rx.borrow().clone()).collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.table.lock().await.contains_key(name)
    }

    /// Replace the managed set with a new one
    ///
    /// Diffs the new set against the table: removed names are stopped
    /// and reaped, added names are started, changed specs are replaced
    /// wholesale. Serialized against concurrent reloads, so a name is
    /// never stopped and started by two reloads at once.
    pub async fn reload(&self, specs: Vec<ProcessSpec>) -> Result<()> {
        config::validate_set(&specs)?;
        let _guard = self.reload_lock.lock().await;

        let desired: HashMap<&str, &ProcessSpec> =
            specs.iter().map(|s| (s.name.as_str(), s)).collect();

        let current: Vec<(String, Arc<ProcessSpec>)> = {
            let table = self.table.lock().await;
            table
                .iter()
                .map(|(name, handle)| (name.clone(), Arc::clone(&handle.spec)))
                .collect()
        };

        for (name, old_spec) in &current {
            let keep = desired
                .get(name.as_str())
                .map(|new_spec| **new_spec == **old_spec)
                .unwrap_or(false);
            if !keep {
                info!(process = %name, "Reload: stopping");
                match self.stop(name).await {
                    Ok(()) | Err(WardenError::ProcessNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let running: HashSet<String> = {
            let table = self.table.lock().await;
            table.keys().cloned().collect()
        };

        for spec in specs {
            if !running.contains(&spec.name) {
                info!(process = %spec.name, "Reload: starting");
                self.start(spec).await?;
            }
        }

        Ok(())
    }

    /// Stop every managed process
    pub async fn shutdown(&self) -> Result<()> {
        let names: Vec<String> = {
            let table = self.table.lock().await;
            table.keys().cloned().collect()
        };

        info!(count = names.len(), "Stopping all managed processes");
        for name in names {
            match self.stop(&name).await {
                Ok(()) | Err(WardenError::ProcessNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}
