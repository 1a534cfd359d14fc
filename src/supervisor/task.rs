//! One supervisory control loop per managed process.

use crate::activation::ActivationSet;
use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use crate::events::{EventReporter, LifecycleEvent};
use crate::isolation::IsolationContext;
use crate::supervisor::backoff::{policy_allows_restart, RestartBackoff, RestartTracker};
use crate::supervisor::spawner::spawn_process;
use crate::supervisor::state::{ExitClass, ProcessState, ProcessStatus};
use crate::supervisor::SupervisorSettings;
use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Control messages delivered to a supervision task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Graceful stop; cancels a pending restart backoff
    Stop,
}

/// What the loop decided after one lifetime of the child
enum LoopOutcome {
    /// Re-enter Starting after backoff
    Restart,
    /// Terminal; report and end the task
    Finished,
}

/// What woke a supervision select
enum Watched {
    Survived,
    Exited(ExitClass),
    StopRequested,
}

/// The supervisory control loop for one process
///
/// Owns the child handle, the isolation context and the activation
/// sockets for its process. All blocking waits happen inside this task;
/// state is published through the watch channel and every transition is
/// reported as a lifecycle event.
pub(crate) struct SupervisionTask {
    spec: Arc<ProcessSpec>,
    sockets: Arc<ActivationSet>,
    settings: SupervisorSettings,
    status_tx: watch::Sender<ProcessStatus>,
    ctrl_rx: mpsc::UnboundedReceiver<Control>,
    reporter: Arc<dyn EventReporter>,
    done_tx: mpsc::UnboundedSender<String>,
    state: ProcessState,
    restarts: usize,
    tracker: RestartTracker,
}

impl SupervisionTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        spec: Arc<ProcessSpec>,
        sockets: Arc<ActivationSet>,
        settings: SupervisorSettings,
        status_tx: watch::Sender<ProcessStatus>,
        ctrl_rx: mpsc::UnboundedReceiver<Control>,
        reporter: Arc<dyn EventReporter>,
        done_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            spec,
            sockets,
            settings,
            status_tx,
            ctrl_rx,
            reporter,
            done_tx,
            state: ProcessState::Pending,
            restarts: 0,
            tracker: RestartTracker::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let backoff = RestartBackoff::from_spec(&self.spec);

        loop {
            match self.run_one_lifetime().await {
                LoopOutcome::Restart => {
                    self.tracker.record_restart();
                    let attempt = self.restarts;
                    self.restarts += 1;

                    let delay = backoff.delay_for(attempt);
                    debug!(
                        process = %self.spec.name,
                        attempt = self.restarts,
                        delay_secs = delay.as_secs(),
                        "Backing off before restart"
                    );

                    // Backoff races against the control channel so a
                    // stop always wins over the pending restart
                    tokio::select! {
                        _ = sleep(delay) => {}
                        msg = self.ctrl_rx.recv() => {
                            match msg {
                                Some(Control::Stop) | None => {
                                    info!(
                                        process = %self.spec.name,
                                        "Stop requested during backoff, cancelling restart"
                                    );
                                    self.transition(ProcessState::Stopped, None, false);
                                    break;
                                }
                            }
                        }
                    }
                }
                LoopOutcome::Finished => break,
            }
        }

        // Entry is reaped only after the terminal event went out
        let _ = self.done_tx.send(self.spec.name.clone());
    }

    /// One pass through Starting → Running → exit/stop
    async fn run_one_lifetime(&mut self) -> LoopOutcome {
        self.transition(ProcessState::Starting, None, false);

        let mut isolation = match IsolationContext::prepare(&self.spec) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(process = %self.spec.name, error = %e, "Isolation setup failed");
                return self.handle_failure(ExitClass::Abnormal(None));
            }
        };

        let mut spawned = match spawn_process(&self.spec, &self.sockets, &isolation) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(process = %self.spec.name, error = %e, "Spawn failed");
                isolation.release();
                return self.handle_failure(ExitClass::Abnormal(None));
            }
        };

        let pid = spawned.pid;
        self.publish(Some(pid));

        if let Err(e) = isolation.after_spawn(pid) {
            error!(process = %self.spec.name, error = %e, "Bridge attachment failed");
            let _ = self.kill_now(pid, &mut spawned.child).await;
            isolation.release();
            return self.handle_failure(ExitClass::Abnormal(None));
        }

        // Grace window: the process must stay alive past it to count as
        // Running
        let watched = tokio::select! {
            _ = sleep(self.settings.grace_window) => Watched::Survived,
            exit = spawned.child.wait() => Watched::Exited(exit_class(exit)),
            _ = self.ctrl_rx.recv() => Watched::StopRequested,
        };

        let outcome = match watched {
            Watched::Survived => {
                self.transition(ProcessState::Running, None, false);
                self.supervise_running(pid, &mut spawned.child).await
            }
            Watched::Exited(class) => {
                warn!(
                    process = %self.spec.name,
                    exit_code = ?class.code(),
                    "Process exited before grace window elapsed"
                );
                self.handle_failure(class)
            }
            Watched::StopRequested => self.stop_sequence(pid, &mut spawned.child).await,
        };

        isolation.release();
        outcome
    }

    /// Monitor a Running process until it exits or a stop arrives
    async fn supervise_running(&mut self, pid: u32, child: &mut Child) -> LoopOutcome {
        let exited = tokio::select! {
            exit = child.wait() => Some(exit_class(exit)),
            _ = self.ctrl_rx.recv() => None,
        };

        match exited {
            Some(class) => self.handle_exit(class),
            None => self.stop_sequence(pid, child).await,
        }
    }

    /// Graceful stop: stop signal, bounded wait, forced kill on timeout
    async fn stop_sequence(&mut self, pid: u32, child: &mut Child) -> LoopOutcome {
        self.transition(ProcessState::Stopping, None, false);

        if let Err(e) = self.send_stop_signal(pid) {
            warn!(process = %self.spec.name, error = %e, "Failed to signal process");
        }

        match timeout(self.spec.stop_timeout(), child.wait()).await {
            Ok(exit) => {
                let class = exit_class(exit);
                info!(process = %self.spec.name, exit_code = ?class.code(), "Process stopped");
                self.transition(ProcessState::Stopped, class.code(), false);
            }
            Err(_) => {
                warn!(
                    process = %self.spec.name,
                    timeout_secs = self.spec.stop_timeout_secs,
                    "Graceful stop timed out, killing"
                );
                let _ = self.kill_now(pid, child).await;
                self.transition(ProcessState::Stopped, None, true);
            }
        }

        LoopOutcome::Finished
    }

    /// Exit observed while Running: classify and apply the restart policy
    fn handle_exit(&mut self, class: ExitClass) -> LoopOutcome {
        info!(
            process = %self.spec.name,
            exit_code = ?class.code(),
            clean = class.is_clean(),
            "Process exited"
        );

        if !policy_allows_restart(self.spec.restart, class) {
            let terminal = if class.is_clean() {
                ProcessState::Stopped
            } else {
                ProcessState::Failed
            };
            self.transition(terminal, class.code(), false);
            return LoopOutcome::Finished;
        }

        self.enter_restarting(class)
    }

    /// Failure during Starting (setup, spawn, or immediate exit)
    fn handle_failure(&mut self, class: ExitClass) -> LoopOutcome {
        self.transition(ProcessState::Failed, class.code(), false);

        if !policy_allows_restart(self.spec.restart, class) {
            return LoopOutcome::Finished;
        }

        self.enter_restarting(class)
    }

    fn enter_restarting(&mut self, class: ExitClass) -> LoopOutcome {
        if !self
            .tracker
            .within_limit(self.spec.max_restarts, self.spec.restart_window_secs)
        {
            warn!(
                process = %self.spec.name,
                max_restarts = self.spec.max_restarts,
                window_secs = self.spec.restart_window_secs,
                "Restart limit exhausted"
            );
            if self.state != ProcessState::Failed {
                self.transition(ProcessState::Failed, class.code(), false);
            }
            return LoopOutcome::Finished;
        }

        self.transition(ProcessState::Restarting, class.code(), false);
        LoopOutcome::Restart
    }

    fn send_stop_signal(&self, pid: u32) -> Result<()> {
        let sig = parse_signal(&self.spec.stop_signal)?;
        signal::kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| WardenError::Stop(self.spec.name.clone(), e.to_string()))
    }

    async fn kill_now(&self, pid: u32, child: &mut Child) -> Result<()> {
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|e| WardenError::Stop(self.spec.name.clone(), e.to_string()))?;
        let _ = child.wait().await;
        Ok(())
    }

    /// Record a state transition, report it, publish the new snapshot
    fn transition(&mut self, to: ProcessState, exit_code: Option<i32>, forced: bool) {
        let from = self.state;
        self.state = to;

        let mut event = LifecycleEvent::new(self.spec.name.clone(), from, to)
            .with_exit_code(exit_code);
        if forced {
            event = event.forced();
        }
        self.reporter.report(event);

        self.publish(None);
    }

    fn publish(&self, pid: Option<u32>) {
        self.status_tx.send_modify(|status| {
            status.state = self.state;
            status.restarts = self.restarts;
            match self.state {
                ProcessState::Starting => {
                    if let Some(pid) = pid {
                        status.pid = Some(pid);
                        status.started_at = Some(Utc::now());
                    }
                }
                ProcessState::Running | ProcessState::Stopping => {
                    if let Some(pid) = pid {
                        status.pid = Some(pid);
                    }
                }
                _ => {
                    status.pid = None;
                }
            }
        });
    }
}

fn exit_class(result: std::io::Result<std::process::ExitStatus>) -> ExitClass {
    match result {
        Ok(status) => ExitClass::from_status(status),
        Err(_) => ExitClass::Abnormal(None),
    }
}

/// Map a configured signal name to a nix signal
pub(crate) fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(WardenError::Signal(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_known() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn test_parse_signal_unknown() {
        assert!(matches!(
            parse_signal("SIGFOO"),
            Err(WardenError::Signal(_))
        ));
    }
}
