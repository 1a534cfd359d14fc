//! End-to-end socket activation through the supervisor: descriptors
//! bound before the loop starts, handed to the child at fd 3 with the
//! activation environment, surviving a policy restart.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use warden::config::{ProcessSpec, RestartPolicy, SocketSpec};
use warden::events::{ChannelReporter, LifecycleEvent};
use warden::supervisor::{ProcessState, Supervisor, SupervisorSettings};

fn test_supervisor() -> (Supervisor, UnboundedReceiver<LifecycleEvent>) {
    let (reporter, rx) = ChannelReporter::new();
    let settings = SupervisorSettings {
        grace_window: Duration::from_millis(100),
    };
    (Supervisor::new(Arc::new(reporter), settings), rx)
}

async fn wait_for_state(
    rx: &mut UnboundedReceiver<LifecycleEvent>,
    state: ProcessState,
) -> LifecycleEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for lifecycle event")
            .expect("event channel closed");
        if event.to == state {
            return event;
        }
    }
}

#[tokio::test]
async fn test_activated_process_reaches_running() {
    let (supervisor, mut rx) = test_supervisor();

    // Checks the contract, then serves (sleeps) holding the descriptor
    let script = r#"
        test "$LISTEN_FDS" = 1 || exit 1
        test "$LISTEN_FDNAMES" = http || exit 2
        test "$LISTEN_PID" = "$$" || exit 3
        test -S /proc/self/fd/3 || exit 4
        sleep 30
    "#;

    let mut spec = ProcessSpec::new("web", "/bin/sh");
    spec.args = vec!["-c".to_string(), script.to_string()];
    spec.restart = RestartPolicy::Always;
    spec.stop_timeout_secs = 2;
    spec.sockets = vec![SocketSpec {
        name: "http".to_string(),
        tcp: Some("127.0.0.1:0".to_string()),
        unix: None,
    }];
    supervisor.start(spec).await.unwrap();

    // Surviving the grace window means every contract check passed
    wait_for_state(&mut rx, ProcessState::Running).await;

    supervisor.stop("web").await.unwrap();
}

#[tokio::test]
async fn test_restarted_process_gets_same_descriptors() {
    let (supervisor, mut rx) = test_supervisor();

    // Re-checks the contract on every lifetime
    let script = r#"
        test "$LISTEN_FDS" = 1 || exit 1
        test "$LISTEN_PID" = "$$" || exit 3
        test -S /proc/self/fd/3 || exit 4
        sleep 30
    "#;

    let mut spec = ProcessSpec::new("web", "/bin/sh");
    spec.args = vec!["-c".to_string(), script.to_string()];
    spec.restart = RestartPolicy::Always;
    spec.restart_initial_delay_secs = 0;
    spec.stop_timeout_secs = 2;
    spec.sockets = vec![SocketSpec {
        name: "http".to_string(),
        unix: None,
        tcp: Some("127.0.0.1:0".to_string()),
    }];
    supervisor.start(spec).await.unwrap();

    wait_for_state(&mut rx, ProcessState::Running).await;
    let pid = supervisor.status("web").await.unwrap().pid.unwrap();

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    // The replacement only reaches Running if the retained descriptor
    // was handed over again and LISTEN_PID was refreshed to its pid
    wait_for_state(&mut rx, ProcessState::Restarting).await;
    wait_for_state(&mut rx, ProcessState::Running).await;
    assert_ne!(supervisor.status("web").await.unwrap().pid.unwrap(), pid);

    supervisor.stop("web").await.unwrap();
}
