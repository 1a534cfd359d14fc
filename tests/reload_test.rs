//! Diff-based reload: removed specs are stopped, added specs are
//! started, changed specs are replaced, unchanged specs are untouched.

use std::sync::Arc;
use std::time::Duration;
use warden::config::{ProcessSpec, RestartPolicy};
use warden::events::ChannelReporter;
use warden::supervisor::{ProcessState, Supervisor, SupervisorSettings};

fn test_supervisor() -> Supervisor {
    let (reporter, _rx) = ChannelReporter::new();
    let settings = SupervisorSettings {
        grace_window: Duration::from_millis(100),
    };
    Supervisor::new(Arc::new(reporter), settings)
}

fn sleeper(name: &str) -> ProcessSpec {
    let mut spec = ProcessSpec::new(name, "/bin/sleep");
    spec.args = vec!["30".to_string()];
    spec.restart = RestartPolicy::Never;
    spec.stop_timeout_secs = 2;
    spec
}

async fn wait_until_running(supervisor: &Supervisor, name: &str) -> u32 {
    for _ in 0..100 {
        if let Some(status) = supervisor.status(name).await {
            if status.state == ProcessState::Running {
                return status.pid.unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{name} never reached Running");
}

#[tokio::test]
async fn test_reload_applies_set_difference() {
    let supervisor = test_supervisor();

    supervisor
        .start_all(vec![sleeper("a"), sleeper("b")])
        .await
        .unwrap();
    wait_until_running(&supervisor, "a").await;
    let b_pid = wait_until_running(&supervisor, "b").await;

    supervisor
        .reload(vec![sleeper("b"), sleeper("c")])
        .await
        .unwrap();

    // a removed, b kept as-is, c added
    assert!(!supervisor.contains("a").await);
    assert!(supervisor.contains("b").await);
    let c_pid = wait_until_running(&supervisor, "c").await;
    assert!(c_pid > 0);

    // Unchanged spec keeps its process
    assert_eq!(supervisor.status("b").await.unwrap().pid, Some(b_pid));

    supervisor.shutdown().await.unwrap();
    assert!(supervisor.list().await.is_empty());
}

#[tokio::test]
async fn test_reload_replaces_changed_spec() {
    let supervisor = test_supervisor();

    supervisor.start(sleeper("app")).await.unwrap();
    let old_pid = wait_until_running(&supervisor, "app").await;

    let mut changed = sleeper("app");
    changed.args = vec!["60".to_string()];
    supervisor.reload(vec![changed]).await.unwrap();

    let new_pid = wait_until_running(&supervisor, "app").await;
    assert_ne!(new_pid, old_pid);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reload_rejects_invalid_set_without_touching_running() {
    let supervisor = test_supervisor();

    supervisor.start(sleeper("keep")).await.unwrap();
    wait_until_running(&supervisor, "keep").await;

    // Duplicate names fail validation before any diffing happens
    let result = supervisor.reload(vec![sleeper("x"), sleeper("x")]).await;
    assert!(result.is_err());

    assert!(supervisor.contains("keep").await);
    assert!(!supervisor.contains("x").await);

    supervisor.shutdown().await.unwrap();
}
