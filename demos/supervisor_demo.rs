//! Supervise a socket-activated process and watch its lifecycle events.
//!
//! Run with: cargo run --example supervisor_demo

use std::sync::Arc;
use warden::config::{ProcessSpec, RestartPolicy, SocketSpec};
use warden::events::ChannelReporter;
use warden::supervisor::{Supervisor, SupervisorSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let (reporter, mut events) = ChannelReporter::new();
    let supervisor = Supervisor::new(Arc::new(reporter), SupervisorSettings::default());

    let mut spec = ProcessSpec::new("web", "/bin/sh");
    spec.args = vec![
        "-c".to_string(),
        "echo \"serving with $LISTEN_FDS socket(s): $LISTEN_FDNAMES\"; sleep 3".to_string(),
    ];
    spec.restart = RestartPolicy::Never;
    spec.sockets = vec![SocketSpec {
        name: "http".to_string(),
        tcp: Some("127.0.0.1:0".to_string()),
        unix: None,
    }];

    supervisor.start(spec).await?;

    while let Some(event) = events.recv().await {
        println!(
            "[{}] {} -> {} (exit: {:?})",
            event.process, event.from, event.to, event.exit_code
        );
        if event.to.is_terminal() {
            break;
        }
    }

    supervisor.shutdown().await?;
    Ok(())
}
