//! mechanic: a per-node maintenance agent. It watches the node it runs on for
//! platform-scheduled VM events and host-health problems, cordons and drains
//! the node when policy calls the event disruptive, and releases its own
//! cordon once the condition clears.
use std::env;
use std::fs;
use std::path::Path;
use std::process;

use snafu::{ensure, ResultExt};
use tokio::signal;
use tracing::{info, warn};

use models::config::{self, MechanicConfig, SharedConfig};
use models::node::{self, K8sNodeClient, NodeClient};
use models::telemetry;

mod error;
mod events;
mod imds;
mod policy;
mod poll;
mod reconciler;
mod state;
mod watch;

use crate::error::Result;
use crate::events::KubeEventSink;
use crate::imds::ImdsClient;
use crate::reconciler::Reconciler;
use crate::state::AgentState;

const TERMINATION_LOG: &str = "/dev/termination-log";

#[tokio::main]
async fn main() {
    let termination_log =
        env::var("TERMINATION_LOG").unwrap_or_else(|_| TERMINATION_LOG.to_string());

    if let Err(error) = run_agent().await {
        // Startup failures are the only fatal paths; anything after startup
        // keeps the agent running.
        eprintln!("{error}");
        let _ = fs::write(&termination_log, format!("{error}"));
        process::exit(1);
    }
}

async fn run_agent() -> Result<()> {
    let config_path = Path::new(config::DEFAULT_CONFIG_PATH);
    let (config, load_error) = match MechanicConfig::load(config_path) {
        Ok(config) => (config, None),
        Err(err) => (MechanicConfig::fallback_defaults(), Some(err)),
    };

    telemetry::init_telemetry(&config.runtime_env, config.enable_tracing)
        .context(error::TelemetrySnafu)?;
    if let Some(err) = load_error {
        warn!(
            error = %err,
            "failed to read configuration, proceeding with default values and environment variables"
        );
    }

    ensure!(!config.node_name.is_empty(), error::MissingNodeNameSnafu);
    let node_name = config.node_name.clone();

    info!(node = %node_name, "building the Kubernetes client");
    let k8s_client = kube::Client::try_default()
        .await
        .context(error::ClientCreateSnafu)?;

    let node_client = K8sNodeClient::new(k8s_client.clone(), node_name.clone());

    // Sync agent state with the current node status. The ownership label on
    // the node, not anything local, is what survives restarts.
    let node = node_client
        .get_node()
        .await
        .context(error::FetchNodeSnafu {
            node_name: node_name.clone(),
        })?;
    let state = state::shared(AgentState {
        is_cordoned: node::is_unschedulable(&node),
        ..Default::default()
    });

    let probe = ImdsClient::new().context(error::BuildProbeSnafu)?;
    let events = KubeEventSink::new(k8s_client.clone());

    let shared_config = SharedConfig::new(config.clone());
    let reload_task = config::spawn_reload_task(shared_config.clone(), config_path.to_path_buf());

    let reconciler = Reconciler::new(
        node_client,
        probe,
        events,
        shared_config.clone(),
        state.clone(),
    );

    if config.bypass_node_problem_detector {
        poll::run_poll_driver(&reconciler, shared_config, shutdown_signal()).await;
    } else {
        watch::run_watch_driver(&reconciler, k8s_client, &node_name, shutdown_signal()).await;
    }

    // Wait for any in-flight pass to release the lock before exiting.
    let _ = state.lock().await;
    reload_task.abort();

    info!("mechanic shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler")
    };

    #[cfg(not(unix))]
    ctrl_c.await;

    #[cfg(unix)]
    {
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        };
    }
}
