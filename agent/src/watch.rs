//! Update-driven trigger mode: a server-side-filtered watch on the one node
//! this agent owns, each delivery feeding one reconcile pass.
use std::future::Future;
use std::pin::pin;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use tokio::time::Duration;
use tracing::{info, warn};

use models::node::NodeClient;

use crate::events::EventSink;
use crate::imds::ImdsProbe;
use crate::reconciler::{Reconciler, Trigger};

const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the watch driver until shutdown. Watch errors restart the stream with
/// backoff; they never end the driver.
pub async fn run_watch_driver<C, P, S>(
    reconciler: &Reconciler<C, P, S>,
    client: kube::Client,
    node_name: &str,
    shutdown: impl Future<Output = ()>,
) where
    C: NodeClient,
    P: ImdsProbe,
    S: EventSink,
{
    let api: Api<Node> = Api::all(client);
    let field_selector = format!("metadata.name={node_name}");

    // Initial synchronous list so the first pass doesn't wait on watch
    // delivery. A timeout here is logged and the watch proceeds anyway.
    match tokio::time::timeout(
        INITIAL_SYNC_TIMEOUT,
        api.list(&ListParams::default().fields(&field_selector)),
    )
    .await
    {
        Ok(Ok(list)) => {
            if let Some(node) = list.items.into_iter().next() {
                reconciler.reconcile(Trigger::NodeUpdate(node)).await;
            } else {
                warn!(node = node_name, "initial list returned no node");
            }
        }
        Ok(Err(err)) => {
            warn!(error = %err, "initial node list failed, the watch will catch up");
        }
        Err(_) => {
            warn!("timed out waiting for the initial node list, the watch will catch up");
        }
    }

    info!(node = node_name, "starting the node watch");
    let stream = watcher(api, watcher::Config::default().fields(&field_selector))
        .default_backoff()
        .applied_objects();
    let mut stream = pin!(stream);
    let mut shutdown = pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping the node watch");
                break;
            }
            next = stream.try_next() => match next {
                Ok(Some(node)) => reconciler.reconcile(Trigger::NodeUpdate(node)).await,
                Ok(None) => {
                    warn!("node watch stream ended");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "node watch error, the stream will restart");
                }
            },
        }
    }
}
