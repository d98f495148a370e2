use super::error::{self, Result};
use super::{drain, has_cordon_label, is_unschedulable};
use crate::constants;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, PostParams};
use snafu::{ensure, ResultExt};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{debug, info, instrument};

#[cfg(feature = "mockall")]
use mockall::mock;

// Write conflicts (HTTP 409) are retried with exponential backoff.
// These values configure how long to delay between tries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(1);
const NUM_RETRIES: usize = 5;

/// Wrapper struct to provide retry configurations for conflicting node writes.
struct RetryStrategy {}
impl RetryStrategy {
    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(NUM_RETRIES)
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

#[async_trait]
/// A trait providing an interface to operate on the node this agent owns.
/// This is provided as a trait in order to allow mocks to be used for testing
/// purposes.
pub trait NodeClient: Clone + Sized + Send + Sync {
    /// Fetch the current state of the owned node.
    async fn get_node(&self) -> Result<Node>;
    /// Mark the node unschedulable and record cordon ownership. Returns true
    /// when the node ends up cordoned, whether or not this call performed the
    /// cordon.
    async fn cordon(&self, node: &Node, state_owns_cordon: bool) -> Result<bool>;
    /// Mark the node schedulable again and drop the ownership label.
    async fn uncordon(&self, node: &Node) -> Result<()>;
    /// Evict all drainable pods from the node.
    async fn drain(&self, node: &Node) -> Result<bool>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock NodeClient for use in tests.
    pub NodeClient {}
    #[async_trait]
    impl NodeClient for NodeClient {
        async fn get_node(&self) -> Result<Node>;
        async fn cordon(&self, node: &Node, state_owns_cordon: bool) -> Result<bool>;
        async fn uncordon(&self, node: &Node) -> Result<()>;
        async fn drain(&self, node: &Node) -> Result<bool>;
    }

    impl Clone for NodeClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> NodeClient for Arc<T>
where
    T: NodeClient,
{
    async fn get_node(&self) -> Result<Node> {
        (**self).get_node().await
    }

    async fn cordon(&self, node: &Node, state_owns_cordon: bool) -> Result<bool> {
        (**self).cordon(node, state_owns_cordon).await
    }

    async fn uncordon(&self, node: &Node) -> Result<()> {
        (**self).uncordon(node).await
    }

    async fn drain(&self, node: &Node) -> Result<bool> {
        (**self).drain(node).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `NodeClient` trait backed by the cluster
/// API. This implementation will almost certainly be used in any case that
/// isn't a unit test.
pub struct K8sNodeClient {
    k8s_client: kube::client::Client,
    node_name: String,
}

impl K8sNodeClient {
    pub fn new(k8s_client: kube::client::Client, node_name: String) -> Self {
        K8sNodeClient {
            k8s_client,
            node_name,
        }
    }

    fn api(&self) -> Api<Node> {
        Api::all(self.k8s_client.clone())
    }
}

#[async_trait]
impl NodeClient for K8sNodeClient {
    #[instrument(skip(self), err)]
    async fn get_node(&self) -> Result<Node> {
        self.api()
            .get(&self.node_name)
            .await
            .context(error::GetNodeSnafu {
                node_name: self.node_name.clone(),
            })
    }

    #[instrument(skip(self, node), err)]
    async fn cordon(&self, node: &Node, state_owns_cordon: bool) -> Result<bool> {
        if is_unschedulable(node) {
            if has_cordon_label(node) || state_owns_cordon {
                debug!(node = %self.node_name, "node is already cordoned by mechanic");
            } else {
                info!(
                    node = %self.node_name,
                    "node is already cordoned, but we aren't responsible for the cordon"
                );
            }
            return Ok(true);
        }

        let api = self.api();
        RetryIf::spawn(
            RetryStrategy::retry_strategy(),
            || async {
                let mut current = api.get(&self.node_name).await?;
                current
                    .spec
                    .get_or_insert_with(Default::default)
                    .unschedulable = Some(true);
                current
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(
                        constants::CORDONED_LABEL.to_string(),
                        constants::CORDONED_LABEL_VALUE.to_string(),
                    );

                api.replace(&self.node_name, &PostParams::default(), &current)
                    .await
                    .map(|_| ())
            },
            is_conflict,
        )
        .await
        .context(error::CordonNodeSnafu {
            node_name: self.node_name.clone(),
        })?;

        // The cordon only counts once the API server shows both the
        // unschedulable flag and the ownership label.
        let updated = self
            .api()
            .get(&self.node_name)
            .await
            .context(error::GetNodeSnafu {
                node_name: self.node_name.clone(),
            })?;
        ensure!(
            is_unschedulable(&updated),
            error::CordonNotAppliedSnafu {
                node_name: self.node_name.clone(),
            }
        );
        ensure!(
            has_cordon_label(&updated),
            error::CordonNotLabeledSnafu {
                node_name: self.node_name.clone(),
            }
        );

        info!(node = %self.node_name, "node cordoned");
        Ok(true)
    }

    #[instrument(skip(self, _node), err)]
    async fn uncordon(&self, _node: &Node) -> Result<()> {
        let api = self.api();
        RetryIf::spawn(
            RetryStrategy::retry_strategy(),
            || async {
                let mut current = api.get(&self.node_name).await?;
                current
                    .spec
                    .get_or_insert_with(Default::default)
                    .unschedulable = Some(false);
                if let Some(labels) = current.metadata.labels.as_mut() {
                    labels.remove(constants::CORDONED_LABEL);
                }

                api.replace(&self.node_name, &PostParams::default(), &current)
                    .await
                    .map(|_| ())
            },
            is_conflict,
        )
        .await
        .context(error::UncordonNodeSnafu {
            node_name: self.node_name.clone(),
        })?;

        info!(node = %self.node_name, "node uncordoned");
        Ok(())
    }

    #[instrument(skip(self, _node), err)]
    async fn drain(&self, _node: &Node) -> Result<bool> {
        info!(node = %self.node_name, "beginning node drain");

        drain::drain_node(&self.k8s_client, &self.node_name)
            .await
            .context(error::DrainNodeSnafu {
                node_name: self.node_name.clone(),
            })?;

        info!(node = %self.node_name, "node drain completed");
        Ok(true)
    }
}
