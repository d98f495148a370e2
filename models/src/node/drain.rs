//! Provides an implementation for draining Pods from a Kubernetes Node, similar to `kubectl drain`.
//!
//! The cluster API has no server-side drain: a drain is a client-side combination of a cordon
//! followed by removing Pods from the Node. This implementation uses the eviction subresource,
//! which respects PodDisruptionBudgets (PDBs).
//!
//! Cordoning is not handled here; see the node client.
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{EvictParams, ListParams},
    Api, ResourceExt,
};
use snafu::ResultExt;
use tokio::time::{sleep, Duration};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{debug, error, info, instrument};

// Maximum number of Pods to evict concurrently. Waiting for Pods to be deleted is included in
// this limitation. Eviction retries are slow under typical conditions, but we don't want to
// generate too many requests to the cluster API.
const CONCURRENT_EVICTIONS: usize = 5;

// When waiting for a PodDisruptionBudget to be satisfied, or if there is a server error, we stall
// for a fixed rate between eviction attempts. `kubectl drain` similarly waits 5 seconds.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

// After evictions are created, we wait for the Pods to be deleted by Kubernetes, polling at this
// interval. There is no upper bound on the wait: disruption-budget-compliant eviction is allowed
// to take as long as it takes, and the shutdown context is the only thing that cuts it short.
const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

// Some errors while attempting evictions result in retries with exponential backoff.
// These values configure how long to delay between tries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(20);
const NUM_RETRIES: usize = 10;

/// Wrapper struct to provide retry configurations for evictions.
struct RetryStrategy {}
impl RetryStrategy {
    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(NUM_RETRIES)
    }
}

impl tokio_retry::Condition<error::EvictionError> for RetryStrategy {
    fn should_retry(&mut self, error: &error::EvictionError) -> bool {
        error.should_retry()
    }
}

/// Drains a node of all drainable pods.
///
/// Pods are removed through the Eviction API in order to respect Pod Disruption Budgets. By
/// default we skip:
/// * DaemonSet Pods - The DaemonSet controller does not respect node cordons, so we don't battle it.
/// * Mirror Pods - These are static and cannot be controlled.
///
/// Everything else is evicted, including pods with local emptyDir storage and unreplicated pods,
/// matching a forced `kubectl drain`. PodDisruptionBudgets can be used to protect workloads from
/// being unduly interrupted.
///
/// A pod whose eviction ultimately fails is logged and skipped rather than failing the drain;
/// the caller re-enters on its next pass and retries what is left.
#[instrument(skip(k8s_client), err)]
pub(super) async fn drain_node(
    k8s_client: &kube::Client,
    node_name: &str,
) -> Result<(), error::DrainError> {
    let target_pods = find_target_pods(k8s_client, node_name).await?;

    // Perform the eviction for each pod simultaneously.
    stream::iter(target_pods)
        .for_each_concurrent(CONCURRENT_EVICTIONS, move |pod| {
            let k8s_client = k8s_client.clone();
            async move {
                if evict_pod(&k8s_client, &pod).await.is_ok() {
                    wait_for_deletion(&k8s_client, &pod).await;
                }
            }
        })
        .await;

    Ok(())
}

/// Finds all pods on a given node that are targeted for eviction during a drain.
#[instrument(skip(k8s_client), err)]
async fn find_target_pods(
    k8s_client: &kube::Client,
    node_name: &str,
) -> Result<impl Iterator<Item = Pod>, error::DrainError> {
    let pods: Api<Pod> = Api::all(k8s_client.clone());

    let our_pods = pods
        .list(&ListParams {
            field_selector: Some(format!("spec.nodeName={}", node_name)),
            ..Default::default()
        })
        .await
        .context(error::FindTargetPodsSnafu {
            node_name: node_name.to_string(),
        })?;

    Ok(filter_pods(our_pods.into_iter()))
}

/// Given a list of all pods for a given node, this filters out pods which we do not want to
/// attempt to drain: completed pods, DaemonSet members, and static mirror pods.
fn filter_pods<F: Iterator<Item = Pod>>(pods: F) -> impl Iterator<Item = Pod> {
    pods.filter(|pod| {
        // Completed pods hold no workload and need no eviction.
        if let Some(phase) = pod.status.as_ref().and_then(|status| status.phase.as_ref()) {
            if phase == "Succeeded" || phase == "Failed" {
                info!(
                    "Not draining Pod '{}': Pod has already completed",
                    pod.name_any()
                );
                return false;
            }
        }

        // Ignore daemonset pods, as the DaemonSet controller ignores node cordons.
        if let Some(owner_references) = pod.metadata.owner_references.as_ref() {
            if owner_references
                .iter()
                .any(|reference| reference.controller == Some(true) && reference.kind == "DaemonSet")
            {
                info!(
                    "Not draining Pod '{}': Pod is member of a DaemonSet",
                    pod.name_any()
                );
                return false;
            }
        }

        // Ignore static mirror pods, they cannot be controlled.
        if let Some(annotations) = pod.metadata.annotations.as_ref() {
            if annotations.contains_key("kubernetes.io/config.mirror") {
                info!(
                    "Not draining Pod '{}': Pod is a static Mirror Pod",
                    pod.name_any()
                );
                return false;
            }
        }

        true
    })
}

#[instrument(skip(k8s_client, pod), err)]
/// Create an eviction for the desired Pod.
async fn evict_pod(k8s_client: &kube::Client, pod: &Pod) -> Result<(), error::EvictionError> {
    let pod_api = namespaced_pod_api(k8s_client, pod);

    // A 429 (TOO MANY REQUESTS) response indicates we must wait for a PodDisruptionBudget to be
    // satisfied; a 500 typically means misconfigured PDBs (e.g. several selecting the same Pod).
    // Either can persist indefinitely for invalid or unsatisfiable PDBs; we keep retrying rather
    // than clobber an attempt to protect cluster resources. Operators must intervene manually.
    // See https://kubernetes.io/docs/tasks/administer-cluster/safely-drain-node/#stuck-evictions
    RetryIf::spawn(
        RetryStrategy::retry_strategy(),
        || async {
            loop {
                info!("Attempting to evict pod {}", pod.name_any());
                let eviction_result = pod_api.evict(&pod.name_any(), &EvictParams::default()).await;

                match eviction_result {
                    Ok(_) => {
                        info!("Successfully evicted Pod '{}'", pod.name_any());
                        break;
                    }
                    Err(kube::Error::Api(e)) => match e.code {
                        429 => {
                            error!(
                                "Too many requests when creating Eviction for Pod '{}': '{}'. This is likely due to respecting a Pod Disruption Budget. Retrying in {:.2}s.",
                                pod.name_any(),
                                e,
                                EVICTION_RETRY_INTERVAL.as_secs_f64()
                            );
                            sleep(EVICTION_RETRY_INTERVAL).await;
                            continue;
                        }
                        500 => {
                            error!(
                                "Error when evicting Pod '{}': '{}'. Check for misconfigured PodDisruptionBudgets. Retrying in {:.2}s.",
                                pod.name_any(),
                                e,
                                EVICTION_RETRY_INTERVAL.as_secs_f64()
                            );
                            sleep(EVICTION_RETRY_INTERVAL).await;
                            continue;
                        }
                        // The Pod is gone, or lives in a deleting namespace where evictions are
                        // forbidden. Neither can be helped by trying again.
                        404 | 403 => {
                            return Err(error::EvictionError::NonRetriableEviction {
                                source: kube::Error::Api(e.clone()),
                                pod_name: pod.name_any(),
                            });
                        }
                        _ => {
                            error!("Error when evicting Pod '{}': '{}'.", pod.name_any(), e);
                            return Err(error::EvictionError::RetriableEviction {
                                source: kube::Error::Api(e.clone()),
                                pod_name: pod.name_any(),
                            });
                        }
                    },
                    Err(e) => {
                        error!("Eviction failed: '{}'. Retrying...", e);
                        return Err(error::EvictionError::RetriableEviction {
                            source: e,
                            pod_name: pod.name_any(),
                        });
                    }
                }
            }
            Ok(())
        },
        RetryStrategy {},
    )
    .await
}

#[instrument(skip(k8s_client, pod))]
/// Wait for the given Pod to be deleted by Kubernetes.
async fn wait_for_deletion(k8s_client: &kube::Client, pod: &Pod) {
    let pod_api = namespaced_pod_api(k8s_client, pod);
    loop {
        match pod_api.get(&pod.name_any()).await {
            Err(kube::Error::Api(e)) if e.code == 404 => {
                info!("Pod {} deleted.", pod.name_any());
                break;
            }
            Ok(_) => {
                debug!(
                    "Pod '{}' not yet deleted. Waiting {}s.",
                    pod.name_any(),
                    DELETION_CHECK_INTERVAL.as_secs_f64()
                );
            }
            Err(e) => {
                error!(
                    "Could not determine if Pod '{}' has been deleted: '{}'. Waiting {}s.",
                    pod.name_any(),
                    e,
                    DELETION_CHECK_INTERVAL.as_secs_f64()
                );
            }
        }
        sleep(DELETION_CHECK_INTERVAL).await;
    }
}

/// Creates a kube::Api<Pod> for interacting with Pods in the namespace associated with the given Pod.
fn namespaced_pod_api(k8s_client: &kube::Client, pod: &Pod) -> Api<Pod> {
    match pod.metadata.namespace.as_ref() {
        Some(ns) => Api::namespaced(k8s_client.clone(), ns),
        None => Api::default_namespaced(k8s_client.clone()),
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DrainError {
        #[snafu(display("Unable to find drainable Pods for Node '{}': '{}'", node_name, source))]
        FindTargetPods {
            source: kube::Error,
            node_name: String,
        },
    }

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum EvictionError {
        #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
        /// An error occurred while attempting to evict a Pod. This may result in an attempt to
        /// retry the eviction.
        RetriableEviction {
            source: kube::Error,
            pod_name: String,
        },

        #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
        /// A fatal error occurred while attempting to evict a Pod. This will not be retried.
        NonRetriableEviction {
            source: kube::Error,
            pod_name: String,
        },
    }

    impl EvictionError {
        pub fn should_retry(&self) -> bool {
            match self {
                Self::RetriableEviction { .. } => true,
                Self::NonRetriableEviction { .. } => false,
            }
        }
    }
}
