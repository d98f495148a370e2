//! Cluster event reporting. Events are fire-and-forget: a failed publish is
//! logged and never fails the pass that produced it.
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Resource;
use tracing::warn;

use models::constants;

/// The event reasons operators see, one per act.
pub const REASON_CORDON: &str = "CordonNode";
pub const REASON_DRAIN: &str = "DrainNode";
pub const REASON_UNCORDON: &str = "UncordonNode";

#[async_trait]
/// Seam over the cluster event recorder so reconciler tests can capture the
/// emitted events.
pub trait EventSink: Send + Sync {
    async fn publish(&self, node: &Node, event_type: EventType, reason: &str, note: String);
}

#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: kube::Client) -> Self {
        let recorder = Recorder::new(
            client,
            Reporter {
                controller: constants::MECHANIC.to_string(),
                instance: None,
            },
        );
        KubeEventSink { recorder }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, node: &Node, event_type: EventType, reason: &str, note: String) {
        let reference = node.object_ref(&());
        let event = Event {
            type_: event_type,
            action: reason.to_string(),
            reason: reason.to_string(),
            note: Some(note),
            secondary: None,
        };

        if let Err(err) = self.recorder.publish(&event, &reference).await {
            warn!(error = %err, reason, "failed to publish cluster event");
        }
    }
}
