//! The reconcile state machine.
//!
//! One pass per trigger: snapshot the node, evaluate its conditions, decide
//! whether policy wants a drain (consulting the metadata service to tell
//! regular freezes apart from live migrations), cordon and drain as needed,
//! and finally reconcile cordon ownership so a cordon we placed is released
//! once the condition clears and a cordon an operator placed never is.
//!
//! Passes never overlap: the entry guard is a non-blocking lock acquire and
//! contending triggers are dropped, not queued. Nothing in a pass can abort
//! the agent; every failure is logged, reported, and retried on a later pass.
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::EventType;
use tracing::{debug, error, info, instrument, warn};

use models::config::SharedConfig;
use models::node::{self, summarize_conditions, NodeClient};

use crate::events::{EventSink, REASON_CORDON, REASON_DRAIN, REASON_UNCORDON};
use crate::imds::ImdsProbe;
use crate::policy;
use crate::state::{AgentState, SharedState};

/// What woke the reconciler up.
pub enum Trigger {
    /// A node object delivered by the watch driver.
    NodeUpdate(Node),
    /// A polling-mode timer tick; the node is fetched live and scheduled
    /// events are resolved directly against the metadata service.
    Poll,
}

pub struct Reconciler<C, P, S> {
    node_client: C,
    probe: P,
    events: S,
    config: SharedConfig,
    state: SharedState,
}

impl<C, P, S> Reconciler<C, P, S>
where
    C: NodeClient,
    P: ImdsProbe,
    S: EventSink,
{
    pub fn new(
        node_client: C,
        probe: P,
        events: S,
        config: SharedConfig,
        state: SharedState,
    ) -> Self {
        Reconciler {
            node_client,
            probe,
            events,
            config,
            state,
        }
    }

    /// Run one reconcile pass. Concurrent triggers collapse: if a pass is
    /// already running this trigger is dropped and the next one will observe
    /// whatever state the current pass leaves behind.
    #[instrument(skip(self, trigger))]
    pub async fn reconcile(&self, trigger: Trigger) {
        let Ok(mut state) = self.state.try_lock() else {
            warn!("state is locked by an in-flight pass, skipping this trigger");
            return;
        };
        let config = self.config.snapshot();

        // Snapshot the node and re-seed our cordon belief from it.
        let is_poll = matches!(trigger, Trigger::Poll);
        let node = match trigger {
            Trigger::NodeUpdate(node) => node,
            Trigger::Poll => match self.node_client.get_node().await {
                Ok(node) => node,
                Err(err) => {
                    warn!(error = %err, "failed to fetch the node, skipping this pass");
                    return;
                }
            },
        };
        let node_name = node::node_name(&node).to_string();
        state.is_cordoned = node::is_unschedulable(&node);

        let proceed = if is_poll {
            self.decide_and_act_poll(&node, &config, &mut state).await
        } else {
            self.decide_and_act_watch(&node, &config, &mut state).await
        };
        if !proceed {
            return;
        }

        // Re-fetch the node so ownership reconciliation sees our own writes.
        let updated = match self.node_client.get_node().await {
            Ok(node) => node,
            Err(err) => {
                warn!(
                    node = %node_name,
                    error = %err,
                    "failed to re-fetch the node for cordon reconciliation"
                );
                return;
            }
        };
        self.reconcile_cordon_ownership(&updated, &mut state).await;

        info!(node = %node_name, state = ?*state, "finished processing node update");
    }

    /// Watch-mode decision phase: trust the node conditions, consult the
    /// metadata service only to disambiguate freeze from live migration.
    /// Returns false when the pass must be aborted before ownership
    /// reconciliation.
    async fn decide_and_act_watch(
        &self,
        node: &Node,
        config: &models::config::MechanicConfig,
        state: &mut AgentState,
    ) -> bool {
        let summary =
            summarize_conditions(node, &config.scheduled_events, &config.optional_conditions);
        state.has_drainable_condition = summary.drainable;
        state.condition_is_scheduled_event = summary.scheduled_event;
        info!(node = %node::node_name(node), state = ?*state, "finished checking node conditions");

        if !state.has_drainable_condition {
            return true;
        }
        if state.is_cordoned && state.is_drained {
            info!(
                node = %node::node_name(node),
                "node is already cordoned and drained, no action required"
            );
            return true;
        }

        // The drain decision starts as yes unless we can overturn it.
        state.should_drain = true;

        if state.condition_is_scheduled_event {
            let instance = match policy::derive_instance_name(&config.node_name) {
                Ok(instance) => instance,
                Err(err) => {
                    error!(error = %err, "unable to derive the instance name, skipping this pass");
                    return false;
                }
            };
            let response = match self.probe.scheduled_events().await {
                Ok(response) => response,
                Err(err) => {
                    error!(
                        error = %err,
                        "failed to query the metadata service, unable to determine if a drain is required"
                    );
                    return false;
                }
            };

            let is_lm =
                policy::is_live_migration(&response.events, &config.scheduled_events, &instance);
            if !is_lm && !config.scheduled_events.freeze {
                info!(
                    "node has a freeze event that is not a live migration and freeze drains are disabled, overturning the drain decision"
                );
                state.should_drain = false;
            } else if is_lm && !config.scheduled_events.live_migration {
                info!(
                    "node has a live migration event but live migration drains are disabled, overturning the drain decision"
                );
                state.should_drain = false;
            }
        }

        if state.should_drain {
            self.cordon_and_drain(node, state).await;
        }
        true
    }

    /// Polling-mode decision phase: there are no node conditions to evaluate,
    /// so the metadata service snapshot is resolved against policy directly.
    async fn decide_and_act_poll(
        &self,
        node: &Node,
        config: &models::config::MechanicConfig,
        state: &mut AgentState,
    ) -> bool {
        let instance = match policy::derive_instance_name(&config.node_name) {
            Ok(instance) => instance,
            Err(err) => {
                error!(error = %err, "unable to derive the instance name, skipping this pass");
                return false;
            }
        };
        let response = match self.probe.scheduled_events().await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "failed to query the metadata service, skipping this pass");
                return false;
            }
        };

        let should_drain =
            policy::resolve_drain(&response.events, &config.scheduled_events, &instance);
        state.has_drainable_condition = should_drain;
        state.should_drain = should_drain;
        info!(
            node = %node::node_name(node),
            should_drain,
            "finished resolving scheduled events against policy"
        );

        if state.should_drain {
            self.cordon_and_drain(node, state).await;
        }
        true
    }

    /// The act phase: cordon then drain, each skipped when already done, each
    /// reported with exactly one event. A failure ends the phase; the next
    /// pass picks up where this one stopped.
    async fn cordon_and_drain(&self, node: &Node, state: &mut AgentState) {
        let node_name = node::node_name(node);

        if state.is_cordoned {
            info!(node = %node_name, "node is already cordoned, skipping cordon");
        } else {
            match self.node_client.cordon(node, state.is_cordoned).await {
                Ok(cordoned) => {
                    state.is_cordoned = cordoned;
                    info!(node = %node_name, "node cordoned");
                    self.events
                        .publish(
                            node,
                            EventType::Normal,
                            REASON_CORDON,
                            format!("Node {node_name} cordoned by mechanic"),
                        )
                        .await;
                }
                Err(err) => {
                    error!(node = %node_name, error = %err, "failed to cordon node");
                    self.events
                        .publish(
                            node,
                            EventType::Warning,
                            REASON_CORDON,
                            format!("Failed to cordon node {node_name}"),
                        )
                        .await;
                    return;
                }
            }
        }

        if state.is_drained {
            info!(node = %node_name, "node is already drained, skipping drain");
        } else {
            match self.node_client.drain(node).await {
                Ok(drained) => {
                    state.is_drained = drained;
                    info!(node = %node_name, "node drain completed");
                    self.events
                        .publish(
                            node,
                            EventType::Normal,
                            REASON_DRAIN,
                            format!("Node {node_name} drained by mechanic"),
                        )
                        .await;
                }
                Err(err) => {
                    error!(node = %node_name, error = %err, "failed to drain node");
                    self.events
                        .publish(
                            node,
                            EventType::Warning,
                            REASON_DRAIN,
                            format!("Failed to drain node {node_name}"),
                        )
                        .await;
                }
            }
        }
    }

    /// Reconcile our cordon belief and ownership against the observed node.
    ///
    /// While a drainable condition is active, a lost cordon is restored and a
    /// cordon someone else placed is adopted. Once no condition remains, a
    /// cordon carrying our ownership label is released; one without it is an
    /// operator's and is left strictly alone.
    async fn reconcile_cordon_ownership(&self, node: &Node, state: &mut AgentState) {
        let node_name = node::node_name(node);
        let unschedulable = node::is_unschedulable(node);
        let owned = node::has_cordon_label(node);
        debug!(
            node = %node_name,
            unschedulable,
            owned,
            state = ?*state,
            "checking for unneeded cordon"
        );

        if state.has_drainable_condition {
            if !unschedulable && state.is_cordoned {
                // The event is still imminent but the cordon went missing;
                // restore it.
                match self.node_client.cordon(node, true).await {
                    Ok(cordoned) => {
                        state.is_cordoned = cordoned;
                        info!(node = %node_name, "re-cordoned node ahead of upcoming event");
                        self.events
                            .publish(
                                node,
                                EventType::Normal,
                                REASON_CORDON,
                                format!("Node {node_name} cordoned by mechanic"),
                            )
                            .await;
                    }
                    Err(err) => {
                        error!(node = %node_name, error = %err, "failed to re-cordon node");
                        self.events
                            .publish(
                                node,
                                EventType::Warning,
                                REASON_CORDON,
                                format!("Failed to cordon node {node_name}"),
                            )
                            .await;
                    }
                }
            } else if unschedulable && !state.is_cordoned {
                debug!(node = %node_name, "node is cordoned but our state is not in sync, adopting");
                state.is_cordoned = true;
            }
            return;
        }

        if unschedulable {
            if owned {
                // Our cordon, no longer needed.
                match self.node_client.uncordon(node).await {
                    Ok(()) => {
                        state.is_cordoned = false;
                        state.should_drain = false;
                        state.is_drained = false;
                        info!(node = %node_name, "uncordoned node, no drainable condition remains");
                        self.events
                            .publish(
                                node,
                                EventType::Normal,
                                REASON_UNCORDON,
                                format!("Node {node_name} uncordoned by mechanic"),
                            )
                            .await;
                    }
                    Err(err) => {
                        error!(node = %node_name, error = %err, "failed to uncordon node");
                        self.events
                            .publish(
                                node,
                                EventType::Warning,
                                REASON_UNCORDON,
                                format!("Failed to uncordon node {node_name}"),
                            )
                            .await;
                    }
                }
            } else {
                // A cordon we did not place is not ours to release, but we
                // still benefit from it.
                info!(node = %node_name, "node is cordoned, but we aren't responsible for the cordon");
                state.is_cordoned = true;
            }
        } else if state.is_cordoned {
            debug!(node = %node_name, "node is schedulable but our state says cordoned, clearing");
            state.is_cordoned = false;
        }
    }
}
