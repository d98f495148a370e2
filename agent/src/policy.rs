//! Drain policy decisions over scheduled event snapshots.
use snafu::{ensure, ResultExt, Snafu};
use tracing::{debug, info};

use models::config::ScheduledEventDrainConditions;

use crate::imds::{ScheduledEvent, ScheduledEventType};

/// The only signal distinguishing a memory-preserving live migration from a
/// regular freeze is this phrase in the event description. Known fragility;
/// keep the literal here and nowhere else so a richer signal has one place to
/// land.
pub const LIVE_MIGRATION_MARKER: &str = "memory-preserving Live Migration";

/// Only events against the VM itself are acted on.
const VIRTUAL_MACHINE_RESOURCE_TYPE: &str = "VirtualMachine";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InstanceNameError {
    #[snafu(display("Node name '{}' is too short to derive an instance name", node_name))]
    NodeNameTooShort { node_name: String },

    #[snafu(display("Unable to decode the instance suffix of node name '{}': '{}'", node_name, source))]
    InstanceSuffix {
        source: std::num::ParseIntError,
        node_name: String,
    },
}

/// Derive the platform's resource name for this VM from the node name: the
/// last six characters are a base-36 scale-set instance number, the rest is
/// the scale-set prefix. `test-vmss000001` names instance `test-vmss_1`.
/// This mapping is fixed by the hosting platform.
pub fn derive_instance_name(node_name: &str) -> Result<String, InstanceNameError> {
    ensure!(
        node_name.is_ascii() && node_name.len() > 6,
        NodeNameTooShortSnafu { node_name }
    );

    let (prefix, suffix) = node_name.split_at(node_name.len() - 6);
    let instance = i64::from_str_radix(suffix, 36).context(InstanceSuffixSnafu { node_name })?;

    debug!(suffix, instance, "decoded node name to resolve the scale-set instance number");
    Ok(format!("{prefix}_{instance}"))
}

/// Whether any scheduled event justifies draining this node under the given
/// policy. The first event producing a drain short-circuits.
pub fn resolve_drain(
    events: &[ScheduledEvent],
    policy: &ScheduledEventDrainConditions,
    instance: &str,
) -> bool {
    for event in events.iter().filter(|event| targets_instance(event, instance)) {
        let drain = match event.event_type {
            ScheduledEventType::Reboot => policy.reboot,
            ScheduledEventType::Redeploy => policy.redeploy,
            ScheduledEventType::Preempt => policy.preempt,
            ScheduledEventType::Terminate => policy.terminate,
            ScheduledEventType::Freeze => {
                if event.description.contains(LIVE_MIGRATION_MARKER) {
                    policy.live_migration
                } else {
                    policy.freeze
                }
            }
            ScheduledEventType::Unknown => false,
        };

        if drain {
            info!(
                event_id = %event.event_id,
                event_type = ?event.event_type,
                "found an event that requires draining the node"
            );
            return true;
        }

        debug!(
            event_id = %event.event_id,
            event_type = ?event.event_type,
            "event targets this node but does not require draining"
        );
    }

    false
}

/// Whether the scheduled events include a memory-preserving live migration of
/// this node that policy wants drained. Used on the scheduled-event fast path
/// to disambiguate freeze-vs-live-migration after the node condition has
/// already fired.
pub fn is_live_migration(
    events: &[ScheduledEvent],
    policy: &ScheduledEventDrainConditions,
    instance: &str,
) -> bool {
    policy.live_migration
        && events.iter().any(|event| {
            targets_instance(event, instance)
                && event.event_type == ScheduledEventType::Freeze
                && event.description.contains(LIVE_MIGRATION_MARKER)
        })
}

/// An event targets this node when it is a VirtualMachine event naming the
/// derived instance. Substring matching tolerates platform-side prefixing of
/// the resource names.
fn targets_instance(event: &ScheduledEvent, instance: &str) -> bool {
    event.resource_type == VIRTUAL_MACHINE_RESOURCE_TYPE
        && event
            .resources
            .iter()
            .any(|resource| resource.contains(instance))
}
