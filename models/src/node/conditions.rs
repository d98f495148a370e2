//! Evaluation of node conditions against drain policy.
use k8s_openapi::api::core::v1::Node;
use tracing::debug;

use crate::config::{OptionalDrainConditions, ScheduledEventDrainConditions};
use crate::constants;

/// The evaluator's two-bit verdict on a node's conditions.
///
/// `drainable` means some configured condition is active; `scheduled_event`
/// refines it: the active condition is a platform-scheduled VM event rather
/// than a host-health problem. The reconciler consults the metadata service
/// only on the scheduled-event path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConditionSummary {
    pub drainable: bool,
    pub scheduled_event: bool,
}

/// Scan the node's conditions once and report whether any active condition
/// is drainable under the given policies.
///
/// `VMEventScheduled` always counts as a scheduled event so the agent still
/// triggers when the problem detector has not mapped a specific kind.
/// Conditions with status `False` or `Unknown` are ignored.
pub fn summarize_conditions(
    node: &Node,
    scheduled: &ScheduledEventDrainConditions,
    optional: &OptionalDrainConditions,
) -> ConditionSummary {
    let mut scheduled_types = vec![constants::VM_EVENT_SCHEDULED];
    scheduled_types.extend(scheduled.drainable_condition_types());
    let optional_types = optional.drainable_condition_types();

    let mut summary = ConditionSummary::default();

    let conditions = node
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_deref())
        .unwrap_or_default();

    for condition in conditions {
        if condition.status != "True" {
            continue;
        }

        let type_ = condition.type_.as_str();
        if scheduled_types.contains(&type_) {
            debug!(condition = type_, "node has an active scheduled-event condition");
            summary.drainable = true;
            summary.scheduled_event = true;
        } else if optional_types.contains(&type_) {
            debug!(condition = type_, "node has an active host-health condition");
            summary.drainable = true;
        }

        if summary.drainable && summary.scheduled_event {
            break;
        }
    }

    summary
}
