/// Helper macro to avoid retyping the base name of our system when creating
/// further string constants from it. When given no parameters, this returns
/// the base name of the system. When given a string literal parameter it adds
/// `.parameter` to the end.
#[macro_export]
macro_rules! mechanic_name {
    () => {
        "mechanic"
    };
    ($s:literal) => {
        concat!(mechanic_name!(), ".", $s)
    };
}

pub const MECHANIC: &str = mechanic_name!();

// Label keys
/// The label recording that mechanic cordoned the node. Its presence is the
/// only durable marker of cordon ownership across agent restarts.
pub const CORDONED_LABEL: &str = mechanic_name!("cordoned");
pub const CORDONED_LABEL_VALUE: &str = "true";

// Instance metadata service constants
pub const IMDS_SCHEDULED_EVENTS_ENDPOINT: &str =
    "http://169.254.169.254/metadata/scheduledevents";
pub const IMDS_API_VERSION: &str = "2020-07-01";

// Node condition types published by the node problem detector for
// platform-scheduled VM events. `VM_EVENT_SCHEDULED` is the catch-all set
// whenever any event is scheduled, regardless of kind.
pub const VM_EVENT_SCHEDULED: &str = "VMEventScheduled";
pub const FREEZE_SCHEDULED: &str = "FreezeScheduled";
pub const REBOOT_SCHEDULED: &str = "RebootScheduled";
pub const REDEPLOY_SCHEDULED: &str = "RedeployScheduled";
pub const PREEMPT_SCHEDULED: &str = "PreemptScheduled";
pub const TERMINATE_SCHEDULED: &str = "TerminateScheduled";

// Optional host-health condition types.
pub const KUBELET_PROBLEM: &str = "KubeletProblem";
pub const KERNEL_DEADLOCK: &str = "KernelDeadlock";
pub const FREQUENT_KUBELET_RESTART: &str = "FrequentKubeletRestart";
pub const FREQUENT_CONTAINERD_RESTART: &str = "FrequentContainerdRestart";
pub const FILE_SYSTEM_CORRUPTION_PROBLEM: &str = "FileSystemCorruptionProblem";
