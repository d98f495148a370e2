//! Mutable agent state, shared between the trigger source and the reconciler.
use std::sync::Arc;

use tokio::sync::Mutex;

/// The agent's belief about its node, updated only while the lock is held.
///
/// `is_cordoned` mirrors the node's unschedulable flag and is re-seeded at the
/// start of every reconcile pass; the ownership label on the node object, not
/// this struct, is the durable record of who performed a cordon.
/// `should_drain` is the policy decision for the current cycle only and is
/// never carried across passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentState {
    pub has_drainable_condition: bool,
    pub condition_is_scheduled_event: bool,
    pub is_cordoned: bool,
    pub is_drained: bool,
    pub should_drain: bool,
}

/// The state lock. Reconcile passes acquire it with `try_lock` and drop the
/// trigger on contention: the next trigger will observe whatever the current
/// pass leaves behind, so queuing is pure waste.
pub type SharedState = Arc<Mutex<AgentState>>;

pub fn shared(initial: AgentState) -> SharedState {
    Arc::new(Mutex::new(initial))
}
