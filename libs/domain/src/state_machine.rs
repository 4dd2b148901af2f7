//! Resource State Machine: the pure allowed-transition table.
//!
//! Both the persistence gateway (rejecting anything outside the table with
//! `InvalidTransitionError`) and the orchestrator's reconciler (deciding
//! what an operation's next state is) consult this table rather than
//! hardcoding state pairs themselves.

use crate::enums::{DesiredOperation, ResourceState};

/// The in-flight state a lease moves a resource into, given its current
/// state and the operation being applied. `None` means the operation
/// cannot start from that source state.
#[must_use]
pub fn lease_target(from: ResourceState, operation: DesiredOperation) -> Option<ResourceState> {
    use DesiredOperation::{Create, Delete, Update};
    use ResourceState::{Active, Failed, Provisioning, Requested, Terminating, Updating};

    match (operation, from) {
        (Create, Requested) => Some(Provisioning),
        (Update, Active) => Some(Updating),
        (Delete, Active | Failed) => Some(Terminating),
        _ => None,
    }
}

/// The terminal state an in-flight resource moves into on completion.
/// `None` if `from` is not one of the three in-flight states.
#[must_use]
pub fn completion_target(from: ResourceState, success: bool) -> Option<ResourceState> {
    use ResourceState::{Active, Failed, Provisioning, Terminated, Terminating, Updating};

    match from {
        Provisioning | Updating => Some(if success { Active } else { Failed }),
        Terminating => Some(if success { Terminated } else { Failed }),
        _ => None,
    }
}

/// True if `from -> to` appears anywhere in the allowed-transition table: as a lease
/// target for some operation, as a completion target (success or
/// failure), or as the orphan-recovery reset back to `requested`. The
/// gateway uses this to reject anything else with `InvalidTransitionError`
/// regardless of which operation produced the target.
#[must_use]
pub fn is_allowed(from: ResourceState, to: ResourceState) -> bool {
    use DesiredOperation::{Create, Delete, Update};

    [Create, Update, Delete]
        .into_iter()
        .any(|op| lease_target(from, op) == Some(to))
        || completion_target(from, true) == Some(to)
        || completion_target(from, false) == Some(to)
        || (matches!(
            from,
            ResourceState::Provisioning | ResourceState::Updating | ResourceState::Terminating
        ) && to == ResourceState::Requested)
}
