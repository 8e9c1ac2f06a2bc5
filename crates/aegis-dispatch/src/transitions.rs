//! The status transition table.
//!
//! `validate_transition` is the single source of truth: every mutation path
//! (handlers, timeouts, reassignment) asks it before writing. Anything the
//! table does not list is `INVALID_STATUS_TRANSITION`.

use aegis_types::{ApiError, ErrorCode, FirmRole, PrincipalKind, RequestStatus};
use uuid::Uuid;

/// Caller identity as resolved from the bearer token.
#[derive(Debug, Clone)]
pub struct Actor {
    pub principal_id: Uuid,
    pub kind: PrincipalKind,
    pub firm_id: Option<Uuid>,
    pub role: Option<FirmRole>,
}

impl Actor {
    pub fn is_office_staff(&self) -> bool {
        self.kind == PrincipalKind::FirmMember
            && self.role.map(|r| r.is_office_staff()).unwrap_or(false)
    }
}

/// Who is acting, relative to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRole {
    /// The request's authoring principal.
    Requester,
    /// Office staff of the owning firm.
    OfficeStaff,
    /// A member of the assigned team, the assigned provider's crew, or the
    /// bound call handler.
    AssignedResponder,
    /// Timeout sweeps.
    System,
}

use RequestStatus::*;
use TransitionRole::*;

fn allowed_roles(from: RequestStatus, to: RequestStatus) -> &'static [TransitionRole] {
    match (from, to) {
        (Pending, Allocated) => &[OfficeStaff],
        (Allocated, Accepted) => &[AssignedResponder],
        (Accepted, EnRoute) => &[AssignedResponder],
        (EnRoute, Arrived) => &[AssignedResponder],
        (Arrived, InProgress) => &[AssignedResponder],
        (InProgress, Completed) => &[AssignedResponder],
        (Pending, Cancelled) | (Allocated, Cancelled) => &[Requester, OfficeStaff, System],
        // Allocation timeout reverts an unaccepted request for re-dispatch.
        (Allocated, Pending) => &[System],
        _ => &[],
    }
}

pub fn validate_transition(
    from: RequestStatus,
    to: RequestStatus,
    as_role: TransitionRole,
) -> Result<(), ApiError> {
    if allowed_roles(from, to).contains(&as_role) {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorCode::InvalidStatusTransition,
            format!("cannot move {from} -> {to}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_walkable_by_responder() {
        let path = [Allocated, Accepted, EnRoute, Arrived, InProgress, Completed];
        let mut from = Pending;
        for (i, to) in path.iter().enumerate() {
            let role = if i == 0 { OfficeStaff } else { AssignedResponder };
            validate_transition(from, *to, role).unwrap();
            from = *to;
        }
    }

    #[test]
    fn skipping_states_is_forbidden() {
        assert!(validate_transition(Pending, Accepted, AssignedResponder).is_err());
        assert!(validate_transition(Allocated, Arrived, AssignedResponder).is_err());
        assert!(validate_transition(Accepted, Completed, AssignedResponder).is_err());
    }

    #[test]
    fn terminal_states_are_sticky() {
        for to in [Pending, Allocated, Accepted, EnRoute, Arrived, InProgress, Cancelled] {
            assert!(validate_transition(Completed, to, System).is_err());
            if to != Cancelled {
                assert!(validate_transition(Cancelled, to, OfficeStaff).is_err());
            }
        }
    }

    #[test]
    fn cancellation_windows() {
        validate_transition(Pending, Cancelled, Requester).unwrap();
        validate_transition(Allocated, Cancelled, System).unwrap();
        assert!(validate_transition(EnRoute, Cancelled, Requester).is_err());
        assert!(validate_transition(InProgress, Cancelled, OfficeStaff).is_err());
    }

    #[test]
    fn responder_cannot_allocate_and_office_cannot_accept() {
        assert!(validate_transition(Pending, Allocated, AssignedResponder).is_err());
        assert!(validate_transition(Allocated, Accepted, OfficeStaff).is_err());
    }

    #[test]
    fn only_the_system_reverts_allocation() {
        validate_transition(Allocated, Pending, System).unwrap();
        assert!(validate_transition(Allocated, Pending, OfficeStaff).is_err());
    }
}
