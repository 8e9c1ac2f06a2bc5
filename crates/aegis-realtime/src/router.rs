//! Routing rules: which participants see which envelope kinds.

use uuid::Uuid;

use aegis_types::EnvelopeKind;

/// The resolved audience of one request.
#[derive(Debug, Clone, Default)]
pub struct RequestAudience {
    pub requester: Uuid,
    /// Leader + members of the assigned team while assignment holds;
    /// empty otherwise.
    pub team_participants: Vec<Uuid>,
    /// Office staff of the owning firm.
    pub office_staff: Vec<Uuid>,
    /// Platform admins explicitly subscribed to the owning firm.
    pub watching_admins: Vec<Uuid>,
}

/// Office staff follow lifecycle milestones, not the movement stream.
fn office_receives(kind: EnvelopeKind) -> bool {
    matches!(
        kind,
        EnvelopeKind::RequestCreated
            | EnvelopeKind::RequestAllocated
            | EnvelopeKind::RequestStatusUpdate
            | EnvelopeKind::Completed
            | EnvelopeKind::Cancelled
    )
}

/// Deduplicated recipient list for an envelope kind.
pub fn recipients_for(audience: &RequestAudience, kind: EnvelopeKind) -> Vec<Uuid> {
    let mut out: Vec<Uuid> = vec![audience.requester];

    for id in &audience.team_participants {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    if office_receives(kind) {
        for id in audience.office_staff.iter().chain(&audience.watching_admins) {
            if !out.contains(id) {
                out.push(*id);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audience() -> (RequestAudience, Uuid, Uuid, Uuid) {
        let requester = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let office = Uuid::new_v4();
        (
            RequestAudience {
                requester,
                team_participants: vec![agent],
                office_staff: vec![office],
                watching_admins: vec![],
            },
            requester,
            agent,
            office,
        )
    }

    #[test]
    fn requester_and_team_see_everything() {
        let (aud, requester, agent, _) = audience();
        for kind in [
            EnvelopeKind::RequestCreated,
            EnvelopeKind::LocationUpdate,
            EnvelopeKind::EtaUpdate,
            EnvelopeKind::Completed,
        ] {
            let r = recipients_for(&aud, kind);
            assert!(r.contains(&requester));
            assert!(r.contains(&agent));
        }
    }

    #[test]
    fn office_skips_movement_stream() {
        let (aud, _, _, office) = audience();
        assert!(recipients_for(&aud, EnvelopeKind::RequestCreated).contains(&office));
        assert!(recipients_for(&aud, EnvelopeKind::RequestStatusUpdate).contains(&office));
        assert!(!recipients_for(&aud, EnvelopeKind::LocationUpdate).contains(&office));
        assert!(!recipients_for(&aud, EnvelopeKind::EtaUpdate).contains(&office));
    }

    #[test]
    fn recipients_are_deduplicated() {
        let requester = Uuid::new_v4();
        let aud = RequestAudience {
            requester,
            team_participants: vec![requester],
            office_staff: vec![requester],
            watching_admins: vec![],
        };
        assert_eq!(recipients_for(&aud, EnvelopeKind::RequestCreated).len(), 1);
    }

    #[test]
    fn watching_admins_follow_office_rules() {
        let admin = Uuid::new_v4();
        let mut aud = audience().0;
        aud.watching_admins = vec![admin];
        assert!(recipients_for(&aud, EnvelopeKind::Completed).contains(&admin));
        assert!(!recipients_for(&aud, EnvelopeKind::LocationUpdate).contains(&admin));
    }
}
