//! Domain enums with stable string forms.
//!
//! Every enum that persists to a text column or travels in JSON exposes an
//! `as_str` / `parse` pair so the DB layer and the wire layer agree on
//! spelling. `parse` is strict: an unknown string is an error, never a
//! silent default.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum! {
    /// Who a bearer token speaks for.
    PrincipalKind {
        EndUser => "end_user",
        FirmMember => "firm_member",
        PlatformAdmin => "platform_admin",
    }
}

str_enum! {
    /// Role of a member inside exactly one firm.
    FirmRole {
        FieldAgent => "field_agent",
        TeamLeader => "team_leader",
        FirmUser => "firm_user",
        FirmSupervisor => "firm_supervisor",
        FirmAdmin => "firm_admin",
    }
}

impl FirmRole {
    /// Office staff may allocate, reassign, cancel, and hand calls to the
    /// call queue. Field roles may not.
    pub fn is_office_staff(&self) -> bool {
        matches!(
            self,
            FirmRole::FirmUser | FirmRole::FirmSupervisor | FirmRole::FirmAdmin
        )
    }
}

str_enum! {
    /// Membership role inside a user group. Exactly one `owner` exists per
    /// group at any time unless the group is being torn down.
    MembershipRole {
        Owner => "owner",
        Admin => "admin",
        Member => "member",
    }
}

str_enum! {
    /// Firm verification lifecycle. Only `approved` firms own active
    /// coverage or receive subscriptions.
    FirmVerification {
        Draft => "draft",
        Submitted => "submitted",
        UnderReview => "under_review",
        Approved => "approved",
        Rejected => "rejected",
    }
}

str_enum! {
    /// What kind of emergency a panic request asks for.
    ServiceType {
        Call => "call",
        Security => "security",
        Ambulance => "ambulance",
        Fire => "fire",
        Towing => "towing",
    }
}

str_enum! {
    /// Panic-request lifecycle. Transition legality lives in
    /// `aegis-dispatch::transitions`; this is just the vocabulary.
    RequestStatus {
        Pending => "pending",
        Allocated => "allocated",
        Accepted => "accepted",
        EnRoute => "en_route",
        Arrived => "arrived",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
    }
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Cancelled)
    }
}

str_enum! {
    /// Dispatchable-unit availability.
    ProviderStatus {
        Available => "available",
        Busy => "busy",
        Offline => "offline",
        Maintenance => "maintenance",
    }
}

str_enum! {
    /// Kind of a phone number registered on a group.
    PhoneKind {
        Individual => "individual",
        Alarm => "alarm",
        Camera => "camera",
    }
}

str_enum! {
    /// Where a GPS breadcrumb came from.
    LocationSource {
        Mobile => "mobile",
        Web => "web",
        Manual => "manual",
    }
}

str_enum! {
    /// Outbound channel for unlock OTPs.
    DeliveryChannel {
        Sms => "sms",
        Email => "email",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for s in [
            RequestStatus::Pending,
            RequestStatus::Allocated,
            RequestStatus::Accepted,
            RequestStatus::EnRoute,
            RequestStatus::Arrived,
            RequestStatus::InProgress,
            RequestStatus::Completed,
            RequestStatus::Cancelled,
        ] {
            assert_eq!(RequestStatus::parse(s.as_str()).unwrap(), s);
        }
        assert_eq!(ServiceType::parse("towing").unwrap(), ServiceType::Towing);
        assert!(ServiceType::parse("TOWING").is_err());
        assert!(RequestStatus::parse("enroute").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(!RequestStatus::Arrived.is_terminal());
    }

    #[test]
    fn office_staff_roles() {
        assert!(FirmRole::FirmAdmin.is_office_staff());
        assert!(FirmRole::FirmUser.is_office_staff());
        assert!(!FirmRole::FieldAgent.is_office_staff());
        assert!(!FirmRole::TeamLeader.is_office_staff());
    }

    #[test]
    fn serde_matches_db_spelling() {
        let j = serde_json::to_string(&RequestStatus::EnRoute).unwrap();
        assert_eq!(j, "\"en_route\"");
        let j = serde_json::to_string(&PrincipalKind::PlatformAdmin).unwrap();
        assert_eq!(j, "\"platform_admin\"");
    }
}
