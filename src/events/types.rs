//! Domain event types for live family notifications

use crate::auth::{Role, SessionIdentity};
use crate::storage::{Allowance, Transaction};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Pub/sub topic name; one per family
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn family(family_uid: Uuid) -> Self {
        Self(format!("family:{}", family_uid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which members of the family a notification is meant for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Audience {
    #[default]
    Family,
    Member {
        user: Uuid,
    },
    MemberAndParents {
        user: Uuid,
    },
    Parents,
}

impl Audience {
    pub fn includes(&self, user: Uuid, role: Role) -> bool {
        match self {
            Audience::Family => true,
            Audience::Member { user: target } => *target == user,
            Audience::MemberAndParents { user: target } => *target == user || role == Role::Parent,
            Audience::Parents => role == Role::Parent,
        }
    }
}

/// A family member as shown in notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub uid: Uuid,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationInfo {
    pub uid: Uuid,
    pub email: String,
    pub role: Role,
}

/// A purchase request raised by a child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub uid: Uuid,
    pub user_uid: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// What happened. Serialized as `{"type": "<Kind>", ...fields}`, which is
/// exactly the frame written to notification sockets.
///
/// `by` is the member who caused the change, if any; they are not notified
/// of their own action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    AllowanceUpdated {
        allowance: Allowance,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction: Option<Transaction>,
        #[serde(default)]
        by: Option<Uuid>,
    },
    FamilyMemberInvited {
        invitation: InvitationInfo,
        #[serde(default)]
        by: Option<Uuid>,
    },
    FamilyMemberAdded {
        user: MemberInfo,
        #[serde(default)]
        by: Option<Uuid>,
    },
    FamilyMemberRemoved {
        user_uid: Uuid,
        #[serde(default)]
        by: Option<Uuid>,
    },
    RequestCreated {
        request: RequestInfo,
        #[serde(default)]
        by: Option<Uuid>,
    },
    RequestGranted {
        request: RequestInfo,
        #[serde(default)]
        by: Option<Uuid>,
    },
    RequestDeclined {
        request: RequestInfo,
        #[serde(default)]
        by: Option<Uuid>,
    },
    /// Ends the addressee's live sessions (e.g. after a password change)
    Logout {},
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::AllowanceUpdated { .. } => "AllowanceUpdated",
            EventKind::FamilyMemberInvited { .. } => "FamilyMemberInvited",
            EventKind::FamilyMemberAdded { .. } => "FamilyMemberAdded",
            EventKind::FamilyMemberRemoved { .. } => "FamilyMemberRemoved",
            EventKind::RequestCreated { .. } => "RequestCreated",
            EventKind::RequestGranted { .. } => "RequestGranted",
            EventKind::RequestDeclined { .. } => "RequestDeclined",
            EventKind::Logout {} => "Logout",
        }
    }

    /// The member whose action produced this event
    pub fn initiator(&self) -> Option<Uuid> {
        match self {
            EventKind::AllowanceUpdated { by, .. }
            | EventKind::FamilyMemberInvited { by, .. }
            | EventKind::FamilyMemberAdded { by, .. }
            | EventKind::FamilyMemberRemoved { by, .. }
            | EventKind::RequestCreated { by, .. }
            | EventKind::RequestGranted { by, .. }
            | EventKind::RequestDeclined { by, .. } => *by,
            EventKind::Logout {} => None,
        }
    }

    pub fn is_logout(&self) -> bool {
        matches!(self, EventKind::Logout {})
    }
}

/// An event published on a family topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub family: Uuid,
    #[serde(default)]
    pub audience: Audience,
    pub kind: EventKind,
    /// ISO 8601 timestamp
    #[serde(default = "now_rfc3339")]
    pub timestamp: String,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl DomainEvent {
    /// Event for the whole family, stamped with the current time
    pub fn new(family: Uuid, kind: EventKind) -> Self {
        Self {
            family,
            audience: Audience::Family,
            kind,
            timestamp: now_rfc3339(),
        }
    }

    pub fn with_audience(mut self, audience: Audience) -> Self {
        self.audience = audience;
        self
    }

    pub fn topic(&self) -> Topic {
        Topic::family(self.family)
    }

    /// Whether a connection authenticated as `identity` should see this event.
    ///
    /// The initiator is left out of group audiences. An event addressed to a
    /// single member reaches that member even when they caused it.
    pub fn is_for(&self, identity: &SessionIdentity) -> bool {
        let own_action = !matches!(self.audience, Audience::Member { .. })
            && self.kind.initiator() == Some(identity.user_uid);
        identity.family_uid == self.family
            && self.audience.includes(identity.user_uid, identity.role)
            && !own_action
    }
}

/// Trait for emitting domain events after a committed mutation.
///
/// Emitting is synchronous and never fails from the caller's point of
/// view: backends log problems and carry on.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: DomainEvent);

    /// Notify a subset of a family
    fn notify(&self, family: Uuid, audience: Audience, kind: EventKind) {
        self.emit(DomainEvent::new(family, kind).with_audience(audience));
    }

    /// Force every live session of `user` closed
    fn logout(&self, family: Uuid, user: Uuid) {
        self.notify(family, Audience::Member { user }, EventKind::Logout {});
    }
}
