//! Write-side mutations that make cached reads stale.

use crate::domain::identity::VolunteerIdentity;

/// A committed change to requests or slot counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// A new request row was persisted.
    RequestCreated {
        volunteer: VolunteerIdentity,
        post_id: i64,
    },
    /// A request row was removed, possibly handing a slot back to its post.
    RequestDeleted {
        volunteer: VolunteerIdentity,
        post_id: i64,
        org_email: Option<String>,
        slots_changed: bool,
    },
    /// An organizer approved or rejected a request.
    RequestReviewed {
        volunteer: VolunteerIdentity,
        post_id: i64,
        org_email: String,
        slots_changed: bool,
    },
}

impl Mutation {
    pub fn label(&self) -> &'static str {
        match self {
            Mutation::RequestCreated { .. } => "request_created",
            Mutation::RequestDeleted { .. } => "request_deleted",
            Mutation::RequestReviewed { .. } => "request_reviewed",
        }
    }
}
