//! Domain entities mirrored from persistent storage.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{identity::VolunteerIdentity, types::RequestStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    pub id: i64,
    pub title: String,
    pub category: Option<String>,
    pub location: Option<String>,
    pub org_email: String,
    pub available_slots: i32,
}

impl PostRecord {
    pub fn is_owned_by(&self, email: &str) -> bool {
        self.org_email.trim().eq_ignore_ascii_case(email.trim())
    }

    pub fn has_open_slots(&self) -> bool {
        self.available_slots > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolunteerRecord {
    pub identity: VolunteerIdentity,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequestRecord {
    pub id: i64,
    pub post_id: i64,
    pub volunteer: VolunteerIdentity,
    pub suggestion: String,
    pub status: RequestStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}

/// Values needed to persist a new request; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSignupRequest {
    pub post_id: i64,
    pub volunteer: VolunteerIdentity,
    pub suggestion: String,
    pub requested_at: OffsetDateTime,
}

/// A volunteer's request joined with the post it targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub request_id: i64,
    pub post_id: i64,
    pub post_title: String,
    pub org_email: String,
    pub category: Option<String>,
    pub location: Option<String>,
    pub status: RequestStatus,
    pub suggestion: String,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}
