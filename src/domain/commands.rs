//! Commands carried through the broker.
//!
//! Commands are immutable once built: a retry re-delivers the identical JSON
//! payload, so everything the consumer needs (including the idempotency key)
//! travels inside it.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use super::{error::DomainError, identity::VolunteerIdentity};

/// Kind of command; each kind owns a primary queue and a retry chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    Create,
    Delete,
}

impl CommandKind {
    pub const ALL: [CommandKind; 2] = [CommandKind::Create, CommandKind::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Create => "create",
            CommandKind::Delete => "delete",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic key of a logical submission: `<identity>:<post id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn for_submission(volunteer: &VolunteerIdentity, post_id: i64) -> Self {
        Self(format!("{}:{post_id}", volunteer.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reasons a delivered payload cannot be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedCommand {
    #[error("payload is not valid command JSON: {0}")]
    Json(String),
    #[error("payload is missing `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("idempotency key `{found}` does not match payload (expected `{expected}`)")]
    KeyMismatch { expected: String, found: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestCommand {
    post_id: i64,
    #[serde(rename = "volunteerIdentity")]
    volunteer: VolunteerIdentity,
    #[serde(rename = "suggestionText")]
    suggestion: String,
    #[serde(with = "time::serde::rfc3339")]
    issued_at: OffsetDateTime,
    idempotency_key: IdempotencyKey,
}

impl CreateRequestCommand {
    pub fn new(
        volunteer: VolunteerIdentity,
        post_id: i64,
        suggestion: impl Into<String>,
        issued_at: OffsetDateTime,
    ) -> Result<Self, DomainError> {
        if post_id <= 0 {
            return Err(DomainError::validation("post id must be positive"));
        }

        let idempotency_key = IdempotencyKey::for_submission(&volunteer, post_id);
        Ok(Self {
            post_id,
            volunteer,
            suggestion: suggestion.into(),
            issued_at,
            idempotency_key,
        })
    }

    pub fn post_id(&self) -> i64 {
        self.post_id
    }

    pub fn volunteer(&self) -> &VolunteerIdentity {
        &self.volunteer
    }

    pub fn suggestion(&self) -> &str {
        &self.suggestion
    }

    pub fn issued_at(&self) -> OffsetDateTime {
        self.issued_at
    }

    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.idempotency_key
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MalformedCommand> {
        let wire: CreateRequestWire = serde_json::from_slice(payload)
            .map_err(|err| MalformedCommand::Json(err.to_string()))?;

        let post_id = wire.post_id.ok_or(MalformedCommand::MissingField("postId"))?;
        if post_id <= 0 {
            return Err(MalformedCommand::InvalidField {
                field: "postId",
                reason: "must be positive".to_string(),
            });
        }

        let raw_identity = wire
            .volunteer_identity
            .ok_or(MalformedCommand::MissingField("volunteerIdentity"))?;
        let volunteer = VolunteerIdentity::parse(&raw_identity).map_err(|err| {
            MalformedCommand::InvalidField {
                field: "volunteerIdentity",
                reason: err.to_string(),
            }
        })?;
        let suggestion = wire
            .suggestion_text
            .ok_or(MalformedCommand::MissingField("suggestionText"))?;
        let issued_at = wire
            .issued_at
            .ok_or(MalformedCommand::MissingField("issuedAt"))?;
        let found = wire
            .idempotency_key
            .ok_or(MalformedCommand::MissingField("idempotencyKey"))?;

        // Identities are case-insensitive, so the key is too.
        let idempotency_key = IdempotencyKey::for_submission(&volunteer, post_id);
        if !found.trim().eq_ignore_ascii_case(idempotency_key.as_str()) {
            return Err(MalformedCommand::KeyMismatch {
                expected: idempotency_key.0,
                found,
            });
        }

        Ok(Self {
            post_id,
            volunteer,
            suggestion,
            issued_at,
            idempotency_key,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequestCommand {
    request_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    issued_at: OffsetDateTime,
}

impl DeleteRequestCommand {
    pub fn new(request_id: i64, issued_at: OffsetDateTime) -> Result<Self, DomainError> {
        if request_id <= 0 {
            return Err(DomainError::validation("request id must be positive"));
        }
        Ok(Self {
            request_id,
            issued_at,
        })
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    pub fn issued_at(&self) -> OffsetDateTime {
        self.issued_at
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MalformedCommand> {
        let wire: DeleteRequestWire = serde_json::from_slice(payload)
            .map_err(|err| MalformedCommand::Json(err.to_string()))?;

        let request_id = wire
            .request_id
            .ok_or(MalformedCommand::MissingField("requestId"))?;
        if request_id <= 0 {
            return Err(MalformedCommand::InvalidField {
                field: "requestId",
                reason: "must be positive".to_string(),
            });
        }
        let issued_at = wire
            .issued_at
            .ok_or(MalformedCommand::MissingField("issuedAt"))?;

        Ok(Self {
            request_id,
            issued_at,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequestWire {
    post_id: Option<i64>,
    volunteer_identity: Option<String>,
    suggestion_text: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    issued_at: Option<OffsetDateTime>,
    idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequestWire {
    request_id: Option<i64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    issued_at: Option<OffsetDateTime>,
}
