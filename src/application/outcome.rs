//! Result of processing one delivered command.
//!
//! Handlers never touch the broker; they return an [`Outcome`] and the
//! dispatcher decides how the delivery is settled.

use thiserror::Error;

use super::repos::RepoError;
use crate::domain::commands::MalformedCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed(Effect),
    Dropped(DropReason),
    Retryable(RetryableError),
}

impl Outcome {
    /// Stable label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Processed(Effect::Created { .. }) => "created",
            Outcome::Processed(Effect::AlreadyApplied) => "already_applied",
            Outcome::Processed(Effect::Deleted { .. }) => "deleted",
            Outcome::Dropped(DropReason::Malformed(_)) => "malformed",
            Outcome::Dropped(DropReason::Poison(_)) => "poison",
            Outcome::Dropped(_) => "referent_missing",
            Outcome::Retryable(_) => "retryable",
        }
    }
}

/// What a successfully processed command changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Created { request_id: i64 },
    /// The store already holds the request (redelivered create).
    AlreadyApplied,
    Deleted { request_id: i64, slot_restored: bool },
}

/// Why a command was discarded without retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed(String),
    PostMissing,
    VolunteerMissing,
    RequestMissing,
    /// The store refused the data itself; retrying cannot help.
    Poison(String),
}

impl DropReason {
    pub fn describe(&self) -> String {
        match self {
            DropReason::Malformed(detail) => format!("malformed command: {detail}"),
            DropReason::PostMissing => "post does not exist".to_string(),
            DropReason::VolunteerMissing => "volunteer does not exist".to_string(),
            DropReason::RequestMissing => "request does not exist".to_string(),
            DropReason::Poison(detail) => format!("store rejected command: {detail}"),
        }
    }
}

impl From<MalformedCommand> for DropReason {
    fn from(err: MalformedCommand) -> Self {
        DropReason::Malformed(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryableError {
    #[error(transparent)]
    Store(#[from] RepoError),
    #[error("processing exceeded {0:?}")]
    Timeout(std::time::Duration),
}

/// Maps a store failure onto the outcome taxonomy.
pub(crate) fn classify_repo_error(err: RepoError) -> Outcome {
    if err.is_transient() {
        Outcome::Retryable(RetryableError::Store(err))
    } else {
        Outcome::Dropped(DropReason::Poison(err.to_string()))
    }
}
