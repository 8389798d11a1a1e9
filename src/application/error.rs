use thiserror::Error;

use crate::{
    application::repos::RepoError, broker::BrokerError, config::LoadError,
    domain::error::DomainError, infra::error::InfraError,
};

/// Top-level failure of a `vhub` command.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code reported by the binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) | AppError::Validation(_) | AppError::Domain(_) => 2,
            AppError::Broker(_) | AppError::Repo(_) | AppError::Infra(_) => 3,
            AppError::Unexpected(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_separate_configuration_from_runtime_failures() {
        assert_eq!(AppError::validation("bad").exit_code(), 2);
        assert_eq!(AppError::from(BrokerError::Closed).exit_code(), 3);
        assert_eq!(AppError::from(RepoError::Timeout).exit_code(), 3);
        assert_eq!(AppError::unexpected("boom").exit_code(), 1);
    }
}
