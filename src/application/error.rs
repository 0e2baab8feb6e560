use std::error::Error as StdError;
use std::process::ExitCode;

use thiserror::Error;

use crate::{
    cache::{CacheError, PersistError},
    config::LoadError,
    domain::error::DomainError,
    infra::error::InfraError,
};

/// An error together with the messages of its source chain.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error("application::error::AppError", self)
    }

    /// Process exit code following the BSD `sysexits` conventions.
    pub fn exit_code(&self) -> ExitCode {
        let code: u8 = match self {
            AppError::Config(_) | AppError::Infra(InfraError::Configuration { .. }) => 78,
            AppError::Domain(DomainError::Validation { .. }) | AppError::Persist(_) => 65,
            AppError::NotFound(_) => 66,
            AppError::Infra(InfraError::Fixture { .. }) => 66,
            AppError::Infra(InfraError::Io(_)) => 74,
            AppError::Cache(CacheError::Repository(_)) => 69,
            AppError::Cache(CacheError::Cancelled) => 130,
            AppError::Infra(InfraError::Telemetry(_))
            | AppError::Domain(DomainError::Invariant { .. })
            | AppError::Cache(_)
            | AppError::Unexpected(_) => 70,
        };
        ExitCode::from(code)
    }
}
