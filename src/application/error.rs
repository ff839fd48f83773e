use std::error::Error as StdError;

use thiserror::Error;

use crate::{application::surface::SurfaceError, infra::error::InfraError};

/// An error flattened into its message chain for reporting.
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
    Infra(#[from] InfraError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
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

    /// Process exit status, following the sysexits conventions.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Validation(_) => 65,
            AppError::Infra(InfraError::Configuration { .. }) => 78,
            AppError::Infra(InfraError::Io(_)) => 74,
            AppError::Infra(InfraError::Telemetry(_)) => 70,
            AppError::Surface(_) | AppError::Unexpected(_) => 70,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error("application::error::AppError", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::render::PipelineError;

    #[test]
    fn exit_codes_follow_error_kind() {
        assert_eq!(AppError::validation("bad").exit_code(), 65);
        assert_eq!(
            AppError::from(InfraError::configuration("missing")).exit_code(),
            78
        );
        assert_eq!(
            AppError::from(SurfaceError::from(PipelineError::Busy)).exit_code(),
            70
        );
    }

    #[test]
    fn report_collects_message_chain() {
        let error = AppError::from(InfraError::Io(std::io::Error::other("disk gone")));
        let report = error.report();
        assert_eq!(report.source, "application::error::AppError");
        assert!(report.messages[0].contains("disk gone"));
    }
}
