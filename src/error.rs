use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),
    #[error("invalid input: {0}")]
    InputValidation(String),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

impl ResolveError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InputValidation(message.into())
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::ConsistencyViolation(message.into())
    }

    /// Fatal errors mean the graph can no longer be trusted; batches stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConsistencyViolation(_) | Self::Storage(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::ConsistencyViolation(_) => "consistency_violation",
            Self::InputValidation(_) => "invalid_input",
            Self::Storage(_) => "sqlite_error",
        }
    }
}

pub fn validate_confidence(field: &str, value: f64) -> Result<f64, ResolveError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ResolveError::invalid(format!(
            "{field} must be in [0.0, 1.0], got {value}"
        )));
    }
    Ok(value)
}
