use thiserror::Error;

/// Hard configuration-class failures.
///
/// Everything here is raised immediately and never retried: an unknown type
/// name, an invalid descriptor caught at registry build, or an operation
/// that requires configuration the type does not declare. Runtime faults
/// (executor unreachable, conflicts) are reported as result codes instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown object type `{0}`")]
    UnknownType(String),
    #[error("invalid descriptor for type `{type_name}`: {message}")]
    InvalidDescriptor { type_name: String, message: String },
    #[error("type `{0}` declares no lock columns")]
    LockNotConfigured(String),
    #[error("invalid aggregation `{name}` for type `{type_name}`: {message}")]
    InvalidAggregation {
        type_name: String,
        name: String,
        message: String,
    },
}

impl EngineError {
    pub fn invalid_descriptor(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    pub fn invalid_aggregation(
        type_name: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidAggregation {
            type_name: type_name.into(),
            name: name.into(),
            message: message.into(),
        }
    }
}
