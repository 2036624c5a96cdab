use thiserror::Error as ThisError;

/// Typed failures of the control plane.
///
/// Internals propagate these inside `anyhow::Error`; callers that need to
/// branch on the kind use `downcast_ref::<Error>()`.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("admission denied for environment {environment_id}: {reason}")]
    AdmissionDenied {
        environment_id: String,
        reason: String,
    },

    #[error("dispatch failed: {0}")]
    DispatchFailure(String),

    #[error("transient status query failure: {0}")]
    TransientQueryFailure(String),

    #[error("invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("logs unavailable for run {0}")]
    LogsUnavailable(String),

    #[error("idempotency key {0} was reused with a different request")]
    IdempotencyConflict(String),

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }
}

/// Looks for a typed [`Error`] anywhere in an `anyhow` chain.
pub fn find_error(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_error_through_context() {
        let err = anyhow::Error::new(Error::not_found("run", "r1")).context("loading run");
        assert_eq!(find_error(&err), Some(&Error::not_found("run", "r1")));

        let plain = anyhow::anyhow!("io error");
        assert!(find_error(&plain).is_none());
    }
}
