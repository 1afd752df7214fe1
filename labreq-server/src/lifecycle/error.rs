//! Error vocabulary for lifecycle operations.
//!
//! Validation and authorization failures surface immediately to the caller
//! (the HTTP layer attributes them to fields, the bot renders them as short
//! replies) and are never retried. Store errors are infrastructure failures.

use std::fmt;

/// A validation failure attributed to a single input field.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }

    pub fn blank(field: &'static str) -> Self {
        Self::new(field, "must not be blank")
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Why a lifecycle operation was refused.
#[derive(Debug)]
pub enum LifecycleError {
    /// Missing or malformed input fields; nothing was written.
    ValidationFailed(Vec<FieldError>),
    /// The referenced request does not exist.
    NotFound,
    /// The staff reference does not resolve to an active phlebotomist.
    InvalidAssignee,
    /// Illegal state-machine edge, including a lost compare-and-swap race.
    InvalidTransition {
        from: super::state::RequestStatus,
        to: super::state::RequestStatus,
    },
    /// The actor lacks rights for the requested mutation.
    Unauthorized,
    /// Edit attempted on a terminal-state request.
    Immutable,
    /// Underlying store failure.
    Store(anyhow::Error),
}

impl LifecycleError {
    /// Stable machine-readable kind, shared by the HTTP and bot surfaces.
    pub fn kind_str(&self) -> &'static str {
        match self {
            LifecycleError::ValidationFailed(_) => "validation_failed",
            LifecycleError::NotFound => "not_found",
            LifecycleError::InvalidAssignee => "invalid_assignee",
            LifecycleError::InvalidTransition { .. } => "invalid_transition",
            LifecycleError::Unauthorized => "unauthorized",
            LifecycleError::Immutable => "immutable",
            LifecycleError::Store(_) => "store_error",
        }
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::ValidationFailed(fields) => {
                write!(f, "validation failed: ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", field)?;
                }
                Ok(())
            }
            LifecycleError::NotFound => write!(f, "request not found"),
            LifecycleError::InvalidAssignee => {
                write!(f, "assignee does not resolve to an active phlebotomist")
            }
            LifecycleError::InvalidTransition { from, to } => {
                write!(f, "illegal status transition {} -> {}", from, to)
            }
            LifecycleError::Unauthorized => write!(f, "not authorized for this request"),
            LifecycleError::Immutable => {
                write!(f, "request is in a terminal state and cannot be edited")
            }
            LifecycleError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<anyhow::Error> for LifecycleError {
    fn from(e: anyhow::Error) -> Self {
        LifecycleError::Store(e)
    }
}
