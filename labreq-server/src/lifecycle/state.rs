//! Status and priority enumerations and the transition rule table.
//!
//! Following the principle of "make illegal states unrepresentable", status is
//! a closed enum: no sequence of operations can produce a value outside the
//! four defined states, and every consumption site matches exhaustively.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a lab request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    /// Initial state, entered on creation.
    Pending,
    InProgress,
    /// Terminal.
    Completed,
    /// Terminal.
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::InProgress => "in-progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "in-progress" => Some(RequestStatus::InProgress),
            "completed" => Some(RequestStatus::Completed),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }

    /// Returns true for states that permit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Cancelled)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the state machine permits the transition `from -> to`.
///
/// The permitted edges are exactly:
/// pending -> in-progress, pending -> cancelled,
/// in-progress -> completed, in-progress -> pending (re-open),
/// in-progress -> cancelled.
///
/// Self-transitions are not edges; a duplicate of an already-applied
/// transition is reported the same way as any other illegal move.
pub fn can_transition(from: RequestStatus, to: RequestStatus) -> bool {
    use RequestStatus::*;

    match (from, to) {
        (Pending, InProgress) => true,
        (Pending, Cancelled) => true,
        (InProgress, Completed) => true,
        (InProgress, Pending) => true,
        (InProgress, Cancelled) => true,

        (Pending, Pending) | (Pending, Completed) => false,
        (InProgress, InProgress) => false,
        (Completed, _) | (Cancelled, _) => false,
    }
}

/// Collection priority of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Routine,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Routine => "Routine",
            Priority::Urgent => "Urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Routine" => Some(Priority::Routine),
            "Urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
