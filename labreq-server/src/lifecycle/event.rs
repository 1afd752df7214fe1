//! Change events: immutable records of committed request mutations.
//!
//! Events travel over the change feed as JSON payloads, exactly as the
//! database notification channel they stand in for would carry them. The
//! relay-side parser is deliberately tolerant: unknown fields are ignored for
//! forward compatibility, while a payload missing its request id is useless
//! and gets rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::{Priority, RequestStatus};
use crate::model::{RequestId, StaffCode};

/// What kind of mutation the event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Reassigned,
    StatusChanged,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Reassigned => write!(f, "reassigned"),
            ChangeKind::StatusChanged => write!(f, "status_changed"),
        }
    }
}

/// An immutable notification describing one committed request mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_kind: ChangeKind,
    pub request_id: RequestId,
    /// The assignee at the time of the mutation (the recipient).
    pub assignee_ref: Option<StaffCode>,
    pub priority: Option<Priority>,
    /// New status; present for `status_changed` events.
    pub status: Option<RequestStatus>,
    pub emitted_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn created(
        request_id: RequestId,
        assignee: StaffCode,
        priority: Priority,
    ) -> Self {
        Self {
            event_kind: ChangeKind::Created,
            request_id,
            assignee_ref: Some(assignee),
            priority: Some(priority),
            status: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn reassigned(
        request_id: RequestId,
        new_assignee: StaffCode,
        priority: Priority,
    ) -> Self {
        Self {
            event_kind: ChangeKind::Reassigned,
            request_id,
            assignee_ref: Some(new_assignee),
            priority: Some(priority),
            status: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn status_changed(
        request_id: RequestId,
        assignee: StaffCode,
        priority: Priority,
        status: RequestStatus,
    ) -> Self {
        Self {
            event_kind: ChangeKind::StatusChanged,
            request_id,
            assignee_ref: Some(assignee),
            priority: Some(priority),
            status: Some(status),
            emitted_at: Utc::now(),
        }
    }

    /// Serialize for the change feed.
    pub fn to_payload(&self) -> String {
        // A struct of plain fields cannot fail to serialize.
        serde_json::to_string(self).expect("event serialization cannot fail")
    }

    /// A compact summary for logging (avoids dumping the whole payload).
    pub fn log_summary(&self) -> String {
        format!(
            "{} {{ request: {}, assignee: {}, priority: {} }}",
            self.event_kind,
            self.request_id,
            self.assignee_ref
                .as_ref()
                .map(|a| a.0.as_str())
                .unwrap_or("-"),
            self.priority.map(|p| p.as_str()).unwrap_or("-"),
        )
    }
}

/// Why an inbound payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Not valid JSON, an unknown event kind, or a type mismatch.
    Malformed { detail: String },
    /// Parsed, but carries no request id.
    MissingRequestId,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Malformed { detail } => write!(f, "malformed event payload: {}", detail),
            EventError::MissingRequestId => write!(f, "event payload missing request_id"),
        }
    }
}

impl std::error::Error for EventError {}

/// Lenient mirror of the wire shape, used only for parsing.
#[derive(Debug, Deserialize)]
struct WireEvent {
    event_kind: ChangeKind,
    request_id: Option<i64>,
    assignee_ref: Option<String>,
    priority: Option<Priority>,
    status: Option<RequestStatus>,
    emitted_at: Option<DateTime<Utc>>,
}

/// Parse a feed payload into a `ChangeEvent`.
///
/// Unknown top-level fields are tolerated; a missing `request_id` is not.
pub fn parse_event(payload: &str) -> Result<ChangeEvent, EventError> {
    let wire: WireEvent = serde_json::from_str(payload).map_err(|e| EventError::Malformed {
        detail: e.to_string(),
    })?;

    let request_id = wire.request_id.ok_or(EventError::MissingRequestId)?;

    Ok(ChangeEvent {
        event_kind: wire.event_kind,
        request_id: RequestId(request_id),
        assignee_ref: wire.assignee_ref.map(StaffCode),
        priority: wire.priority,
        status: wire.status,
        emitted_at: wire.emitted_at.unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let event = ChangeEvent::created(RequestId(7), StaffCode::from("PH-1"), Priority::Urgent);
        let parsed = parse_event(&event.to_payload()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_status_changed_carries_status() {
        let event = ChangeEvent::status_changed(
            RequestId(3),
            StaffCode::from("PH-2"),
            Priority::Routine,
            RequestStatus::Completed,
        );
        let parsed = parse_event(&event.to_payload()).unwrap();
        assert_eq!(parsed.status, Some(RequestStatus::Completed));
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let payload = r#"{
            "event_kind": "created",
            "request_id": 12,
            "assignee_ref": "PH-1",
            "priority": "Urgent",
            "emitted_at": "2025-06-01T10:00:00Z",
            "shard": 4,
            "source": "trigger_v2"
        }"#;

        let event = parse_event(payload).unwrap();
        assert_eq!(event.request_id, RequestId(12));
        assert_eq!(event.event_kind, ChangeKind::Created);
    }

    #[test]
    fn test_missing_request_id_is_rejected() {
        let payload = r#"{"event_kind": "created", "assignee_ref": "PH-1"}"#;
        assert_eq!(parse_event(payload), Err(EventError::MissingRequestId));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let payload = r#"{"event_kind": "archived", "request_id": 1}"#;
        assert!(matches!(
            parse_event(payload),
            Err(EventError::Malformed { .. })
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            parse_event("not json at all"),
            Err(EventError::Malformed { .. })
        ));
    }

    #[test]
    fn test_missing_optional_fields_are_tolerated() {
        // A minimal payload from an older emitter: no assignee, no timestamp.
        let payload = r#"{"event_kind": "status_changed", "request_id": 5}"#;
        let event = parse_event(payload).unwrap();
        assert_eq!(event.request_id, RequestId(5));
        assert!(event.assignee_ref.is_none());
        assert!(event.priority.is_none());
    }

    #[test]
    fn test_log_summary_is_compact() {
        let event = ChangeEvent::created(RequestId(7), StaffCode::from("PH-1"), Priority::Urgent);
        let summary = event.log_summary();
        assert!(summary.contains("created"));
        assert!(summary.contains("PH-1"));
        assert!(summary.contains("Urgent"));
    }
}
