//! Domain records: lab requests, staff accounts, and the test catalog.
//!
//! These mirror the persisted rows. Newtypes keep the various identifier
//! strings and integers from being mixed up at call sites.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::lifecycle::state::{Priority, RequestStatus};

/// Newtype for a request's database-assigned identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Newtype for a staff member's external code, to prevent mixing with other
/// strings (emails, names).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaffCode(pub String);

impl fmt::Display for StaffCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StaffCode {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StaffCode {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype for an external messaging chat identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ChatId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Staff role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Doctor,
    Phlebotomist,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Doctor => "doctor",
            Role::Phlebotomist => "phlebotomist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "doctor" => Some(Role::Doctor),
            "phlebotomist" => Some(Role::Phlebotomist),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One lab test order, tracked through its status lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,

    // Patient demographics
    pub first_name: String,
    pub surname: String,
    pub middle_name: String,
    pub dob: NaiveDate,
    pub gender: String,
    pub phone: String,
    pub email: String,
    pub location: String,

    /// Selected tests; non-empty for any submitted request.
    pub selected_tests: Vec<String>,

    /// Optional referring-doctor code. Deprecated: carried for the record but
    /// never validated against the user registry.
    pub doctor_code: Option<StaffCode>,

    /// The assigned phlebotomist.
    pub assign_to: StaffCode,

    pub priority: Priority,
    pub collection_date: NaiveDate,
    pub collection_time: NaiveTime,

    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// Patient display name with empty parts elided.
    pub fn patient_name(&self) -> String {
        [&self.first_name, &self.middle_name, &self.surname]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A staff account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub code: StaffCode,
    pub name: String,
    pub email: String,
    pub contact: String,
    pub role: Role,
    pub active: bool,
    pub deleted: bool,
    /// External messaging identity, set once when the account is linked.
    pub chat_id: Option<ChatId>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Whether this user may be assigned new requests and receive
    /// notifications.
    pub fn can_receive_assignments(&self) -> bool {
        self.active && !self.deleted
    }
}

/// A catalog category grouping related tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCategory {
    pub category_name: String,
    pub category_description: String,
    pub available_tests: Vec<String>,
}
