//! Repository abstraction for requests, staff accounts, and the test catalog.
//!
//! Implementations provide the actual storage backend: `memory` for tests and
//! `sqlite` for production. The lifecycle manager is written against the
//! trait, so the state-machine rules never depend on storage details.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::lifecycle::draft::{RequestDraft, RequestPatch};
use crate::lifecycle::state::RequestStatus;
use crate::model::{ChatId, Request, RequestId, Role, StaffCode, TestCategory, User};

/// Outcome of the guarded status write.
///
/// The write only applies when the row's status still equals the status the
/// caller read, so concurrent transitions from the same prior state cannot
/// both succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The status was updated; the returned request reflects the new row.
    Updated(Request),
    /// The row's status no longer matched the expected value.
    Stale,
    /// No such request.
    NotFound,
}

/// Outcome of linking a chat identity to a staff account.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    Linked(User),
    /// The chat id is already bound to a different account.
    ChatAlreadyClaimed,
    /// No such staff account.
    NotFound,
}

/// Fields for creating a staff account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub code: StaffCode,
    pub name: String,
    pub email: String,
    pub contact: String,
    pub role: Role,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // =========================================================================
    // Requests
    // =========================================================================

    /// Persist a new request with the given initial status and timestamps.
    /// The repository assigns the id.
    async fn insert_request(
        &self,
        draft: &RequestDraft,
        status: RequestStatus,
        now: DateTime<Utc>,
    ) -> Result<Request>;

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>>;

    /// List requests, newest first, optionally filtered by assignee and
    /// status.
    async fn list_requests(
        &self,
        assigned_to: Option<&StaffCode>,
        status: Option<RequestStatus>,
    ) -> Result<Vec<Request>>;

    /// Apply a field patch. Returns the updated request, or `None` if the
    /// request does not exist. Status and assignment are untouched.
    async fn update_request_fields(
        &self,
        id: RequestId,
        patch: &RequestPatch,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Request>>;

    /// Replace the assignee. Returns the updated request, or `None` if the
    /// request does not exist.
    async fn update_assignee(
        &self,
        id: RequestId,
        assignee: &StaffCode,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Request>>;

    /// Compare-and-swap the status: the write applies only if the stored
    /// status still equals `expected`.
    async fn compare_and_set_status(
        &self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<CasOutcome>;

    /// Remove a request entirely (the delete-intent boundary). Returns false
    /// if it did not exist.
    async fn delete_request(&self, id: RequestId) -> Result<bool>;

    // =========================================================================
    // Users
    // =========================================================================

    async fn insert_user(&self, new: NewUser) -> Result<User>;

    async fn find_user_by_code(&self, code: &StaffCode) -> Result<Option<User>>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn find_user_by_chat(&self, chat_id: ChatId) -> Result<Option<User>>;

    /// Bind a chat identity to an account. Fails with `ChatAlreadyClaimed`
    /// when the chat id is bound elsewhere; re-linking the same pair is a
    /// no-op success.
    async fn link_chat_id(&self, code: &StaffCode, chat_id: ChatId) -> Result<LinkOutcome>;

    /// Flip the active flag. Returns false if no such account.
    async fn set_user_active(&self, code: &StaffCode, active: bool) -> Result<bool>;

    // =========================================================================
    // Test catalog
    // =========================================================================

    async fn upsert_test_category(&self, category: &TestCategory) -> Result<()>;

    async fn list_test_catalog(&self) -> Result<Vec<TestCategory>>;
}

/// Apply a patch to a request value. Shared by both backends so they cannot
/// drift on patch semantics.
pub(crate) fn apply_patch(request: &mut Request, patch: &RequestPatch, updated_at: DateTime<Utc>) {
    if let Some(v) = &patch.first_name {
        request.first_name = v.clone();
    }
    if let Some(v) = &patch.surname {
        request.surname = v.clone();
    }
    if let Some(v) = &patch.middle_name {
        request.middle_name = v.clone();
    }
    if let Some(v) = patch.dob {
        request.dob = v;
    }
    if let Some(v) = &patch.gender {
        request.gender = v.clone();
    }
    if let Some(v) = &patch.phone {
        request.phone = v.clone();
    }
    if let Some(v) = &patch.email {
        request.email = v.clone();
    }
    if let Some(v) = &patch.location {
        request.location = v.clone();
    }
    if let Some(v) = &patch.selected_tests {
        request.selected_tests = v.clone();
    }
    if let Some(v) = &patch.doctor_code {
        request.doctor_code = v.clone();
    }
    if let Some(v) = patch.priority {
        request.priority = v;
    }
    if let Some(v) = patch.collection_date {
        request.collection_date = v;
    }
    if let Some(v) = patch.collection_time {
        request.collection_time = v;
    }
    request.updated_at = updated_at;
}
