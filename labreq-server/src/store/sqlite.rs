//! SQLite implementation of `Repository`.
//!
//! `SqliteDb` holds a blocking `Mutex<Connection>`, so every call is run on
//! the blocking thread pool to keep the async executor unblocked.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task;

use super::{CasOutcome, LinkOutcome, NewUser, Repository};
use crate::db::SqliteDb;
use crate::lifecycle::draft::{RequestDraft, RequestPatch};
use crate::lifecycle::state::RequestStatus;
use crate::model::{ChatId, Request, RequestId, StaffCode, TestCategory, User};

pub struct SqliteRepository {
    db: Arc<SqliteDb>,
}

impl SqliteRepository {
    pub fn new(db: Arc<SqliteDb>) -> Self {
        Self { db }
    }

    async fn run<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteDb) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        task::spawn_blocking(move || operation(&db))
            .await
            .context("Blocking database task panicked")?
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn insert_request(
        &self,
        draft: &RequestDraft,
        status: RequestStatus,
        now: DateTime<Utc>,
    ) -> Result<Request> {
        let draft = draft.clone();
        self.run(move |db| db.insert_request(&draft, status, now))
            .await
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>> {
        self.run(move |db| db.get_request(id)).await
    }

    async fn list_requests(
        &self,
        assigned_to: Option<&StaffCode>,
        status: Option<RequestStatus>,
    ) -> Result<Vec<Request>> {
        let assigned_to = assigned_to.cloned();
        self.run(move |db| db.list_requests(assigned_to.as_ref(), status))
            .await
    }

    async fn update_request_fields(
        &self,
        id: RequestId,
        patch: &RequestPatch,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Request>> {
        let patch = patch.clone();
        self.run(move |db| db.update_request_fields(id, &patch, updated_at))
            .await
    }

    async fn update_assignee(
        &self,
        id: RequestId,
        assignee: &StaffCode,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Request>> {
        let assignee = assignee.clone();
        self.run(move |db| db.update_assignee(id, &assignee, updated_at))
            .await
    }

    async fn compare_and_set_status(
        &self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        self.run(move |db| db.compare_and_set_status(id, expected, next, updated_at))
            .await
    }

    async fn delete_request(&self, id: RequestId) -> Result<bool> {
        self.run(move |db| db.delete_request(id)).await
    }

    async fn insert_user(&self, new: NewUser) -> Result<User> {
        self.run(move |db| db.insert_user(&new)).await
    }

    async fn find_user_by_code(&self, code: &StaffCode) -> Result<Option<User>> {
        let code = code.clone();
        self.run(move |db| db.find_user_by_code(&code)).await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.to_string();
        self.run(move |db| db.find_user_by_email(&email)).await
    }

    async fn find_user_by_chat(&self, chat_id: ChatId) -> Result<Option<User>> {
        self.run(move |db| db.find_user_by_chat(chat_id)).await
    }

    async fn link_chat_id(&self, code: &StaffCode, chat_id: ChatId) -> Result<LinkOutcome> {
        let code = code.clone();
        self.run(move |db| db.link_chat_id(&code, chat_id)).await
    }

    async fn set_user_active(&self, code: &StaffCode, active: bool) -> Result<bool> {
        let code = code.clone();
        self.run(move |db| db.set_user_active(&code, active)).await
    }

    async fn upsert_test_category(&self, category: &TestCategory) -> Result<()> {
        let category = category.clone();
        self.run(move |db| db.upsert_test_category(&category)).await
    }

    async fn list_test_catalog(&self) -> Result<Vec<TestCategory>> {
        self.run(|db| db.list_test_catalog()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::manager::tests_support::{sample_draft, sample_phlebotomist_new};

    fn repository() -> SqliteRepository {
        let db = SqliteDb::new_in_memory().expect("should create in-memory db");
        SqliteRepository::new(Arc::new(db))
    }

    #[tokio::test]
    async fn test_request_roundtrip_through_async_wrapper() {
        let repo = repository();

        let inserted = repo
            .insert_request(&sample_draft(), RequestStatus::Pending, Utc::now())
            .await
            .unwrap();
        let loaded = repo.get_request(inserted.id).await.unwrap().unwrap();
        assert_eq!(loaded, inserted);
    }

    #[tokio::test]
    async fn test_cas_through_async_wrapper() {
        let repo = repository();
        let request = repo
            .insert_request(&sample_draft(), RequestStatus::Pending, Utc::now())
            .await
            .unwrap();

        let won = repo
            .compare_and_set_status(
                request.id,
                RequestStatus::Pending,
                RequestStatus::InProgress,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(matches!(won, CasOutcome::Updated(_)));

        let lost = repo
            .compare_and_set_status(
                request.id,
                RequestStatus::Pending,
                RequestStatus::Cancelled,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(lost, CasOutcome::Stale);
    }

    #[tokio::test]
    async fn test_user_link_through_async_wrapper() {
        let repo = repository();
        repo.insert_user(sample_phlebotomist_new("PH-1", "pat@example.com"))
            .await
            .unwrap();

        let outcome = repo
            .link_chat_id(&StaffCode::from("PH-1"), ChatId(777))
            .await
            .unwrap();
        assert!(matches!(outcome, LinkOutcome::Linked(_)));

        let user = repo.find_user_by_chat(ChatId(777)).await.unwrap().unwrap();
        assert_eq!(user.code, StaffCode::from("PH-1"));
    }
}
