//! In-memory implementation of `Repository`.
//!
//! All state is held behind a single `RwLock`, which makes the guarded status
//! write genuinely atomic with respect to concurrent callers. State is lost on
//! restart; this backend exists for tests.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{apply_patch, CasOutcome, LinkOutcome, NewUser, Repository};
use crate::lifecycle::draft::{RequestDraft, RequestPatch};
use crate::lifecycle::state::RequestStatus;
use crate::model::{ChatId, Request, RequestId, StaffCode, TestCategory, User};

#[derive(Default)]
struct Inner {
    requests: HashMap<RequestId, Request>,
    next_request_id: i64,
    users: HashMap<StaffCode, User>,
    next_user_id: i64,
    catalog: BTreeMap<String, TestCategory>,
}

pub struct InMemoryRepository {
    inner: RwLock<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn insert_request(
        &self,
        draft: &RequestDraft,
        status: RequestStatus,
        now: DateTime<Utc>,
    ) -> Result<Request> {
        let mut inner = self.inner.write().await;
        inner.next_request_id += 1;
        let id = RequestId(inner.next_request_id);

        let request = Request {
            id,
            first_name: draft.first_name.clone(),
            surname: draft.surname.clone(),
            middle_name: draft.middle_name.clone(),
            dob: draft.dob,
            gender: draft.gender.clone(),
            phone: draft.phone.clone(),
            email: draft.email.clone(),
            location: draft.location.clone(),
            selected_tests: draft.selected_tests.clone(),
            doctor_code: draft.doctor_code.clone(),
            assign_to: draft.assign_to.clone(),
            priority: draft.priority,
            collection_date: draft.collection_date,
            collection_time: draft.collection_time,
            status,
            created_at: now,
            updated_at: now,
        };

        inner.requests.insert(id, request.clone());
        Ok(request)
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>> {
        let inner = self.inner.read().await;
        Ok(inner.requests.get(&id).cloned())
    }

    async fn list_requests(
        &self,
        assigned_to: Option<&StaffCode>,
        status: Option<RequestStatus>,
    ) -> Result<Vec<Request>> {
        let inner = self.inner.read().await;
        let mut matching: Vec<Request> = inner
            .requests
            .values()
            .filter(|r| assigned_to.map_or(true, |code| &r.assign_to == code))
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();

        // Newest first; id breaks ties for same-instant rows.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matching)
    }

    async fn update_request_fields(
        &self,
        id: RequestId,
        patch: &RequestPatch,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Request>> {
        let mut inner = self.inner.write().await;
        let Some(request) = inner.requests.get_mut(&id) else {
            return Ok(None);
        };
        apply_patch(request, patch, updated_at);
        Ok(Some(request.clone()))
    }

    async fn update_assignee(
        &self,
        id: RequestId,
        assignee: &StaffCode,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Request>> {
        let mut inner = self.inner.write().await;
        let Some(request) = inner.requests.get_mut(&id) else {
            return Ok(None);
        };
        request.assign_to = assignee.clone();
        request.updated_at = updated_at;
        Ok(Some(request.clone()))
    }

    async fn compare_and_set_status(
        &self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        let mut inner = self.inner.write().await;
        let Some(request) = inner.requests.get_mut(&id) else {
            return Ok(CasOutcome::NotFound);
        };

        if request.status != expected {
            return Ok(CasOutcome::Stale);
        }

        request.status = next;
        request.updated_at = updated_at;
        Ok(CasOutcome::Updated(request.clone()))
    }

    async fn delete_request(&self, id: RequestId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.requests.remove(&id).is_some())
    }

    async fn insert_user(&self, new: NewUser) -> Result<User> {
        let mut inner = self.inner.write().await;
        if inner.users.contains_key(&new.code) {
            anyhow::bail!("staff code {} already exists", new.code);
        }
        if inner.users.values().any(|u| u.email == new.email) {
            anyhow::bail!("email {} already exists", new.email);
        }

        inner.next_user_id += 1;
        let user = User {
            id: inner.next_user_id,
            code: new.code.clone(),
            name: new.name,
            email: new.email,
            contact: new.contact,
            role: new.role,
            active: true,
            deleted: false,
            chat_id: None,
            created_at: Utc::now(),
        };
        inner.users.insert(new.code, user.clone());
        Ok(user)
    }

    async fn find_user_by_code(&self, code: &StaffCode) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner.users.get(code).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_chat(&self, chat_id: ChatId) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.chat_id == Some(chat_id))
            .cloned())
    }

    async fn link_chat_id(&self, code: &StaffCode, chat_id: ChatId) -> Result<LinkOutcome> {
        let mut inner = self.inner.write().await;

        let claimed_elsewhere = inner
            .users
            .values()
            .any(|u| u.chat_id == Some(chat_id) && &u.code != code);
        if claimed_elsewhere {
            return Ok(LinkOutcome::ChatAlreadyClaimed);
        }

        let Some(user) = inner.users.get_mut(code) else {
            return Ok(LinkOutcome::NotFound);
        };
        user.chat_id = Some(chat_id);
        Ok(LinkOutcome::Linked(user.clone()))
    }

    async fn set_user_active(&self, code: &StaffCode, active: bool) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(user) = inner.users.get_mut(code) else {
            return Ok(false);
        };
        user.active = active;
        Ok(true)
    }

    async fn upsert_test_category(&self, category: &TestCategory) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .catalog
            .insert(category.category_name.clone(), category.clone());
        Ok(())
    }

    async fn list_test_catalog(&self) -> Result<Vec<TestCategory>> {
        let inner = self.inner.read().await;
        Ok(inner.catalog.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::manager::tests_support::{sample_draft, sample_phlebotomist_new};
    use crate::model::Role;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let repo = InMemoryRepository::new();
        let draft = sample_draft();
        let now = Utc::now();

        let a = repo
            .insert_request(&draft, RequestStatus::Pending, now)
            .await
            .unwrap();
        let b = repo
            .insert_request(&draft, RequestStatus::Pending, now)
            .await
            .unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_cas_succeeds_then_goes_stale() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        let request = repo
            .insert_request(&sample_draft(), RequestStatus::Pending, now)
            .await
            .unwrap();

        // Two callers both read Pending; the first write wins.
        let first = repo
            .compare_and_set_status(
                request.id,
                RequestStatus::Pending,
                RequestStatus::InProgress,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(matches!(first, CasOutcome::Updated(_)));

        let second = repo
            .compare_and_set_status(
                request.id,
                RequestStatus::Pending,
                RequestStatus::InProgress,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(second, CasOutcome::Stale);
    }

    #[tokio::test]
    async fn test_cas_missing_request() {
        let repo = InMemoryRepository::new();
        let outcome = repo
            .compare_and_set_status(
                RequestId(99),
                RequestStatus::Pending,
                RequestStatus::InProgress,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_list_filters_by_assignee_and_status() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();

        let mut draft_one = sample_draft();
        draft_one.assign_to = StaffCode::from("PH-1");
        let mut draft_two = sample_draft();
        draft_two.assign_to = StaffCode::from("PH-2");

        repo.insert_request(&draft_one, RequestStatus::Pending, now)
            .await
            .unwrap();
        let in_progress = repo
            .insert_request(&draft_one, RequestStatus::InProgress, now)
            .await
            .unwrap();
        repo.insert_request(&draft_two, RequestStatus::Pending, now)
            .await
            .unwrap();

        let for_one = repo
            .list_requests(Some(&StaffCode::from("PH-1")), None)
            .await
            .unwrap();
        assert_eq!(for_one.len(), 2);

        let in_progress_only = repo
            .list_requests(Some(&StaffCode::from("PH-1")), Some(RequestStatus::InProgress))
            .await
            .unwrap();
        assert_eq!(in_progress_only.len(), 1);
        assert_eq!(in_progress_only[0].id, in_progress.id);
    }

    #[tokio::test]
    async fn test_list_orders_newest_first() {
        let repo = InMemoryRepository::new();
        let draft = sample_draft();

        let older = repo
            .insert_request(
                &draft,
                RequestStatus::Pending,
                Utc::now() - chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        let newer = repo
            .insert_request(&draft, RequestStatus::Pending, Utc::now())
            .await
            .unwrap();

        let listed = repo.list_requests(None, None).await.unwrap();
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[1].id, older.id);
    }

    #[tokio::test]
    async fn test_chat_link_exclusivity() {
        let repo = InMemoryRepository::new();
        repo.insert_user(sample_phlebotomist_new("PH-1", "one@example.com"))
            .await
            .unwrap();
        repo.insert_user(sample_phlebotomist_new("PH-2", "two@example.com"))
            .await
            .unwrap();

        let first = repo
            .link_chat_id(&StaffCode::from("PH-1"), ChatId(555))
            .await
            .unwrap();
        assert!(matches!(first, LinkOutcome::Linked(_)));

        // A second account cannot claim the same chat identity.
        let second = repo
            .link_chat_id(&StaffCode::from("PH-2"), ChatId(555))
            .await
            .unwrap();
        assert_eq!(second, LinkOutcome::ChatAlreadyClaimed);

        // Re-linking the same pair is a no-op success.
        let again = repo
            .link_chat_id(&StaffCode::from("PH-1"), ChatId(555))
            .await
            .unwrap();
        assert!(matches!(again, LinkOutcome::Linked(_)));

        let found = repo.find_user_by_chat(ChatId(555)).await.unwrap().unwrap();
        assert_eq!(found.code, StaffCode::from("PH-1"));
    }

    #[tokio::test]
    async fn test_duplicate_user_code_rejected() {
        let repo = InMemoryRepository::new();
        repo.insert_user(sample_phlebotomist_new("PH-1", "one@example.com"))
            .await
            .unwrap();
        let duplicate = repo
            .insert_user(sample_phlebotomist_new("PH-1", "other@example.com"))
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_catalog_upsert_replaces() {
        let repo = InMemoryRepository::new();
        let mut category = TestCategory {
            category_name: "Haematology".to_string(),
            category_description: "Blood work".to_string(),
            available_tests: vec!["Full Blood Count [5001]".to_string()],
        };
        repo.upsert_test_category(&category).await.unwrap();

        category.available_tests.push("ESR [5002]".to_string());
        repo.upsert_test_category(&category).await.unwrap();

        let catalog = repo.list_test_catalog().await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].available_tests.len(), 2);
    }

    fn arb_status() -> impl Strategy<Value = RequestStatus> {
        prop_oneof![
            Just(RequestStatus::Pending),
            Just(RequestStatus::InProgress),
            Just(RequestStatus::Completed),
            Just(RequestStatus::Cancelled),
        ]
    }

    proptest! {
        /// Property: for any stored status and any sequence of CAS attempts,
        /// an attempt succeeds exactly when its expected status matches the
        /// value the previous successful attempt left behind. This is the
        /// invariant the "exactly one concurrent transition wins" behavior
        /// rests on.
        #[test]
        fn cas_tracks_stored_status(
            initial in arb_status(),
            attempts in proptest::collection::vec((arb_status(), arb_status()), 1..16),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let repo = InMemoryRepository::new();
                let request = repo
                    .insert_request(&sample_draft(), initial, Utc::now())
                    .await
                    .unwrap();

                let mut stored = initial;
                for (expected, next) in attempts {
                    let outcome = repo
                        .compare_and_set_status(request.id, expected, next, Utc::now())
                        .await
                        .unwrap();

                    if expected == stored {
                        assert!(matches!(outcome, CasOutcome::Updated(_)));
                        stored = next;
                    } else {
                        assert_eq!(outcome, CasOutcome::Stale);
                    }
                }

                let final_request = repo.get_request(request.id).await.unwrap().unwrap();
                assert_eq!(final_request.status, stored);
            });
        }
    }

    #[tokio::test]
    async fn test_set_user_active() {
        let repo = InMemoryRepository::new();
        repo.insert_user(NewUser {
            code: StaffCode::from("PH-9"),
            name: "Sam Roe".to_string(),
            email: "sam@example.com".to_string(),
            contact: "0700".to_string(),
            role: Role::Phlebotomist,
        })
        .await
        .unwrap();

        assert!(repo
            .set_user_active(&StaffCode::from("PH-9"), false)
            .await
            .unwrap());
        let user = repo
            .find_user_by_code(&StaffCode::from("PH-9"))
            .await
            .unwrap()
            .unwrap();
        assert!(!user.active);

        assert!(!repo
            .set_user_active(&StaffCode::from("missing"), false)
            .await
            .unwrap());
    }
}
