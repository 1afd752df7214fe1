//! The lifecycle manager: the single authority for request mutations.
//!
//! Every operation checks all of its invariants before writing anything, so a
//! refused operation leaves the store untouched. Successful creation,
//! reassignment, and status changes each publish exactly one change event,
//! strictly after the repository write.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use super::draft::{RequestDraft, RequestPatch};
use super::error::LifecycleError;
use super::event::ChangeEvent;
use super::state::{can_transition, RequestStatus};
use crate::feed::ChangeFeed;
use crate::model::{Request, RequestId, Role, StaffCode, User};
use crate::store::{CasOutcome, Repository};

/// The identity on whose behalf a mutation is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub code: StaffCode,
    pub role: Role,
}

impl Actor {
    pub fn from_user(user: &User) -> Self {
        Self {
            code: user.code.clone(),
            role: user.role,
        }
    }

    fn may_transition(&self, request: &Request) -> bool {
        self.role == Role::Admin || self.code == request.assign_to
    }
}

#[derive(Clone)]
pub struct LifecycleManager {
    repository: Arc<dyn Repository>,
    feed: ChangeFeed,
}

impl LifecycleManager {
    pub fn new(repository: Arc<dyn Repository>, feed: ChangeFeed) -> Self {
        Self { repository, feed }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Create a request from a validated draft. On success the request is
    /// `Pending` with `created_at == updated_at`, and one `created` event is
    /// published.
    pub async fn create(&self, draft: RequestDraft) -> Result<Request, LifecycleError> {
        draft
            .validate()
            .map_err(LifecycleError::ValidationFailed)?;

        self.require_assignable(&draft.assign_to).await?;

        let now = Utc::now();
        let request = self
            .repository
            .insert_request(&draft, RequestStatus::Pending, now)
            .await?;

        info!(
            "Created request {} assigned to {} (priority {})",
            request.id, request.assign_to, request.priority
        );

        let event = ChangeEvent::created(request.id, request.assign_to.clone(), request.priority);
        self.feed.emit(event.to_payload());

        Ok(request)
    }

    /// Reassign a request to a different phlebotomist. Publishes one
    /// `reassigned` event on success.
    pub async fn reassign(
        &self,
        id: RequestId,
        new_assignee: StaffCode,
    ) -> Result<Request, LifecycleError> {
        let current = self
            .repository
            .get_request(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;

        self.require_assignable(&new_assignee).await?;

        let updated_at = next_timestamp(current.updated_at);
        let request = self
            .repository
            .update_assignee(id, &new_assignee, updated_at)
            .await?
            .ok_or(LifecycleError::NotFound)?;

        info!(
            "Reassigned request {} to {}",
            request.id, request.assign_to
        );

        let event =
            ChangeEvent::reassigned(request.id, request.assign_to.clone(), request.priority);
        self.feed.emit(event.to_payload());

        Ok(request)
    }

    /// Apply a status transition on behalf of an actor.
    ///
    /// The write is a compare-and-swap against the status read here: of two
    /// concurrent transitions from the same prior state, exactly one wins and
    /// the loser is reported as an illegal transition. Publishes one
    /// `status_changed` event on success.
    pub async fn transition_status(
        &self,
        id: RequestId,
        actor: &Actor,
        target: RequestStatus,
    ) -> Result<Request, LifecycleError> {
        let current = self
            .repository
            .get_request(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;

        if !actor.may_transition(&current) {
            return Err(LifecycleError::Unauthorized);
        }

        if !can_transition(current.status, target) {
            return Err(LifecycleError::InvalidTransition {
                from: current.status,
                to: target,
            });
        }

        let updated_at = next_timestamp(current.updated_at);
        let outcome = self
            .repository
            .compare_and_set_status(id, current.status, target, updated_at)
            .await?;

        let request = match outcome {
            CasOutcome::Updated(request) => request,
            // The row moved underneath us: a concurrent transition won.
            CasOutcome::Stale => {
                return Err(LifecycleError::InvalidTransition {
                    from: current.status,
                    to: target,
                })
            }
            CasOutcome::NotFound => return Err(LifecycleError::NotFound),
        };

        info!(
            "Request {} moved to {} by {}",
            request.id, request.status, actor.code
        );

        let event = ChangeEvent::status_changed(
            request.id,
            request.assign_to.clone(),
            request.priority,
            request.status,
        );
        self.feed.emit(event.to_payload());

        Ok(request)
    }

    /// Edit patient/appointment/test fields. Only legal while the request is
    /// pending or in progress. No event is published.
    pub async fn edit(
        &self,
        id: RequestId,
        patch: RequestPatch,
    ) -> Result<Request, LifecycleError> {
        patch
            .validate()
            .map_err(LifecycleError::ValidationFailed)?;

        let current = self
            .repository
            .get_request(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;

        if current.status.is_terminal() {
            return Err(LifecycleError::Immutable);
        }

        if patch.is_empty() {
            return Ok(current);
        }

        let updated_at = next_timestamp(current.updated_at);
        let request = self
            .repository
            .update_request_fields(id, &patch, updated_at)
            .await?
            .ok_or(LifecycleError::NotFound)?;

        info!("Edited request {}", request.id);
        Ok(request)
    }

    /// The delete-intent boundary: the request ceases to exist and no further
    /// events reference it.
    pub async fn delete(&self, id: RequestId) -> Result<(), LifecycleError> {
        let removed = self.repository.delete_request(id).await?;
        if !removed {
            return Err(LifecycleError::NotFound);
        }
        info!("Deleted request {}", id);
        Ok(())
    }

    /// List a staff member's assigned requests, optionally filtered by status.
    pub async fn list_assigned(
        &self,
        assignee: &StaffCode,
        status: Option<RequestStatus>,
    ) -> Result<Vec<Request>, LifecycleError> {
        Ok(self
            .repository
            .list_requests(Some(assignee), status)
            .await?)
    }

    async fn require_assignable(&self, code: &StaffCode) -> Result<(), LifecycleError> {
        let user = self
            .repository
            .find_user_by_code(code)
            .await?
            .ok_or(LifecycleError::InvalidAssignee)?;

        if user.role != Role::Phlebotomist || !user.can_receive_assignments() {
            return Err(LifecycleError::InvalidAssignee);
        }

        Ok(())
    }
}

/// A timestamp strictly after `prev`, even under a coarse or stepped clock.
fn next_timestamp(prev: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(prev + Duration::microseconds(1))
}


#[cfg(test)]
mod tests {
    use super::tests_support::{sample_draft, sample_phlebotomist_new};
    use super::*;
    use crate::lifecycle::event::{parse_event, ChangeKind};
    use crate::store::{InMemoryRepository, NewUser};

    struct Fixture {
        manager: LifecycleManager,
        feed: ChangeFeed,
        repository: Arc<InMemoryRepository>,
    }

    async fn fixture() -> Fixture {
        let repository = Arc::new(InMemoryRepository::new());
        repository
            .insert_user(sample_phlebotomist_new("PH-1", "ph1@example.com"))
            .await
            .unwrap();
        repository
            .insert_user(sample_phlebotomist_new("PH-2", "ph2@example.com"))
            .await
            .unwrap();
        repository
            .insert_user(NewUser {
                code: StaffCode::from("ADM-1"),
                name: "Alex Admin".to_string(),
                email: "admin@example.com".to_string(),
                contact: "0700".to_string(),
                role: Role::Admin,
            })
            .await
            .unwrap();

        let feed = ChangeFeed::new(32);
        let manager = LifecycleManager::new(repository.clone() as Arc<dyn Repository>, feed.clone());
        Fixture {
            manager,
            feed,
            repository,
        }
    }

    fn assigned_actor() -> Actor {
        Actor {
            code: StaffCode::from("PH-1"),
            role: Role::Phlebotomist,
        }
    }

    fn admin_actor() -> Actor {
        Actor {
            code: StaffCode::from("ADM-1"),
            role: Role::Admin,
        }
    }

    fn other_actor() -> Actor {
        Actor {
            code: StaffCode::from("PH-2"),
            role: Role::Phlebotomist,
        }
    }

    #[tokio::test]
    async fn test_create_persists_pending_and_emits_created() {
        let fx = fixture().await;
        let mut rx = fx.feed.subscribe();

        let request = fx.manager.create(sample_draft()).await.unwrap();

        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.created_at, request.updated_at);

        let event = parse_event(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event.event_kind, ChangeKind::Created);
        assert_eq!(event.request_id, request.id);
        assert_eq!(event.assignee_ref, Some(StaffCode::from("PH-1")));
    }

    #[tokio::test]
    async fn test_create_with_invalid_draft_writes_nothing() {
        let fx = fixture().await;

        let mut draft = sample_draft();
        draft.first_name = String::new();
        draft.selected_tests.clear();

        let err = fx.manager.create(draft).await.unwrap_err();
        let LifecycleError::ValidationFailed(fields) = err else {
            panic!("expected ValidationFailed");
        };
        assert_eq!(fields.len(), 2);

        assert!(fx
            .repository
            .list_requests(None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_unresolvable_assignee() {
        let fx = fixture().await;

        let mut draft = sample_draft();
        draft.assign_to = StaffCode::from("nobody");
        assert!(matches!(
            fx.manager.create(draft).await,
            Err(LifecycleError::InvalidAssignee)
        ));

        // An inactive phlebotomist is just as unassignable.
        fx.repository
            .set_user_active(&StaffCode::from("PH-1"), false)
            .await
            .unwrap();
        assert!(matches!(
            fx.manager.create(sample_draft()).await,
            Err(LifecycleError::InvalidAssignee)
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_non_phlebotomist_assignee() {
        let fx = fixture().await;
        let mut draft = sample_draft();
        draft.assign_to = StaffCode::from("ADM-1");
        assert!(matches!(
            fx.manager.create(draft).await,
            Err(LifecycleError::InvalidAssignee)
        ));
    }

    #[tokio::test]
    async fn test_assigned_staff_walks_the_lifecycle() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();
        let actor = assigned_actor();

        let in_progress = fx
            .manager
            .transition_status(request.id, &actor, RequestStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(in_progress.status, RequestStatus::InProgress);
        assert!(in_progress.updated_at > request.updated_at);

        let completed = fx
            .manager
            .transition_status(request.id, &actor, RequestStatus::Completed)
            .await
            .unwrap();
        assert_eq!(completed.status, RequestStatus::Completed);
        assert!(completed.updated_at > in_progress.updated_at);
    }

    #[tokio::test]
    async fn test_terminal_state_rejects_transition_and_stays_unchanged() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();
        let actor = assigned_actor();

        fx.manager
            .transition_status(request.id, &actor, RequestStatus::InProgress)
            .await
            .unwrap();
        let completed = fx
            .manager
            .transition_status(request.id, &actor, RequestStatus::Completed)
            .await
            .unwrap();

        let err = fx
            .manager
            .transition_status(request.id, &actor, RequestStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: RequestStatus::Completed,
                to: RequestStatus::Pending,
            }
        ));

        // Status and updated_at are untouched by the refused transition.
        let after = fx
            .repository
            .get_request(request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, RequestStatus::Completed);
        assert_eq!(after.updated_at, completed.updated_at);
    }

    #[tokio::test]
    async fn test_unrelated_staff_is_unauthorized() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();

        let err = fx
            .manager
            .transition_status(request.id, &other_actor(), RequestStatus::InProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Unauthorized));

        let after = fx
            .repository
            .get_request(request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_admin_override_transitions_any_request() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();

        let updated = fx
            .manager
            .transition_status(request.id, &admin_actor(), RequestStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(updated.status, RequestStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_transition_missing_request_is_not_found() {
        let fx = fixture().await;
        assert!(matches!(
            fx.manager
                .transition_status(RequestId(404), &admin_actor(), RequestStatus::InProgress)
                .await,
            Err(LifecycleError::NotFound)
        ));
    }

    /// Of two racing transitions from the same prior state, exactly one wins.
    /// The loser's CAS goes stale and is reported as an illegal transition.
    #[tokio::test]
    async fn test_concurrent_transition_race_has_one_winner() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();

        // Simulate the race at the store: both callers read Pending, the
        // second write finds the row already moved.
        let first = fx
            .repository
            .compare_and_set_status(
                request.id,
                RequestStatus::Pending,
                RequestStatus::InProgress,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(matches!(first, CasOutcome::Updated(_)));

        // The manager path for the loser maps the stale CAS to
        // InvalidTransition. (Its fresh read now sees InProgress, so the rule
        // table already refuses Pending-like duplicates.)
        let err = fx
            .manager
            .transition_status(request.id, &assigned_actor(), RequestStatus::InProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_status_change_emits_exactly_one_event() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();

        let mut rx = fx.feed.subscribe();
        fx.manager
            .transition_status(request.id, &assigned_actor(), RequestStatus::InProgress)
            .await
            .unwrap();

        let event = parse_event(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event.event_kind, ChangeKind::StatusChanged);
        assert_eq!(event.status, Some(RequestStatus::InProgress));

        // Nothing else was published.
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_reassign_validates_target_and_emits() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();

        let mut rx = fx.feed.subscribe();
        let updated = fx
            .manager
            .reassign(request.id, StaffCode::from("PH-2"))
            .await
            .unwrap();
        assert_eq!(updated.assign_to, StaffCode::from("PH-2"));
        assert!(updated.updated_at > request.updated_at);

        let event = parse_event(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event.event_kind, ChangeKind::Reassigned);
        assert_eq!(event.assignee_ref, Some(StaffCode::from("PH-2")));
    }

    #[tokio::test]
    async fn test_reassign_to_inactive_user_leaves_assignee_unchanged() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();

        fx.repository
            .set_user_active(&StaffCode::from("PH-2"), false)
            .await
            .unwrap();

        let err = fx
            .manager
            .reassign(request.id, StaffCode::from("PH-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidAssignee));

        let after = fx
            .repository
            .get_request(request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.assign_to, StaffCode::from("PH-1"));
    }

    #[tokio::test]
    async fn test_reassign_missing_request_is_not_found() {
        let fx = fixture().await;
        assert!(matches!(
            fx.manager.reassign(RequestId(404), StaffCode::from("PH-2")).await,
            Err(LifecycleError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_edit_updates_fields_and_refreshes_timestamp() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();

        let patch = RequestPatch {
            location: Some("Kilimani".to_string()),
            priority: Some(crate::lifecycle::state::Priority::Urgent),
            ..Default::default()
        };

        let updated = fx.manager.edit(request.id, patch).await.unwrap();
        assert_eq!(updated.location, "Kilimani");
        assert_eq!(updated.priority, crate::lifecycle::state::Priority::Urgent);
        assert!(updated.updated_at > request.updated_at);
        // Untouched fields survive.
        assert_eq!(updated.first_name, "Jane");
    }

    #[tokio::test]
    async fn test_edit_terminal_request_is_immutable() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();
        fx.manager
            .transition_status(request.id, &admin_actor(), RequestStatus::Cancelled)
            .await
            .unwrap();

        let patch = RequestPatch {
            location: Some("Kilimani".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            fx.manager.edit(request.id, patch).await,
            Err(LifecycleError::Immutable)
        ));

        let after = fx
            .repository
            .get_request(request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.location, "Westlands");
    }

    #[tokio::test]
    async fn test_edit_does_not_emit_events() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();

        let mut rx = fx.feed.subscribe();
        let patch = RequestPatch {
            phone: Some("0711000111".to_string()),
            ..Default::default()
        };
        fx.manager.edit(request.id, patch).await.unwrap();

        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_request() {
        let fx = fixture().await;
        let request = fx.manager.create(sample_draft()).await.unwrap();

        fx.manager.delete(request.id).await.unwrap();
        assert!(fx
            .repository
            .get_request(request.id)
            .await
            .unwrap()
            .is_none());

        assert!(matches!(
            fx.manager.delete(request.id).await,
            Err(LifecycleError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_assigned_filters_by_status() {
        let fx = fixture().await;
        let first = fx.manager.create(sample_draft()).await.unwrap();
        fx.manager.create(sample_draft()).await.unwrap();
        fx.manager
            .transition_status(first.id, &assigned_actor(), RequestStatus::InProgress)
            .await
            .unwrap();

        let pending = fx
            .manager
            .list_assigned(&StaffCode::from("PH-1"), Some(RequestStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        let all = fx
            .manager
            .list_assigned(&StaffCode::from("PH-1"), None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_next_timestamp_is_strictly_increasing() {
        let now = Utc::now();
        let next = next_timestamp(now);
        assert!(next > now);

        // Even against a timestamp in the future (clock step), strictness
        // holds.
        let future = now + Duration::seconds(60);
        assert!(next_timestamp(future) > future);
    }
}
