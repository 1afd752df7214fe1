//! Admin HTTP surface: thin JSON handlers over the lifecycle manager.
//!
//! This is the boundary the operator UI attaches to. Handlers translate
//! between HTTP and the manager's vocabulary and contain no rules of their
//! own; authentication of the operator is the front-end's concern and is out
//! of scope here.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::lifecycle::draft::{RequestDraft, RequestPatch};
use crate::lifecycle::error::LifecycleError;
use crate::lifecycle::manager::Actor;
use crate::lifecycle::state::RequestStatus;
use crate::model::{RequestId, Role, StaffCode};
use crate::status::{service_version, StatusData};
use crate::store::NewUser;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/requests", post(create_request).get(list_requests))
        .route(
            "/requests/:id",
            get(get_request).patch(edit_request).delete(delete_request),
        )
        .route("/requests/:id/reassign", post(reassign_request))
        .route("/requests/:id/status", post(transition_request))
        .route("/users", post(create_user))
        .route("/users/:code/deactivate", post(deactivate_user))
        .with_state(state)
}

type ApiResponse = (StatusCode, Json<Value>);

async fn health() -> ApiResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "healthy", "service": "labreq" })),
    )
}

async fn status(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.manager.repository().list_requests(None, None).await {
        Ok(requests) => {
            let data = StatusData::from_requests(&requests, service_version());
            (
                StatusCode::OK,
                Json(serde_json::to_value(data).unwrap_or_else(|_| json!({}))),
            )
        }
        Err(e) => internal_error(e),
    }
}

async fn create_request(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<RequestDraft>,
) -> ApiResponse {
    match state.manager.create(draft).await {
        Ok(request) => (
            StatusCode::CREATED,
            Json(serde_json::to_value(&request).unwrap_or_else(|_| json!({}))),
        ),
        Err(e) => error_response(e),
    }
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResponse {
    match state.manager.repository().get_request(RequestId(id)).await {
        Ok(Some(request)) => (
            StatusCode::OK,
            Json(serde_json::to_value(&request).unwrap_or_else(|_| json!({}))),
        ),
        Ok(None) => error_response(LifecycleError::NotFound),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    assigned_to: Option<String>,
    status: Option<String>,
}

async fn list_requests(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResponse {
    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => match RequestStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({
                        "error": "validation_failed",
                        "message": format!("unknown status: {}", raw),
                    })),
                )
            }
        },
    };
    let assigned_to = params.assigned_to.map(StaffCode);

    match state
        .manager
        .repository()
        .list_requests(assigned_to.as_ref(), status)
        .await
    {
        Ok(requests) => (
            StatusCode::OK,
            Json(serde_json::to_value(&requests).unwrap_or_else(|_| json!([]))),
        ),
        Err(e) => internal_error(e),
    }
}

async fn edit_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<RequestPatch>,
) -> ApiResponse {
    match state.manager.edit(RequestId(id), body).await {
        Ok(request) => (
            StatusCode::OK,
            Json(serde_json::to_value(&request).unwrap_or_else(|_| json!({}))),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ReassignBody {
    assign_to: StaffCode,
}

async fn reassign_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ReassignBody>,
) -> ApiResponse {
    match state.manager.reassign(RequestId(id), body.assign_to).await {
        Ok(request) => (
            StatusCode::OK,
            Json(serde_json::to_value(&request).unwrap_or_else(|_| json!({}))),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct TransitionBody {
    /// Staff code of the caller; the front-end authenticates it.
    actor: StaffCode,
    status: RequestStatus,
}

async fn transition_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<TransitionBody>,
) -> ApiResponse {
    // The actor must resolve to a live account before the manager applies
    // its authority rules.
    let user = match state.manager.repository().find_user_by_code(&body.actor).await {
        Ok(Some(user)) if user.can_receive_assignments() || user.role == Role::Admin => user,
        Ok(_) => return error_response(LifecycleError::Unauthorized),
        Err(e) => return internal_error(e),
    };

    let actor = Actor::from_user(&user);
    match state
        .manager
        .transition_status(RequestId(id), &actor, body.status)
        .await
    {
        Ok(request) => (
            StatusCode::OK,
            Json(serde_json::to_value(&request).unwrap_or_else(|_| json!({}))),
        ),
        Err(e) => error_response(e),
    }
}

async fn delete_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResponse {
    match state.manager.delete(RequestId(id)).await {
        Ok(()) => (StatusCode::NO_CONTENT, Json(json!({}))),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct NewUserBody {
    code: StaffCode,
    name: String,
    email: String,
    contact: String,
    role: Role,
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewUserBody>,
) -> ApiResponse {
    let new = NewUser {
        code: body.code,
        name: body.name,
        email: body.email,
        contact: body.contact,
        role: body.role,
    };

    match state.manager.repository().insert_user(new).await {
        Ok(user) => (
            StatusCode::CREATED,
            Json(serde_json::to_value(&user).unwrap_or_else(|_| json!({}))),
        ),
        // Duplicate code/email surfaces as a conflict rather than a 500.
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "conflict", "message": e.to_string() })),
        ),
    }
}

async fn deactivate_user(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResponse {
    match state
        .manager
        .repository()
        .set_user_active(&StaffCode(code), false)
        .await
    {
        Ok(true) => (StatusCode::NO_CONTENT, Json(json!({}))),
        Ok(false) => error_response(LifecycleError::NotFound),
        Err(e) => internal_error(e),
    }
}

/// Map the lifecycle vocabulary onto HTTP statuses. Field-level detail rides
/// along for validation failures.
fn error_response(error: LifecycleError) -> ApiResponse {
    let status = match &error {
        LifecycleError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LifecycleError::NotFound => StatusCode::NOT_FOUND,
        LifecycleError::InvalidAssignee => StatusCode::UNPROCESSABLE_ENTITY,
        LifecycleError::InvalidTransition { .. } => StatusCode::CONFLICT,
        LifecycleError::Unauthorized => StatusCode::FORBIDDEN,
        LifecycleError::Immutable => StatusCode::CONFLICT,
        LifecycleError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut body = json!({
        "error": error.kind_str(),
        "message": error.to_string(),
    });
    if let LifecycleError::ValidationFailed(fields) = &error {
        body["fields"] = serde_json::to_value(fields).unwrap_or_else(|_| json!([]));
    }

    (status, Json(body))
}

fn internal_error(error: anyhow::Error) -> ApiResponse {
    tracing::error!("Internal error: {:#}", error);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "store_error" })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ChangeFeed;
    use crate::lifecycle::manager::tests_support::{sample_draft, sample_phlebotomist_new};
    use crate::lifecycle::LifecycleManager;
    use crate::store::{InMemoryRepository, Repository};

    async fn app_state() -> Arc<AppState> {
        let repository = Arc::new(InMemoryRepository::new()) as Arc<dyn Repository>;
        repository
            .insert_user(sample_phlebotomist_new("PH-1", "ph1@example.com"))
            .await
            .unwrap();
        let feed = ChangeFeed::new(32);
        let manager = LifecycleManager::new(repository, feed.clone());
        Arc::new(AppState {
            manager,
            feed,
            delivery_max_attempts: 3,
        })
    }

    #[tokio::test]
    async fn test_create_returns_201_with_request() {
        let state = app_state().await;
        let (status, Json(body)) =
            create_request(State(state), Json(sample_draft())).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["assign_to"], "PH-1");
    }

    #[tokio::test]
    async fn test_create_validation_failure_lists_fields() {
        let state = app_state().await;
        let mut draft = sample_draft();
        draft.first_name = String::new();
        draft.selected_tests.clear();

        let (status, Json(body)) = create_request(State(state), Json(draft)).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "validation_failed");
        let fields = body["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0]["field"], "first_name");
    }

    #[tokio::test]
    async fn test_get_missing_request_is_404() {
        let state = app_state().await;
        let (status, Json(body)) = get_request(State(state), Path(404)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_transition_maps_conflict_and_forbidden() {
        let state = app_state().await;
        let (_, Json(created)) =
            create_request(State(state.clone()), Json(sample_draft())).await;
        let id = created["id"].as_i64().unwrap();

        // Illegal edge: pending -> completed.
        let (status, Json(body)) = transition_request(
            State(state.clone()),
            Path(id),
            Json(TransitionBody {
                actor: StaffCode::from("PH-1"),
                status: RequestStatus::Completed,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_transition");

        // Unknown actor.
        let (status, Json(body)) = transition_request(
            State(state),
            Path(id),
            Json(TransitionBody {
                actor: StaffCode::from("ghost"),
                status: RequestStatus::InProgress,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn test_transition_success_updates_status() {
        let state = app_state().await;
        let (_, Json(created)) =
            create_request(State(state.clone()), Json(sample_draft())).await;
        let id = created["id"].as_i64().unwrap();

        let (status, Json(body)) = transition_request(
            State(state),
            Path(id),
            Json(TransitionBody {
                actor: StaffCode::from("PH-1"),
                status: RequestStatus::InProgress,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "in-progress");
    }

    #[tokio::test]
    async fn test_list_rejects_unknown_status_filter() {
        let state = app_state().await;
        let (status, Json(body)) = list_requests(
            State(state),
            Query(ListParams {
                assigned_to: None,
                status: Some("archived".to_string()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "validation_failed");
    }

    #[tokio::test]
    async fn test_edit_terminal_request_is_conflict() {
        let state = app_state().await;
        let (_, Json(created)) =
            create_request(State(state.clone()), Json(sample_draft())).await;
        let id = created["id"].as_i64().unwrap();

        transition_request(
            State(state.clone()),
            Path(id),
            Json(TransitionBody {
                actor: StaffCode::from("PH-1"),
                status: RequestStatus::Cancelled,
            }),
        )
        .await;

        let (status, Json(body)) = edit_request(
            State(state),
            Path(id),
            Json(RequestPatch {
                location: Some("Kilimani".to_string()),
                ..Default::default()
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "immutable");
    }

    #[tokio::test]
    async fn test_delete_then_404() {
        let state = app_state().await;
        let (_, Json(created)) =
            create_request(State(state.clone()), Json(sample_draft())).await;
        let id = created["id"].as_i64().unwrap();

        let (status, _) = delete_request(State(state.clone()), Path(id)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = get_request(State(state), Path(id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_user_conflict_on_duplicate() {
        let state = app_state().await;
        let (status, _) = create_user(
            State(state.clone()),
            Json(NewUserBody {
                code: StaffCode::from("PH-9"),
                name: "Sam".to_string(),
                email: "sam@example.com".to_string(),
                contact: "0700".to_string(),
                role: Role::Phlebotomist,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, Json(body)) = create_user(
            State(state),
            Json(NewUserBody {
                code: StaffCode::from("PH-9"),
                name: "Sam".to_string(),
                email: "other@example.com".to_string(),
                contact: "0700".to_string(),
                role: Role::Phlebotomist,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");
    }

    #[tokio::test]
    async fn test_status_summarizes_requests() {
        let state = app_state().await;
        create_request(State(state.clone()), Json(sample_draft())).await;

        let (code, Json(body)) = status(State(state)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["summary"]["total"], 1);
        assert_eq!(body["summary"]["pending"], 1);
    }
}
