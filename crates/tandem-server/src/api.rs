//! Document REST API.
//!
//! Edits made here go through the session hub, so joined clients see them
//! as ordinary `change` events.

use crate::handlers::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tandem_core::{Document, DocumentStore, NewDocument, PresenceState, SyncError};
use tandem_protocol::{now_millis, ChangeEvent, ChangeType};
use tracing::{error, info};

/// User recorded on edits that do not name one.
const API_USER: &str = "api";

/// Error body shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// A user currently editing a document.
///
/// `name` carries the user id for clients that display `activeUsers[].name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUser {
    pub name: String,
    pub user_id: String,
    pub joined_at: u64,
    pub last_seen: u64,
}

impl From<PresenceState> for ActiveUser {
    fn from(state: PresenceState) -> Self {
        Self {
            name: state.user_id.clone(),
            user_id: state.user_id,
            joined_at: state.joined_at,
            last_seen: state.last_seen,
        }
    }
}

/// A document together with the users currently editing it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentView {
    #[serde(flatten)]
    pub document: Document,
    pub active_users: Vec<ActiveUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDocument {
    pub content: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Document routes, served under both `/documents` and the older `/files`.
pub fn routes() -> Router<Arc<AppState>> {
    ["/documents", "/files"]
        .into_iter()
        .fold(Router::new(), |router, base| {
            router
                .route(base, get(list_documents).post(create_document))
                .route(
                    &format!("{}/:id", base),
                    get(get_document)
                        .patch(update_document)
                        .delete(delete_document),
                )
        })
}

fn error_response(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: status.as_u16(),
            status: status.to_string(),
            error: error.into(),
        }),
    )
}

fn sync_error(e: SyncError) -> ApiError {
    let status = match e {
        SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
        _ => {
            error!(error = %e, "Document request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e.to_string())
}

fn view(state: &AppState, document: Document) -> DocumentView {
    let active_users = state
        .hub
        .presence()
        .members(&document.id)
        .into_iter()
        .map(ActiveUser::from)
        .collect();
    DocumentView {
        document,
        active_users,
    }
}

pub async fn list_documents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DocumentView>>, ApiError> {
    let documents = state.hub.store().list().await.map_err(sync_error)?;
    Ok(Json(
        documents.into_iter().map(|d| view(&state, d)).collect(),
    ))
}

pub async fn create_document(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewDocument>,
) -> Result<(StatusCode, Json<DocumentView>), ApiError> {
    let document = state.hub.store().create(request).await.map_err(sync_error)?;
    info!(document = %document.id, name = %document.name, "Document created");
    Ok((StatusCode::CREATED, Json(view(&state, document))))
}

pub async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, ApiError> {
    let document = state.hub.store().get(&id).await.map_err(sync_error)?;
    Ok(Json(view(&state, document)))
}

/// Replace a document's content and relay it to every joined connection.
pub async fn update_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateDocument>,
) -> Result<Json<DocumentView>, ApiError> {
    let user_id = request
        .user_id
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| API_USER.to_string());

    let change = ChangeEvent {
        user_id,
        document_id: id,
        content: request.content,
        timestamp: now_millis(),
        change_type: ChangeType::Update,
    };
    let applied = state.hub.edit(change).await.map_err(sync_error)?;
    crate::metrics::record_change();

    Ok(Json(view(&state, applied.document)))
}

pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .hub
        .delete_document(&id, API_USER)
        .await
        .map_err(sync_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tandem_core::ConnectionId;
    use tandem_protocol::ServerEvent;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default()))
    }

    async fn create(state: &Arc<AppState>, name: &str) -> DocumentView {
        let (status, Json(view)) =
            create_document(State(Arc::clone(state)), Json(NewDocument::named(name)))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        view
    }

    #[tokio::test]
    async fn test_create_then_list() {
        let state = state();
        let created = create(&state, "Notes").await;
        assert_eq!(created.document.name, "Notes");
        assert_eq!(created.document.revision, 0);
        assert!(created.active_users.is_empty());

        let Json(all) = list_documents(State(Arc::clone(&state))).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].document.id, created.document.id);
    }

    #[tokio::test]
    async fn test_get_unknown_document_is_404() {
        let (status, Json(body)) = get_document(State(state()), Path("missing".into()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, 404);
        assert!(body.error.contains("missing"));
    }

    #[tokio::test]
    async fn test_get_includes_active_users() {
        let state = state();
        let id = create(&state, "Notes").await.document.id;
        let conn = ConnectionId::new("c1");
        let _rx = state.hub.connect(&conn).unwrap();
        state.hub.join(&conn, &id, "alice").await.unwrap();

        let Json(view) = get_document(State(Arc::clone(&state)), Path(id))
            .await
            .unwrap();
        let users: Vec<_> = view.active_users.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(users, vec!["alice"]);
        assert_eq!(view.active_users[0].user_id, "alice");
    }

    #[tokio::test]
    async fn test_patch_relays_change_to_subscribers() {
        let state = state();
        let id = create(&state, "Notes").await.document.id;
        let conn = ConnectionId::new("c1");
        let mut rx = state.hub.connect(&conn).unwrap();
        state.hub.join(&conn, &id, "alice").await.unwrap();
        rx.try_recv().unwrap();

        let request = UpdateDocument {
            content: "from http".into(),
            user_id: None,
        };
        let Json(view) = update_document(State(Arc::clone(&state)), Path(id.clone()), Json(request))
            .await
            .unwrap();
        assert_eq!(view.document.content, "from http");
        assert_eq!(view.document.revision, 1);

        match &*rx.try_recv().unwrap() {
            ServerEvent::Change(change) => {
                assert_eq!(change.user_id, API_USER);
                assert_eq!(change.content, "from http");
            }
            other => panic!("Expected change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_document() {
        let state = state();
        let id = create(&state, "Notes").await.document.id;

        let status = delete_document(State(Arc::clone(&state)), Path(id.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = delete_document(State(Arc::clone(&state)), Path(id))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_document_view_shape() {
        let view = DocumentView {
            document: Document::new("d1", "Notes", "text"),
            active_users: Vec::new(),
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], "d1");
        assert_eq!(json["lastModified"], json["createdAt"]);
        assert!(json["activeUsers"].as_array().unwrap().is_empty());
    }

    async fn request(state: &Arc<AppState>, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = crate::handlers::app(Arc::clone(state))
            .oneshot(request)
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_files_routes_alias_documents() {
        let state = state();

        let (status, created) = request(
            &state,
            "POST",
            "/api/files",
            Body::from(r#"{"name": "Notes", "content": "hi"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();

        let conn = ConnectionId::new("c1");
        let _rx = state.hub.connect(&conn).unwrap();
        state.hub.join(&conn, &id, "alice").await.unwrap();

        let (status, fetched) = request(&state, "GET", &format!("/api/documents/{}", id), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["content"], "hi");
        assert_eq!(fetched["activeUsers"][0]["name"], "alice");

        let (status, patched) = request(
            &state,
            "PATCH",
            &format!("/api/files/{}", id),
            Body::from(r#"{"content": "edited"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["revision"], 1);

        let (status, listed) = request(&state, "GET", "/api/files", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = request(&state, "DELETE", &format!("/api/files/{}", id), Body::empty()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, missing) = request(&state, "GET", &format!("/api/files/{}", id), Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(missing["code"], 404);
    }
}
