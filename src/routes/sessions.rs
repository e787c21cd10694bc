//! Session management routes.
//!
//! Plain CRUD reads and writes go straight to the store. Loading a session
//! and clearing elements are relay admin hooks: they run on the relay's
//! command path so they are ordered with live websocket traffic.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use tracing::error;

use crate::services::relay::{Presence, RelayError};
use crate::services::store::StoreError;
use crate::state::{AppState, Element, Session};

#[derive(Deserialize)]
pub struct SessionNameBody {
    pub name: Option<String>,
}

fn required_name(body: &SessionNameBody) -> Result<&str, StatusCode> {
    match body.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

/// `GET /api/sessions` — list sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<Session>>, StatusCode> {
    let sessions = state
        .store
        .list_sessions()
        .await
        .map_err(store_error_to_status)?;
    Ok(Json(sessions))
}

/// `POST /api/sessions` — create a session.
pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<SessionNameBody>,
) -> Result<(StatusCode, Json<Session>), StatusCode> {
    let name = required_name(&body)?;
    let session = state
        .store
        .create_session(name)
        .await
        .map_err(store_error_to_status)?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// `PUT /api/sessions/:id` — rename a session.
pub async fn rename_session(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
    Json(body): Json<SessionNameBody>,
) -> Result<Json<Session>, StatusCode> {
    let name = required_name(&body)?;
    state
        .store
        .rename_session(session_id, name)
        .await
        .map_err(store_error_to_status)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// `GET /api/sessions/:id/elements` — stored elements in insertion order.
pub async fn list_elements(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> Result<Json<Vec<Element>>, StatusCode> {
    let elements = state
        .store
        .list_elements(session_id)
        .await
        .map_err(store_error_to_status)?;
    Ok(Json(elements))
}

/// `POST /api/sessions/:id/load` — make the session active for everyone.
pub async fn load_session(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    state
        .relay
        .load_session(session_id)
        .await
        .map_err(relay_error_to_status)?;
    Ok(Json(serde_json::json!({ "ok": true, "sessionId": session_id })))
}

/// `DELETE /api/sessions/:id/elements` — clear a session's canvas.
pub async fn clear_elements(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    state
        .relay
        .clear_session(session_id)
        .await
        .map_err(relay_error_to_status)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `GET /api/presence` — connected users and the active session.
pub async fn presence(State(state): State<AppState>) -> Result<Json<Presence>, StatusCode> {
    let presence = state
        .relay
        .presence()
        .await
        .map_err(relay_error_to_status)?;
    Ok(Json(presence))
}

pub(crate) fn store_error_to_status(err: StoreError) -> StatusCode {
    match err {
        StoreError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Database(e) => {
            error!(error = %e, "session store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        StoreError::Corrupt(msg) => {
            error!(%msg, "session store returned a corrupt row");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub(crate) fn relay_error_to_status(err: RelayError) -> StatusCode {
    match err {
        RelayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Unavailable | RelayError::EvictedOnJoin(_) | RelayError::Registry(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RelayError::Store(e) => store_error_to_status(e),
    }
}

#[cfg(test)]
#[path = "sessions_test.rs"]
mod tests;
