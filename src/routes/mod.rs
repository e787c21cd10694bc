//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Binds the websocket relay endpoint and the session-management API under
//! a single Axum router. There is no authentication layer; connections are
//! trusted.

pub mod sessions;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// All HTTP and websocket routes.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws::handle_ws))
        .route(
            "/api/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route("/api/sessions/{id}", put(sessions::rename_session))
        .route(
            "/api/sessions/{id}/elements",
            get(sessions::list_elements).delete(sessions::clear_elements),
        )
        .route("/api/sessions/{id}/load", post(sessions::load_session))
        .route("/api/presence", get(sessions::presence))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
