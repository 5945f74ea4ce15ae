//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ArtifactEntry, ErrorResponse, HealthResponse, SessionSnapshot, SessionState,
        SessionSummary, ToolSummary, TranscriptEntry,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_tools,
        handlers::list_sessions,
        handlers::get_session,
    ),
    components(
        schemas(HealthResponse, ToolSummary, SessionSummary, SessionSnapshot, SessionState, TranscriptEntry, ArtifactEntry, ErrorResponse)
    ),
    tags(
        (name = "GitVoice API", description = "Inspection endpoints for the GitVoice voice relay")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/tools", get(handlers::list_tools))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_inspection_paths() {
        let doc = ApiDoc::openapi();
        for path in ["/health", "/tools", "/sessions", "/sessions/{id}"] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
