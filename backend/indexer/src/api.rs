//! Axum REST API handlers. Read-only views over the projection tables.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::db;
use crate::errors::IndexerError;
use crate::events::{CreditRecord, ProjectRecord, VerificationRecord};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/projects", get(list_projects))
        .route("/projects/:id", get(get_project))
        .route("/projects/:id/verifications", get(get_project_verifications))
        .route("/projects/:id/credits", get(get_project_credits))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ProjectsResponse {
    pub count: usize,
    pub projects: Vec<ProjectRecord>,
}

#[derive(Serialize)]
pub struct VerificationsResponse {
    pub project_id: String,
    pub count: usize,
    pub verifications: Vec<VerificationRecord>,
}

#[derive(Serialize)]
pub struct CreditsResponse {
    pub project_id: String,
    pub count: usize,
    pub credits: Vec<CreditRecord>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub time: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

fn internal_error(e: IndexerError) -> Response {
    error!("API query failed: {e}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Identifiers are stored as lowercase `0x` hex.
fn normalize_id(id: &str) -> String {
    let id = id.to_ascii_lowercase();
    if id.starts_with("0x") {
        id
    } else {
        format!("0x{id}")
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        time: Utc::now().to_rfc3339(),
    })
}

/// `GET /projects`
///
/// All indexed projects, newest registration first.
pub async fn list_projects(State(state): State<Arc<ApiState>>) -> Response {
    match db::list_projects(&state.pool).await {
        Ok(projects) => Json(ProjectsResponse {
            count: projects.len(),
            projects,
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /projects/:id`
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
) -> Response {
    let project_id = normalize_id(&project_id);
    match db::get_project(&state.pool, &project_id).await {
        Ok(Some(project)) => Json(project).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("Project {project_id} not found"),
        ),
        Err(e) => internal_error(e),
    }
}

/// `GET /projects/:id/verifications`
pub async fn get_project_verifications(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
) -> Response {
    let project_id = normalize_id(&project_id);
    match db::verifications_for_project(&state.pool, &project_id).await {
        Ok(verifications) => Json(VerificationsResponse {
            project_id,
            count: verifications.len(),
            verifications,
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /projects/:id/credits`
pub async fn get_project_credits(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<String>,
) -> Response {
    let project_id = normalize_id(&project_id);
    match db::credits_for_project(&state.pool, &project_id).await {
        Ok(credits) => Json(CreditsResponse {
            project_id,
            count: credits.len(),
            credits,
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::events::{hex_id, EventKind};
    use crate::testing::{self, id, registered};

    async fn state_with_project() -> Arc<ApiState> {
        let pool = test_pool().await;
        testing::projector(&pool)
            .handle_log(EventKind::ProjectRegistered, &registered(id(1), "ipfs://x", 100))
            .await;
        Arc::new(ApiState { pool })
    }

    #[test]
    fn ids_are_normalized_to_stored_form() {
        assert_eq!(normalize_id("0xABcd"), "0xabcd");
        assert_eq!(normalize_id("abcd"), "0xabcd");
    }

    #[tokio::test]
    async fn project_lookup_accepts_uppercase_hex() {
        let state = state_with_project().await;
        let upper = hex_id(&id(1)).to_uppercase().replacen("0X", "0x", 1);

        let found = get_project(State(state.clone()), Path(upper)).await;
        assert_eq!(found.status(), StatusCode::OK);

        let missing = get_project(State(state), Path(hex_id(&id(2)))).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_collections_are_ok() {
        let state = state_with_project().await;
        let credits = get_project_credits(State(state.clone()), Path(hex_id(&id(1)))).await;
        assert_eq!(credits.status(), StatusCode::OK);
        let listed = list_projects(State(state)).await;
        assert_eq!(listed.status(), StatusCode::OK);
    }
}
