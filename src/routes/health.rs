use axum::extract::State;
use axum::Json;
use serde::Serialize;
use sqlx::query_scalar;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::errors::AppResult;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub db_ok: bool,
    pub db_error: Option<String>,
    /// Rows in the materialised organisation grant table.
    pub org_grants: i64,
    pub authz_parity: String,
}

#[utoipa::path(
    get,
    path = "/api/health",
    tag = "Health",
    responses((status = 200, description = "Health check", body = HealthResponse))
)]
pub async fn health(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let grants = query_scalar::<_, i64>("SELECT COUNT(*) FROM org_role_grants")
        .fetch_one(&state.pool)
        .await;

    let (db_ok, db_error, org_grants) = match grants {
        Ok(count) => (true, None, count),
        Err(e) => (false, Some(e.to_string()), 0),
    };

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        db_ok,
        db_error,
        org_grants,
        authz_parity: state.authz.parity().as_str().to_string(),
    }))
}
