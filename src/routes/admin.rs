use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::put;
use axum::{Json, Router};
use uuid::Uuid;

use crate::app::AppState;
use crate::errors::{AppError, AppResult};
use crate::events::{log_audit, RequestContext};
use crate::jwt::AuthUser;
use crate::models::user::{SystemRoleUpdateRequest, User};
use crate::store;

pub fn routes() -> Router<AppState> {
    Router::new().route("/users/:user_id/system-role", put(set_system_role))
}

/// System administrators only.
#[utoipa::path(
    put,
    path = "/admin/users/{user_id}/system-role",
    tag = "Admin",
    params(("user_id" = Uuid, Path, description = "User id")),
    request_body = SystemRoleUpdateRequest,
    responses(
        (status = 200, description = "System role changed", body = User),
        (status = 403, description = "Caller is not a system administrator")
    ),
    security(("bearerAuth" = []))
)]
pub async fn set_system_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<SystemRoleUpdateRequest>,
) -> AppResult<Json<User>> {
    if !auth.principal().is_system_admin() {
        return Err(AppError::denied("system role changes require a system administrator"));
    }

    let (before, after) = store::users::set_system_role(&state.pool, user_id, payload.system_role).await?;
    state.cache.invalidate_subject(user_id);

    log_audit(
        &state.event_bus,
        "system_role_changed",
        Some(auth.user_id()),
        &after,
        Some(&before),
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(Json(after))
}
