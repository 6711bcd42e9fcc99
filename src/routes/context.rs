//! Tenant context and view-as endpoints. All state is per login session.

use axum::extract::State;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use crate::app::AppState;
use crate::errors::{AppError, AppResult};
use crate::events::{self, AuditEvent, Severity};
use crate::jwt::AuthUser;
use crate::models::context::{SwitchOrganisationRequest, SwitchProjectRequest, ViewAsRequest, ViewAsResponse};
use crate::tenant::{self, ContextSnapshot, ImpersonationOverlay, SwitchOutcome};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_context))
        .route("/organisation", put(switch_organisation))
        .route("/project", put(switch_project))
        .route("/view-as", put(set_view_as).delete(clear_view_as))
}

fn applied(outcome: SwitchOutcome) -> AppResult<ContextSnapshot> {
    match outcome {
        SwitchOutcome::Applied(snapshot) => Ok(snapshot),
        SwitchOutcome::Superseded => Err(AppError::conflict("superseded by a newer context switch")),
    }
}

fn overlay_event(
    state: &AppState,
    name: &str,
    user_id: Uuid,
    organisation_id: Option<Uuid>,
    payload: serde_json::Value,
) {
    let event = AuditEvent::new(name, Some(user_id), payload)
        .with_organisation(organisation_id)
        .with_subject(user_id)
        .with_severity(Severity::Important);
    events::publish(&state.event_bus, event);
}

/// Current context, with the real roles reloaded and a stale overlay dropped.
#[utoipa::path(
    get,
    path = "/context",
    tag = "Context",
    responses((status = 200, description = "Current tenant context", body = ContextSnapshot)),
    security(("bearerAuth" = []))
)]
pub async fn get_context(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<ContextSnapshot>> {
    let shared = state.tenant(&auth).await?;
    let snapshot = match tenant::refresh(&shared, &state.context_source()).await? {
        SwitchOutcome::Applied(snapshot) => snapshot,
        // a switch is in flight; report what is there now
        SwitchOutcome::Superseded => shared.lock().await.snapshot(),
    };
    Ok(Json(snapshot))
}

#[utoipa::path(
    put,
    path = "/context/organisation",
    tag = "Context",
    request_body = SwitchOrganisationRequest,
    responses(
        (status = 200, description = "Organisation switched; project reselected, overlay cleared", body = ContextSnapshot),
        (status = 400, description = "Not an active member; previous context kept"),
        (status = 409, description = "Superseded by a newer switch")
    ),
    security(("bearerAuth" = []))
)]
pub async fn switch_organisation(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<SwitchOrganisationRequest>,
) -> AppResult<Json<ContextSnapshot>> {
    let shared = state.tenant(&auth).await?;
    let (previous_overlay, previous_org) = {
        let ctx = shared.lock().await;
        (ctx.overlay(), ctx.selection().map(|s| s.organisation_id))
    };

    let snapshot = applied(tenant::switch_organisation(&shared, &state.context_source(), payload.organisation_id).await?)?;

    if previous_overlay.is_active() {
        overlay_event(
            &state,
            "impersonation.cleared",
            auth.user_id(),
            previous_org,
            json!({ "reason": "organisation_switch", "overlay": previous_overlay }),
        );
    }

    Ok(Json(snapshot))
}

#[utoipa::path(
    put,
    path = "/context/project",
    tag = "Context",
    request_body = SwitchProjectRequest,
    responses(
        (status = 200, description = "Project switched; project overlay cleared", body = ContextSnapshot),
        (status = 400, description = "Project not visible in the current organisation"),
        (status = 409, description = "Superseded by a newer switch")
    ),
    security(("bearerAuth" = []))
)]
pub async fn switch_project(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<SwitchProjectRequest>,
) -> AppResult<Json<ContextSnapshot>> {
    let shared = state.tenant(&auth).await?;
    let snapshot = applied(tenant::switch_project(&shared, &state.context_source(), payload.project_id).await?)?;
    Ok(Json(snapshot))
}

/// Sets the view-as overlay. A request the real roles do not permit leaves the
/// overlay unchanged and reports `applied: false`.
#[utoipa::path(
    put,
    path = "/context/view-as",
    tag = "Context",
    request_body = ViewAsRequest,
    responses((status = 200, description = "Overlay applied or refused", body = ViewAsResponse)),
    security(("bearerAuth" = []))
)]
pub async fn set_view_as(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<ViewAsRequest>,
) -> AppResult<Json<ViewAsResponse>> {
    let shared = state.tenant(&auth).await?;
    // validate against current roles, not the ones loaded at login
    tenant::refresh(&shared, &state.context_source()).await?;

    let requested = ImpersonationOverlay::new(payload.org_role, payload.project_role);
    let mut ctx = shared.lock().await;
    let organisation_id = ctx.selection().map(|s| s.organisation_id);

    let response = match ctx.set_overlay(requested) {
        Ok(overlay) => {
            tracing::info!(user_id = %auth.user_id(), overlay = ?overlay, "view-as overlay set");
            overlay_event(
                &state,
                "impersonation.set",
                auth.user_id(),
                organisation_id,
                json!({ "overlay": overlay }),
            );
            ViewAsResponse {
                applied: true,
                overlay,
                reason: None,
            }
        }
        Err(rejection) => {
            tracing::warn!(
                user_id = %auth.user_id(),
                requested = ?requested,
                reason = %rejection,
                "view-as overlay refused"
            );
            overlay_event(
                &state,
                "impersonation.rejected",
                auth.user_id(),
                organisation_id,
                json!({ "requested": requested, "reason": rejection.to_string() }),
            );
            ViewAsResponse {
                applied: false,
                overlay: ctx.overlay(),
                reason: Some(rejection.to_string()),
            }
        }
    };

    Ok(Json(response))
}

#[utoipa::path(
    delete,
    path = "/context/view-as",
    tag = "Context",
    responses((status = 200, description = "Overlay cleared", body = ViewAsResponse)),
    security(("bearerAuth" = []))
)]
pub async fn clear_view_as(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<ViewAsResponse>> {
    let shared = state.tenant(&auth).await?;
    let mut ctx = shared.lock().await;
    let cleared = ctx.clear_overlay();

    if cleared.is_active() {
        overlay_event(
            &state,
            "impersonation.cleared",
            auth.user_id(),
            ctx.selection().map(|s| s.organisation_id),
            json!({ "reason": "requested", "overlay": cleared }),
        );
    }

    Ok(Json(ViewAsResponse {
        applied: true,
        overlay: ctx.overlay(),
        reason: None,
    }))
}
