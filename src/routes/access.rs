use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::app::AppState;
use crate::authz::{
    Access, OrgAction, OrgResource, PolicyEvaluator, ProjectAction, ProjectResource, ResourceContext,
};
use crate::errors::{AppError, AppResult};
use crate::jwt::AuthUser;
use crate::models::access::{CapabilitiesResponse, DecideRequest, DecideResponse, OrgCapability, ProjectCapability};
use crate::tenant::gate;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/decide", post(decide))
        .route("/capabilities", get(capabilities))
}

/// Authoritative decision for the caller. The view-as overlay plays no part.
#[utoipa::path(
    post,
    path = "/access/decide",
    tag = "Access",
    request_body = DecideRequest,
    responses((status = 200, description = "Allow or deny", body = DecideResponse)),
    security(("bearerAuth" = []))
)]
pub async fn decide(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<DecideRequest>,
) -> AppResult<Json<DecideResponse>> {
    let mut ctx = ResourceContext::organisation(payload.organisation_id);
    if let Some(project_id) = payload.project_id {
        ctx = ctx.with_project(project_id);
    }

    let decision = state.authz.decide(&auth.principal(), &ctx, payload.access).await?;

    Ok(Json(DecideResponse {
        decision,
        access: payload.access.label(),
    }))
}

/// Controls to show in the current context: the intersection of what the real
/// roles and the previewed roles allow.
#[utoipa::path(
    get,
    path = "/access/capabilities",
    tag = "Access",
    responses(
        (status = 200, description = "Allowed actions per resource", body = CapabilitiesResponse),
        (status = 400, description = "No organisation selected")
    ),
    security(("bearerAuth" = []))
)]
pub async fn capabilities(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<CapabilitiesResponse>> {
    let principal = auth.principal();
    let shared = state.tenant(&auth).await?;
    let (selection, overlay) = {
        let ctx = shared.lock().await;
        (ctx.selection(), ctx.overlay())
    };
    let selection = selection.ok_or_else(|| AppError::invalid_tenant_selection("no organisation selected"))?;

    let mut ctx = ResourceContext::organisation(selection.organisation_id);
    if let Some(project_id) = selection.project_id {
        ctx = ctx.with_project(project_id);
    }
    let facts = state.cache.facts(&state.pool, principal.user_id, &ctx).await?;

    let allowed = |access: Access| {
        let state = &state;
        let ctx = &ctx;
        let facts = &facts;
        async move {
            let detail = format!("{}|{}|{:?}", principal.system_role.as_str(), access.label(), overlay);
            state
                .cache
                .decision(principal.user_id, ctx, detail, || async move {
                    Ok(gate(&principal, facts, &overlay, access))
                })
                .await
                .map(|decision| decision.is_allow())
        }
    };

    let mut organisation = Vec::new();
    for resource in OrgResource::ALL {
        let mut actions = Vec::new();
        for action in OrgAction::ALL {
            if allowed(Access::org(resource, action)).await? {
                actions.push(action);
            }
        }
        if !actions.is_empty() {
            organisation.push(OrgCapability { resource, actions });
        }
    }

    let mut project = Vec::new();
    if ctx.project_id.is_some() {
        for resource in ProjectResource::ALL {
            let mut actions = Vec::new();
            for action in ProjectAction::ALL {
                if allowed(Access::project(resource, action)).await? {
                    actions.push(action);
                }
            }
            if !actions.is_empty() {
                project.push(ProjectCapability { resource, actions });
            }
        }
    }

    let can_view_project = ctx.project_id.is_some() && allowed(Access::ProjectVisibility).await?;

    Ok(Json(CapabilitiesResponse {
        organisation_id: selection.organisation_id,
        project_id: selection.project_id,
        impersonating: overlay.is_active(),
        can_view_project,
        organisation,
        project,
    }))
}
