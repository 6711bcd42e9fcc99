//! Organisation and project rosters.
//!
//! Who may call each write is decided by the authorizer: organisation member
//! writes by the `members` row of the organisation table; project member writes
//! by `org_projects.manage` or, for project admins and supplier PMs, the
//! `team` row of the project table.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{
    require, require_any, Access, OrgAction, OrgResource, OrgRole, PolicyEvaluator, Principal, ProjectAction,
    ProjectResource, ProjectRole, ResourceContext,
};
use crate::errors::{AppError, AppResult};
use crate::events::{log_audit, RequestContext};
use crate::jwt::AuthUser;
use crate::models::membership::{
    AddOrgMemberRequest, AddProjectMemberRequest, ChangeOrgRoleRequest, ChangeProjectRoleRequest, OrgMemberView,
    OrgMembership, ProjectMemberView, ProjectMembershipRecord,
};
use crate::store;

pub fn org_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_org_members).post(add_org_member))
        .route("/:user_id", axum::routing::put(change_org_role).delete(remove_org_member))
}

pub fn project_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_project_members).post(add_project_member))
        .route("/:user_id", axum::routing::put(change_project_role).delete(remove_project_member))
}

// =============================================================================
// ORGANISATION MEMBERS
// =============================================================================

/// Granting or revoking `owner` additionally needs `members.manage`.
async fn require_owner_change(state: &AppState, principal: &Principal, ctx: &ResourceContext) -> AppResult<()> {
    require(
        state.authz.as_ref(),
        principal,
        ctx,
        Access::org(OrgResource::Members, OrgAction::Manage),
    )
    .await
}

#[utoipa::path(
    get,
    path = "/organisations/{org_id}/members",
    tag = "Members",
    params(("org_id" = Uuid, Path, description = "Organisation id")),
    responses((status = 200, description = "Active and former members", body = [OrgMemberView])),
    security(("bearerAuth" = []))
)]
pub async fn list_org_members(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> AppResult<Json<Vec<OrgMemberView>>> {
    super::ensure_visible(
        &state,
        &auth.principal(),
        &ResourceContext::organisation(org_id),
        Access::org(OrgResource::Members, OrgAction::View),
        "organisation",
    )
    .await?;

    let members = store::memberships::list_org_members(&state.pool, org_id).await?;
    Ok(Json(members))
}

#[utoipa::path(
    post,
    path = "/organisations/{org_id}/members",
    tag = "Members",
    params(("org_id" = Uuid, Path, description = "Organisation id")),
    request_body = AddOrgMemberRequest,
    responses(
        (status = 201, description = "Member added or reactivated", body = OrgMembership),
        (status = 403, description = "Denied"),
        (status = 409, description = "Already an active member")
    ),
    security(("bearerAuth" = []))
)]
pub async fn add_org_member(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(org_id): Path<Uuid>,
    Json(payload): Json<AddOrgMemberRequest>,
) -> AppResult<(StatusCode, Json<OrgMembership>)> {
    let principal = auth.principal();
    let ctx = ResourceContext::organisation(org_id);

    require(
        state.authz.as_ref(),
        &principal,
        &ctx,
        Access::org(OrgResource::Members, OrgAction::Invite),
    )
    .await?;
    if payload.org_role == OrgRole::Owner {
        require_owner_change(&state, &principal, &ctx).await?;
    }

    let membership = store::memberships::add_org_member(&state.pool, org_id, payload.user_id, payload.org_role).await?;
    state.cache.invalidate_membership(org_id, payload.user_id);

    log_audit(
        &state.event_bus,
        "added",
        Some(auth.user_id()),
        &membership,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(membership)))
}

#[utoipa::path(
    put,
    path = "/organisations/{org_id}/members/{user_id}",
    tag = "Members",
    params(
        ("org_id" = Uuid, Path, description = "Organisation id"),
        ("user_id" = Uuid, Path, description = "Member's user id")
    ),
    request_body = ChangeOrgRoleRequest,
    responses(
        (status = 200, description = "Role changed", body = OrgMembership),
        (status = 403, description = "Denied"),
        (status = 409, description = "Would demote the last owner")
    ),
    security(("bearerAuth" = []))
)]
pub async fn change_org_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<ChangeOrgRoleRequest>,
) -> AppResult<Json<OrgMembership>> {
    let principal = auth.principal();
    let ctx = ResourceContext::organisation(org_id);

    require(
        state.authz.as_ref(),
        &principal,
        &ctx,
        Access::org(OrgResource::Members, OrgAction::Edit),
    )
    .await?;

    let current = store::memberships::get_org_membership(&state.pool, user_id, org_id)
        .await?
        .filter(|m| m.is_active)
        .ok_or_else(|| AppError::not_found("membership not found"))?;
    if payload.org_role == OrgRole::Owner || current.org_role == OrgRole::Owner {
        require_owner_change(&state, &principal, &ctx).await?;
    }

    let (before, after) = store::memberships::change_org_role(&state.pool, org_id, user_id, payload.org_role).await?;
    state.cache.invalidate_membership(org_id, user_id);

    log_audit(
        &state.event_bus,
        "role_changed",
        Some(auth.user_id()),
        &after,
        Some(&before),
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(Json(after))
}

#[utoipa::path(
    delete,
    path = "/organisations/{org_id}/members/{user_id}",
    tag = "Members",
    params(
        ("org_id" = Uuid, Path, description = "Organisation id"),
        ("user_id" = Uuid, Path, description = "Member's user id")
    ),
    responses(
        (status = 204, description = "Member deactivated with their project memberships"),
        (status = 403, description = "Denied"),
        (status = 409, description = "Would remove the last owner")
    ),
    security(("bearerAuth" = []))
)]
pub async fn remove_org_member(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    let principal = auth.principal();
    let ctx = ResourceContext::organisation(org_id);

    require(
        state.authz.as_ref(),
        &principal,
        &ctx,
        Access::org(OrgResource::Members, OrgAction::Remove),
    )
    .await?;

    let before = store::memberships::get_org_membership(&state.pool, user_id, org_id)
        .await?
        .filter(|m| m.is_active)
        .ok_or_else(|| AppError::not_found("membership not found"))?;
    if before.org_role == OrgRole::Owner {
        require_owner_change(&state, &principal, &ctx).await?;
    }

    let after = store::memberships::remove_org_member(&state.pool, org_id, user_id).await?;
    state.cache.invalidate_membership(org_id, user_id);

    log_audit(
        &state.event_bus,
        "removed",
        Some(auth.user_id()),
        &after,
        Some(&before),
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// PROJECT MEMBERS
// =============================================================================

/// Project roster writes: `org_projects.manage`, or the given `team` action.
///
/// A caller authorised only through the project table may hand out roles no
/// wider than their own, and may only touch members whose current role is no
/// wider than their own.
async fn require_roster_write(
    state: &AppState,
    principal: &Principal,
    ctx: &ResourceContext,
    team_action: ProjectAction,
    granted: Option<ProjectRole>,
    target: Option<Uuid>,
) -> AppResult<()> {
    let manage = Access::org(OrgResource::OrgProjects, OrgAction::Manage);
    let team = Access::project(ProjectResource::Team, team_action);
    require_any(state.authz.as_ref(), principal, ctx, &[manage, team]).await?;

    if granted.is_none() && target.is_none() {
        return Ok(());
    }
    if state.authz.decide(principal, ctx, manage).await?.is_allow() {
        return Ok(());
    }

    let project_id = ctx
        .project_id
        .ok_or_else(|| AppError::internal("roster check without a project"))?;
    let Some(own) = state
        .cache
        .project_facts(&state.pool, principal.user_id, ctx.organisation_id, project_id)
        .await?
        .role
    else {
        return Err(AppError::denied("no project role"));
    };

    if let Some(granted) = granted {
        if !granted.is_subsumed_by(own) {
            return Err(AppError::denied(format!("cannot grant project role {granted}")));
        }
    }
    if let Some(target) = target {
        let current = store::memberships::get_project_membership(&state.pool, target, project_id)
            .await?
            .filter(|m| m.is_active)
            .map(|m| m.project_role);
        if let Some(current) = current {
            if !current.is_subsumed_by(own) {
                tracing::warn!(
                    user_id = %principal.user_id,
                    target = %target,
                    project_id = %project_id,
                    current = current.as_str(),
                    "roster write on a wider project role refused"
                );
                return Err(AppError::denied(format!("cannot modify a member holding project role {current}")));
            }
        }
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/organisations/{org_id}/projects/{project_id}/members",
    tag = "Members",
    params(
        ("org_id" = Uuid, Path, description = "Organisation id"),
        ("project_id" = Uuid, Path, description = "Project id")
    ),
    responses((status = 200, description = "Project roster", body = [ProjectMemberView])),
    security(("bearerAuth" = []))
)]
pub async fn list_project_members(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((org_id, project_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<Vec<ProjectMemberView>>> {
    let principal = auth.principal();
    let ctx = ResourceContext::organisation(org_id).with_project(project_id);

    let team = Access::project(ProjectResource::Team, ProjectAction::View);
    let manage = Access::org(OrgResource::OrgProjects, OrgAction::Manage);
    let visible = state.authz.decide(&principal, &ctx, team).await?.is_allow()
        || (state.authz.decide(&principal, &ctx, manage).await?.is_allow()
            && store::projects::get_project(&state.pool, org_id, project_id).await?.is_some());
    if !visible {
        return Err(AppError::not_found("project not found"));
    }

    let members = store::memberships::list_project_members(&state.pool, project_id).await?;
    Ok(Json(members))
}

#[utoipa::path(
    post,
    path = "/organisations/{org_id}/projects/{project_id}/members",
    tag = "Members",
    params(
        ("org_id" = Uuid, Path, description = "Organisation id"),
        ("project_id" = Uuid, Path, description = "Project id")
    ),
    request_body = AddProjectMemberRequest,
    responses(
        (status = 201, description = "Project member added", body = ProjectMembershipRecord),
        (status = 403, description = "Denied"),
        (status = 409, description = "Already an active member"),
        (status = 422, description = "User is not an active member of the organisation")
    ),
    security(("bearerAuth" = []))
)]
pub async fn add_project_member(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, project_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<AddProjectMemberRequest>,
) -> AppResult<(StatusCode, Json<ProjectMembershipRecord>)> {
    let ctx = ResourceContext::organisation(org_id).with_project(project_id);
    require_roster_write(
        &state,
        &auth.principal(),
        &ctx,
        ProjectAction::Create,
        Some(payload.project_role),
        None,
    )
    .await?;

    let record = store::memberships::add_project_member(
        &state.pool,
        org_id,
        project_id,
        payload.user_id,
        payload.project_role,
    )
    .await?;
    state.cache.invalidate_membership(org_id, payload.user_id);

    log_audit(
        &state.event_bus,
        "added",
        Some(auth.user_id()),
        &record,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(record)))
}

#[utoipa::path(
    put,
    path = "/organisations/{org_id}/projects/{project_id}/members/{user_id}",
    tag = "Members",
    params(
        ("org_id" = Uuid, Path, description = "Organisation id"),
        ("project_id" = Uuid, Path, description = "Project id"),
        ("user_id" = Uuid, Path, description = "Member's user id")
    ),
    request_body = ChangeProjectRoleRequest,
    responses(
        (status = 200, description = "Project role changed", body = ProjectMembershipRecord),
        (status = 403, description = "Denied")
    ),
    security(("bearerAuth" = []))
)]
pub async fn change_project_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, project_id, user_id)): Path<(Uuid, Uuid, Uuid)>,
    Json(payload): Json<ChangeProjectRoleRequest>,
) -> AppResult<Json<ProjectMembershipRecord>> {
    let ctx = ResourceContext::organisation(org_id).with_project(project_id);
    require_roster_write(
        &state,
        &auth.principal(),
        &ctx,
        ProjectAction::Edit,
        Some(payload.project_role),
        Some(user_id),
    )
    .await?;

    let (before, after) =
        store::memberships::change_project_role(&state.pool, org_id, project_id, user_id, payload.project_role).await?;
    state.cache.invalidate_membership(org_id, user_id);

    log_audit(
        &state.event_bus,
        "role_changed",
        Some(auth.user_id()),
        &after,
        Some(&before),
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(Json(after))
}

#[utoipa::path(
    delete,
    path = "/organisations/{org_id}/projects/{project_id}/members/{user_id}",
    tag = "Members",
    params(
        ("org_id" = Uuid, Path, description = "Organisation id"),
        ("project_id" = Uuid, Path, description = "Project id"),
        ("user_id" = Uuid, Path, description = "Member's user id")
    ),
    responses(
        (status = 204, description = "Project member deactivated"),
        (status = 403, description = "Denied")
    ),
    security(("bearerAuth" = []))
)]
pub async fn remove_project_member(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, project_id, user_id)): Path<(Uuid, Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    let ctx = ResourceContext::organisation(org_id).with_project(project_id);
    require_roster_write(
        &state,
        &auth.principal(),
        &ctx,
        ProjectAction::Delete,
        None,
        Some(user_id),
    )
    .await?;

    let record = store::memberships::remove_project_member(&state.pool, org_id, project_id, user_id).await?;
    state.cache.invalidate_membership(org_id, user_id);

    log_audit(
        &state.event_bus,
        "removed",
        Some(auth.user_id()),
        &record,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::NO_CONTENT)
}
