use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use uuid::Uuid;

use super::ensure_visible;
use crate::app::AppState;
use crate::authz::{
    require, require_any, Access, OrgAction, OrgResource, ProjectAction, ProjectResource, ResourceContext,
};
use crate::errors::{AppError, AppResult};
use crate::events::{log_audit, RequestContext};
use crate::jwt::AuthUser;
use crate::models::project::{Project, ProjectCreateRequest, ProjectUpdateRequest};
use crate::store;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_projects).post(create_project))
        .route("/:project_id", get(get_project).put(update_project).delete(delete_project))
        .route("/:project_id/default", put(set_default_project))
}

/// Org owners and admins get every project; everyone else only those they belong to.
#[utoipa::path(
    get,
    path = "/organisations/{org_id}/projects",
    tag = "Projects",
    params(("org_id" = Uuid, Path, description = "Organisation id")),
    responses(
        (status = 200, description = "Projects visible to the caller", body = [Project]),
        (status = 404, description = "Not a member of the organisation")
    ),
    security(("bearerAuth" = []))
)]
pub async fn list_projects(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> AppResult<Json<Vec<Project>>> {
    let principal = auth.principal();
    ensure_visible(
        &state,
        &principal,
        &ResourceContext::organisation(org_id),
        Access::org(OrgResource::OrgProjects, OrgAction::View),
        "organisation",
    )
    .await?;

    let projects = state.cache.accessible_projects(&state.pool, &principal, org_id).await?;
    Ok(Json(projects.as_ref().clone()))
}

#[utoipa::path(
    post,
    path = "/organisations/{org_id}/projects",
    tag = "Projects",
    params(("org_id" = Uuid, Path, description = "Organisation id")),
    request_body = ProjectCreateRequest,
    responses(
        (status = 201, description = "Project created", body = Project),
        (status = 403, description = "Denied"),
        (status = 409, description = "Reference already used in this organisation")
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_project(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(org_id): Path<Uuid>,
    Json(payload): Json<ProjectCreateRequest>,
) -> AppResult<(StatusCode, Json<Project>)> {
    require(
        state.authz.as_ref(),
        &auth.principal(),
        &ResourceContext::organisation(org_id),
        Access::org(OrgResource::OrgProjects, OrgAction::Create),
    )
    .await?;

    let project = store::projects::create_project(&state.pool, org_id, payload).await?;
    state.cache.invalidate_organisation(org_id);

    log_audit(
        &state.event_bus,
        "created",
        Some(auth.user_id()),
        &project,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(project)))
}

#[utoipa::path(
    get,
    path = "/organisations/{org_id}/projects/{project_id}",
    tag = "Projects",
    params(
        ("org_id" = Uuid, Path, description = "Organisation id"),
        ("project_id" = Uuid, Path, description = "Project id")
    ),
    responses(
        (status = 200, description = "Project detail", body = Project),
        (status = 404, description = "Not found or not visible")
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_project(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((org_id, project_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<Project>> {
    ensure_visible(
        &state,
        &auth.principal(),
        &ResourceContext::organisation(org_id).with_project(project_id),
        Access::ProjectVisibility,
        "project",
    )
    .await?;

    let project = store::projects::get_project(&state.pool, org_id, project_id)
        .await?
        .ok_or_else(|| AppError::not_found("project not found"))?;
    Ok(Json(project))
}

#[utoipa::path(
    put,
    path = "/organisations/{org_id}/projects/{project_id}",
    tag = "Projects",
    params(
        ("org_id" = Uuid, Path, description = "Organisation id"),
        ("project_id" = Uuid, Path, description = "Project id")
    ),
    request_body = ProjectUpdateRequest,
    responses(
        (status = 200, description = "Project updated", body = Project),
        (status = 403, description = "Denied")
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_project(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, project_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<ProjectUpdateRequest>,
) -> AppResult<Json<Project>> {
    require_any(
        state.authz.as_ref(),
        &auth.principal(),
        &ResourceContext::organisation(org_id).with_project(project_id),
        &[
            Access::org(OrgResource::OrgProjects, OrgAction::Edit),
            Access::project(ProjectResource::ProjectSettings, ProjectAction::Edit),
        ],
    )
    .await?;

    let (before, after) = store::projects::update_project(&state.pool, org_id, project_id, payload).await?;
    state.cache.invalidate_organisation(org_id);

    log_audit(
        &state.event_bus,
        "updated",
        Some(auth.user_id()),
        &after,
        Some(&before),
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(Json(after))
}

#[utoipa::path(
    delete,
    path = "/organisations/{org_id}/projects/{project_id}",
    tag = "Projects",
    params(
        ("org_id" = Uuid, Path, description = "Organisation id"),
        ("project_id" = Uuid, Path, description = "Project id")
    ),
    responses(
        (status = 204, description = "Project soft deleted"),
        (status = 403, description = "Denied")
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_project(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, project_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    require(
        state.authz.as_ref(),
        &auth.principal(),
        &ResourceContext::organisation(org_id),
        Access::org(OrgResource::OrgProjects, OrgAction::Delete),
    )
    .await?;

    let deleted = store::projects::soft_delete_project(&state.pool, org_id, project_id).await?;
    state.cache.invalidate_organisation(org_id);

    log_audit(
        &state.event_bus,
        "deleted",
        Some(auth.user_id()),
        &deleted,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    put,
    path = "/organisations/{org_id}/projects/{project_id}/default",
    tag = "Projects",
    params(
        ("org_id" = Uuid, Path, description = "Organisation id"),
        ("project_id" = Uuid, Path, description = "Project id")
    ),
    responses(
        (status = 204, description = "Default project set"),
        (status = 400, description = "Not an active member of the project")
    ),
    security(("bearerAuth" = []))
)]
pub async fn set_default_project(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((org_id, project_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    if store::projects::get_project(&state.pool, org_id, project_id).await?.is_none() {
        return Err(AppError::not_found("project not found"));
    }
    store::memberships::set_default_project(&state.pool, auth.user_id(), project_id).await?;
    state.cache.invalidate_subject(auth.user_id());
    Ok(StatusCode::NO_CONTENT)
}
