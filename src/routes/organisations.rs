use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use uuid::Uuid;

use super::ensure_visible;
use crate::app::AppState;
use crate::authz::{require, Access, OrgAction, OrgResource, ResourceContext};
use crate::errors::{AppError, AppResult};
use crate::events::{log_audit, RequestContext};
use crate::jwt::AuthUser;
use crate::models::organisation::{Organisation, OrganisationCreateRequest, OrganisationUpdateRequest};
use crate::store;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_organisations).post(create_organisation))
        .route(
            "/:org_id",
            get(get_organisation).put(update_organisation).delete(delete_organisation),
        )
        .route("/:org_id/default", put(set_default_organisation))
}

#[utoipa::path(
    get,
    path = "/organisations",
    tag = "Organisations",
    responses((status = 200, description = "Organisations the caller belongs to", body = [Organisation])),
    security(("bearerAuth" = []))
)]
pub async fn list_organisations(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<Vec<Organisation>>> {
    let organisations = store::organisations::list_for(&state.pool, &auth.principal()).await?;
    Ok(Json(organisations))
}

#[utoipa::path(
    post,
    path = "/organisations",
    tag = "Organisations",
    request_body = OrganisationCreateRequest,
    responses(
        (status = 201, description = "Organisation created; the caller is its owner", body = Organisation),
        (status = 403, description = "Self-service creation disabled"),
        (status = 409, description = "Slug already taken")
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_organisation(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(payload): Json<OrganisationCreateRequest>,
) -> AppResult<(StatusCode, Json<Organisation>)> {
    if !state.config.org_self_service && !auth.principal().is_system_admin() {
        return Err(AppError::denied("organisation creation is restricted to system administrators"));
    }

    let (organisation, owner) = store::organisations::create_organisation(
        &state.pool,
        auth.user_id(),
        &payload.name,
        payload.slug.as_deref(),
        payload.settings.unwrap_or_default(),
    )
    .await?;

    state.cache.invalidate_subject(auth.user_id());

    let context = RequestContext::from_headers(&headers);
    log_audit(&state.event_bus, "created", Some(auth.user_id()), &organisation, None, Some(context.clone()));
    log_audit(&state.event_bus, "added", Some(auth.user_id()), &owner, None, Some(context));

    Ok((StatusCode::CREATED, Json(organisation)))
}

#[utoipa::path(
    get,
    path = "/organisations/{org_id}",
    tag = "Organisations",
    params(("org_id" = Uuid, Path, description = "Organisation id")),
    responses(
        (status = 200, description = "Organisation detail", body = Organisation),
        (status = 404, description = "Not found or not a member")
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_organisation(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> AppResult<Json<Organisation>> {
    let ctx = ResourceContext::organisation(org_id);
    ensure_visible(
        &state,
        &auth.principal(),
        &ctx,
        Access::org(OrgResource::Organisation, OrgAction::View),
        "organisation",
    )
    .await?;

    let organisation = store::organisations::get_organisation(&state.pool, org_id)
        .await?
        .ok_or_else(|| AppError::not_found("organisation not found"))?;
    Ok(Json(organisation))
}

/// Name and activation need `organisation.edit`; settings need `settings.edit`.
#[utoipa::path(
    put,
    path = "/organisations/{org_id}",
    tag = "Organisations",
    params(("org_id" = Uuid, Path, description = "Organisation id")),
    request_body = OrganisationUpdateRequest,
    responses(
        (status = 200, description = "Organisation updated", body = Organisation),
        (status = 403, description = "Denied")
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_organisation(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(org_id): Path<Uuid>,
    Json(payload): Json<OrganisationUpdateRequest>,
) -> AppResult<Json<Organisation>> {
    let principal = auth.principal();
    let ctx = ResourceContext::organisation(org_id);

    if payload.name.is_some() || payload.is_active.is_some() {
        require(
            state.authz.as_ref(),
            &principal,
            &ctx,
            Access::org(OrgResource::Organisation, OrgAction::Edit),
        )
        .await?;
    }
    if payload.settings.is_some() {
        require(
            state.authz.as_ref(),
            &principal,
            &ctx,
            Access::org(OrgResource::Settings, OrgAction::Edit),
        )
        .await?;
    }

    let (before, after) = store::organisations::update_organisation(&state.pool, org_id, payload).await?;
    if before.is_active != after.is_active {
        let members = store::memberships::active_member_ids(&state.pool, org_id).await?;
        state.cache.invalidate_tenant(org_id, &members);
    } else {
        state.cache.invalidate_organisation(org_id);
    }

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
    path = "/organisations/{org_id}",
    tag = "Organisations",
    params(("org_id" = Uuid, Path, description = "Organisation id")),
    responses(
        (status = 204, description = "Organisation soft deleted"),
        (status = 403, description = "Only owners may delete")
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_organisation(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(org_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    require(
        state.authz.as_ref(),
        &auth.principal(),
        &ResourceContext::organisation(org_id),
        Access::org(OrgResource::Organisation, OrgAction::Delete),
    )
    .await?;

    let deleted = store::organisations::soft_delete_organisation(&state.pool, org_id).await?;
    let members = store::memberships::active_member_ids(&state.pool, org_id).await?;
    state.cache.invalidate_tenant(org_id, &members);

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
    path = "/organisations/{org_id}/default",
    tag = "Organisations",
    params(("org_id" = Uuid, Path, description = "Organisation id")),
    responses(
        (status = 204, description = "Default organisation set"),
        (status = 400, description = "Not an active member")
    ),
    security(("bearerAuth" = []))
)]
pub async fn set_default_organisation(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    store::memberships::set_default_organisation(&state.pool, auth.user_id(), org_id).await?;
    state.cache.invalidate_subject(auth.user_id());
    Ok(StatusCode::NO_CONTENT)
}
