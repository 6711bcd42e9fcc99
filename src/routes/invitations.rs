use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{require, Access, OrgAction, OrgResource, OrgRole, ResourceContext};
use crate::errors::AppResult;
use crate::events::{log_audit, RequestContext};
use crate::jwt::AuthUser;
use crate::models::membership::{AcceptInvitationRequest, Invitation, InvitationCreated, InviteMemberRequest, OrgMembership};
use crate::store;

pub fn org_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_invitations).post(invite_member))
        .route("/:invitation_id", delete(revoke_invitation))
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/accept", post(accept_invitation))
}

fn invite_access() -> Access {
    Access::org(OrgResource::Members, OrgAction::Invite)
}

#[utoipa::path(
    get,
    path = "/organisations/{org_id}/invitations",
    tag = "Invitations",
    params(("org_id" = Uuid, Path, description = "Organisation id")),
    responses((status = 200, description = "Pending invitations", body = [Invitation])),
    security(("bearerAuth" = []))
)]
pub async fn list_invitations(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> AppResult<Json<Vec<Invitation>>> {
    super::ensure_visible(
        &state,
        &auth.principal(),
        &ResourceContext::organisation(org_id),
        invite_access(),
        "organisation",
    )
    .await?;

    let invitations = store::invitations::list_invitations(&state.pool, org_id).await?;
    Ok(Json(invitations))
}

/// The plaintext token is returned once, for hand-off to the mailer.
#[utoipa::path(
    post,
    path = "/organisations/{org_id}/invitations",
    tag = "Invitations",
    params(("org_id" = Uuid, Path, description = "Organisation id")),
    request_body = InviteMemberRequest,
    responses(
        (status = 201, description = "Invitation created", body = InvitationCreated),
        (status = 403, description = "Denied"),
        (status = 409, description = "Already a member")
    ),
    security(("bearerAuth" = []))
)]
pub async fn invite_member(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(org_id): Path<Uuid>,
    Json(payload): Json<InviteMemberRequest>,
) -> AppResult<(StatusCode, Json<InvitationCreated>)> {
    let principal = auth.principal();
    let ctx = ResourceContext::organisation(org_id);

    require(state.authz.as_ref(), &principal, &ctx, invite_access()).await?;
    if payload.org_role == OrgRole::Owner {
        require(
            state.authz.as_ref(),
            &principal,
            &ctx,
            Access::org(OrgResource::Members, OrgAction::Manage),
        )
        .await?;
    }

    let (invitation, token) = store::invitations::invite_member(
        &state.pool,
        org_id,
        &payload.email,
        payload.org_role,
        auth.user_id(),
        state.config.invitation_ttl,
    )
    .await?;

    log_audit(
        &state.event_bus,
        "created",
        Some(auth.user_id()),
        &invitation,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(InvitationCreated { invitation, token })))
}

#[utoipa::path(
    delete,
    path = "/organisations/{org_id}/invitations/{invitation_id}",
    tag = "Invitations",
    params(
        ("org_id" = Uuid, Path, description = "Organisation id"),
        ("invitation_id" = Uuid, Path, description = "Invitation id")
    ),
    responses(
        (status = 204, description = "Invitation revoked"),
        (status = 404, description = "No pending invitation")
    ),
    security(("bearerAuth" = []))
)]
pub async fn revoke_invitation(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((org_id, invitation_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    require(
        state.authz.as_ref(),
        &auth.principal(),
        &ResourceContext::organisation(org_id),
        invite_access(),
    )
    .await?;

    let invitation = store::invitations::revoke_invitation(&state.pool, org_id, invitation_id).await?;

    log_audit(
        &state.event_bus,
        "revoked",
        Some(auth.user_id()),
        &invitation,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/invitations/accept",
    tag = "Invitations",
    request_body = AcceptInvitationRequest,
    responses(
        (status = 200, description = "Membership created or reactivated", body = OrgMembership),
        (status = 400, description = "Invitation expired"),
        (status = 403, description = "Invitation addressed to another email"),
        (status = 404, description = "Unknown, used or revoked token")
    ),
    security(("bearerAuth" = []))
)]
pub async fn accept_invitation(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(payload): Json<AcceptInvitationRequest>,
) -> AppResult<Json<OrgMembership>> {
    let (invitation, membership) =
        store::invitations::accept_invitation(&state.pool, &payload.token, &auth.user).await?;
    state
        .cache
        .invalidate_membership(membership.organisation_id, auth.user_id());

    let context = RequestContext::from_headers(&headers);
    log_audit(&state.event_bus, "accepted", Some(auth.user_id()), &invitation, None, Some(context.clone()));
    log_audit(&state.event_bus, "added", Some(auth.user_id()), &membership, None, Some(context));

    Ok(Json(membership))
}
