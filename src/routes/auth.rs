use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::app::AppState;
use crate::errors::{AppError, AppResult};
use crate::jwt::AuthUser;
use crate::models::membership::OrgMembership;
use crate::models::user::{AuthResponse, LoginRequest, RegisterRequest, User};
use crate::store;
use crate::utils::{hash_password, utc_now, verify_password};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/me", get(me))
        .route("/logout", post(logout))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MeResponse {
    pub user: User,
    /// Active memberships in live organisations.
    pub organisations: Vec<OrgMembership>,
}

#[utoipa::path(
    post,
    path = "/auth/register",
    tag = "Auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered", body = AuthResponse),
        (status = 400, description = "Missing name, email or password"),
        (status = 409, description = "Email already in use")
    )
)]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    if payload.name.trim().is_empty() || !payload.email.contains('@') {
        return Err(AppError::bad_request("name and a valid email are required"));
    }
    if payload.password.len() < 8 {
        return Err(AppError::bad_request("password must be at least 8 characters"));
    }

    let password_hash = hash_password(&payload.password)?;
    let user = store::users::create_user(&state.pool, payload.name.trim(), &payload.email, &password_hash).await?;
    let token = issue_token(&state, &user).await?;

    tracing::info!(user_id = %user.id, "user registered");

    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

#[utoipa::path(
    post,
    path = "/auth/login",
    tag = "Auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let db_user = store::users::find_by_email(&state.pool, &payload.email)
        .await?
        .ok_or_else(|| AppError::not_authenticated("invalid credentials"))?;

    if !verify_password(&payload.password, &db_user.password_hash)? {
        return Err(AppError::not_authenticated("invalid credentials"));
    }

    let user = User::from(db_user);
    let token = issue_token(&state, &user).await?;

    Ok(Json(AuthResponse { token, user }))
}

#[utoipa::path(
    get,
    path = "/auth/me",
    tag = "Auth",
    responses((status = 200, description = "Current user and organisation memberships", body = MeResponse)),
    security(("bearerAuth" = []))
)]
pub async fn me(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<MeResponse>> {
    let organisations = state.cache.org_memberships(&state.pool, auth.user_id()).await?;
    Ok(Json(MeResponse {
        user: auth.user,
        organisations: organisations.as_ref().clone(),
    }))
}

/// Revokes the session, forgets the persisted selection and drops the tenant
/// context with its overlay.
#[utoipa::path(
    post,
    path = "/auth/logout",
    tag = "Auth",
    responses((status = 204, description = "Session revoked")),
    security(("bearerAuth" = []))
)]
pub async fn logout(State(state): State<AppState>, auth: AuthUser) -> AppResult<StatusCode> {
    store::sessions::revoke_session(&state.pool, auth.session_id).await?;
    store::sessions::clear_preference(&state.pool, auth.user_id()).await?;
    state.sessions.remove(auth.session_id).await;
    state.cache.invalidate_subject(auth.user_id());

    tracing::info!(user_id = %auth.user_id(), session_id = %auth.session_id, "logged out");

    Ok(StatusCode::NO_CONTENT)
}

/// A fresh login session per token.
async fn issue_token(state: &AppState, user: &User) -> AppResult<String> {
    let issued_at = utc_now();
    let session_id = store::sessions::create_session(&state.pool, user.id, state.jwt.expires_at(issued_at)).await?;
    state.jwt.encode(user.id, session_id, issued_at)
}
