use chrono::Duration;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::authz::OrgRole;
use crate::db::row_parsers;
use crate::errors::{AppError, AppResult};
use crate::models::membership::{Invitation, OrgMembership};
use crate::models::user::User;
use crate::store::memberships;
use crate::utils::{db_time, generate_token, hash_token, utc_now};

const INVITATION_COLUMNS: &str =
    "id, organisation_id, email, org_role, invited_by, created_at, expires_at, accepted_at, revoked_at";

/// Lifetime of an invitation token, from `INVITATION_TTL_HOURS` (default one week).
pub fn ttl_from_env() -> Duration {
    let hours = std::env::var("INVITATION_TTL_HOURS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|h| *h > 0)
        .unwrap_or(168);
    Duration::hours(hours)
}

/// Creates a pending invitation and returns it with the plaintext token.
///
/// Only the token's hash is stored; the plaintext is handed to the mailer.
pub async fn invite_member(
    pool: &SqlitePool,
    organisation_id: Uuid,
    email: &str,
    org_role: OrgRole,
    invited_by: Uuid,
    ttl: Duration,
) -> AppResult<(Invitation, String)> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::bad_request("a valid email is required"));
    }

    let already_member: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM organisation_members om JOIN users u ON u.id = om.user_id \
         WHERE om.organisation_id = ? AND om.is_active = 1 AND u.email = ? AND u.deleted_at IS NULL",
    )
    .bind(organisation_id.to_string())
    .bind(&email)
    .fetch_optional(pool)
    .await?;
    if already_member.is_some() {
        return Err(AppError::conflict("user is already a member of this organisation"));
    }

    let token = generate_token();
    let invitation_id = Uuid::new_v4();
    let now = utc_now();

    let result = sqlx::query(
        "INSERT INTO organisation_invitations (id, organisation_id, email, org_role, token_hash, invited_by, created_at, expires_at) \
         SELECT ?, o.id, ?, ?, ?, ?, ?, ? FROM organisations o WHERE o.id = ? AND o.deleted_at IS NULL",
    )
    .bind(invitation_id.to_string())
    .bind(&email)
    .bind(org_role.as_str())
    .bind(hash_token(&token))
    .bind(invited_by.to_string())
    .bind(db_time(now))
    .bind(db_time(now + ttl))
    .bind(organisation_id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("organisation not found"));
    }

    tracing::info!(organisation_id = %organisation_id, invitation_id = %invitation_id, "invitation created");

    let invitation = get_invitation(pool, organisation_id, invitation_id)
        .await?
        .ok_or_else(|| AppError::internal("invitation vanished after insert"))?;
    Ok((invitation, token))
}

pub async fn get_invitation(pool: &SqlitePool, organisation_id: Uuid, invitation_id: Uuid) -> AppResult<Option<Invitation>> {
    let sql = format!("SELECT {INVITATION_COLUMNS} FROM organisation_invitations WHERE id = ? AND organisation_id = ?");
    let row = sqlx::query(&sql)
        .bind(invitation_id.to_string())
        .bind(organisation_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_parsers::invitation_from_row).transpose()
}

/// Pending invitations (not accepted, not revoked), newest first.
pub async fn list_invitations(pool: &SqlitePool, organisation_id: Uuid) -> AppResult<Vec<Invitation>> {
    let sql = format!(
        "SELECT {INVITATION_COLUMNS} FROM organisation_invitations \
         WHERE organisation_id = ? AND accepted_at IS NULL AND revoked_at IS NULL \
         ORDER BY created_at DESC, id"
    );
    let rows = sqlx::query(&sql).bind(organisation_id.to_string()).fetch_all(pool).await?;

    rows.iter().map(row_parsers::invitation_from_row).collect()
}

/// Redeems a token for `user`, creating or reactivating the membership.
///
/// The invitation is addressed to an email; a different account cannot redeem it.
pub async fn accept_invitation(pool: &SqlitePool, token: &str, user: &User) -> AppResult<(Invitation, OrgMembership)> {
    let sql = format!("SELECT {INVITATION_COLUMNS} FROM organisation_invitations WHERE token_hash = ?");
    let row = sqlx::query(&sql)
        .bind(hash_token(token.trim()))
        .fetch_optional(pool)
        .await?;
    let invitation = row
        .as_ref()
        .map(row_parsers::invitation_from_row)
        .transpose()?
        .ok_or_else(|| AppError::not_found("invitation not found"))?;

    if invitation.revoked_at.is_some() || invitation.accepted_at.is_some() {
        return Err(AppError::not_found("invitation not found"));
    }
    if invitation.expires_at <= utc_now() {
        return Err(AppError::bad_request("invitation has expired"));
    }
    if !invitation.email.eq_ignore_ascii_case(&user.email) {
        return Err(AppError::denied("invitation was issued to a different email"));
    }

    let now = db_time(utc_now());
    let mut tx = pool.begin().await?;

    // claim first so two concurrent redemptions cannot both succeed
    let claimed = sqlx::query(
        "UPDATE organisation_invitations SET accepted_at = ? WHERE id = ? AND accepted_at IS NULL AND revoked_at IS NULL",
    )
    .bind(&now)
    .bind(invitation.id.to_string())
    .execute(&mut *tx)
    .await?;
    if claimed.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(AppError::not_found("invitation not found"));
    }

    let result = sqlx::query(
        "INSERT INTO organisation_members (id, organisation_id, user_id, org_role, is_active, is_default, invited_at, accepted_at, created_at, updated_at) \
         SELECT ?, o.id, ?, ?, 1, 0, ?, ?, ?, ? FROM organisations o WHERE o.id = ? AND o.deleted_at IS NULL \
         ON CONFLICT (organisation_id, user_id) DO UPDATE SET \
            org_role = excluded.org_role, is_active = 1, invited_at = excluded.invited_at, \
            accepted_at = excluded.accepted_at, updated_at = excluded.updated_at \
         WHERE organisation_members.is_active = 0",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user.id.to_string())
    .bind(invitation.org_role.as_str())
    .bind(db_time(invitation.created_at))
    .bind(&now)
    .bind(&now)
    .bind(&now)
    .bind(invitation.organisation_id.to_string())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(AppError::conflict("already a member of this organisation"));
    }

    tx.commit().await?;

    tracing::info!(
        organisation_id = %invitation.organisation_id,
        user_id = %user.id,
        org_role = invitation.org_role.as_str(),
        "invitation accepted"
    );

    let membership = memberships::get_org_membership(pool, user.id, invitation.organisation_id)
        .await?
        .ok_or_else(|| AppError::internal("membership vanished after accept"))?;
    let invitation = get_invitation(pool, invitation.organisation_id, invitation.id)
        .await?
        .ok_or_else(|| AppError::internal("invitation vanished after accept"))?;

    Ok((invitation, membership))
}

pub async fn revoke_invitation(pool: &SqlitePool, organisation_id: Uuid, invitation_id: Uuid) -> AppResult<Invitation> {
    let result = sqlx::query(
        "UPDATE organisation_invitations SET revoked_at = ? \
         WHERE id = ? AND organisation_id = ? AND accepted_at IS NULL AND revoked_at IS NULL",
    )
    .bind(db_time(utc_now()))
    .bind(invitation_id.to_string())
    .bind(organisation_id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("pending invitation not found"));
    }

    get_invitation(pool, organisation_id, invitation_id)
        .await?
        .ok_or_else(|| AppError::internal("invitation vanished after revoke"))
}
