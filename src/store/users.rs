use sqlx::SqlitePool;
use uuid::Uuid;

use super::unique_or;
use crate::authz::SystemRole;
use crate::db::row_parsers;
use crate::errors::{AppError, AppResult};
use crate::models::user::{DbUser, User};
use crate::utils::{db_time, utc_now};

const USER_COLUMNS: &str = "id, name, email, password_hash, system_role, created_at, updated_at, deleted_at";

pub async fn create_user(pool: &SqlitePool, name: &str, email: &str, password_hash: &str) -> AppResult<User> {
    let name = name.trim();
    let email = email.trim().to_lowercase();
    if name.is_empty() || email.is_empty() || !email.contains('@') {
        return Err(AppError::bad_request("name and a valid email are required"));
    }

    let now = db_time(utc_now());
    let user_id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO users (id, name, email, password_hash, system_role, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id.to_string())
    .bind(name)
    .bind(&email)
    .bind(password_hash)
    .bind(SystemRole::User.as_str())
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(|e| unique_or(e, "email already in use"))?;

    tracing::info!(user_id = %user_id, "user registered");

    find_by_id(pool, user_id)
        .await?
        .ok_or_else(|| AppError::internal("user vanished after insert"))
}

pub async fn find_by_email(pool: &SqlitePool, email: &str) -> AppResult<Option<DbUser>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ? AND deleted_at IS NULL");
    let row = sqlx::query(&sql)
        .bind(email.trim().to_lowercase())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_parsers::db_user_from_row).transpose()
}

pub async fn find_db_user(pool: &SqlitePool, user_id: Uuid) -> AppResult<Option<DbUser>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ? AND deleted_at IS NULL");
    let row = sqlx::query(&sql)
        .bind(user_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_parsers::db_user_from_row).transpose()
}

pub async fn find_by_id(pool: &SqlitePool, user_id: Uuid) -> AppResult<Option<User>> {
    Ok(find_db_user(pool, user_id).await?.map(User::from))
}

/// Returns the user before and after the change.
pub async fn set_system_role(pool: &SqlitePool, user_id: Uuid, system_role: SystemRole) -> AppResult<(User, User)> {
    let before = find_by_id(pool, user_id)
        .await?
        .ok_or_else(|| AppError::not_found("user not found"))?;

    sqlx::query("UPDATE users SET system_role = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(system_role.as_str())
        .bind(db_time(utc_now()))
        .bind(user_id.to_string())
        .execute(pool)
        .await?;

    let after = find_by_id(pool, user_id)
        .await?
        .ok_or_else(|| AppError::not_found("user not found"))?;

    tracing::warn!(
        user_id = %user_id,
        from = before.system_role.as_str(),
        to = after.system_role.as_str(),
        "system role changed"
    );

    Ok((before, after))
}
