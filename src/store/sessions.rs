use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::row_parsers;
use crate::errors::AppResult;
use crate::utils::{db_time, utc_now};

/// Last tenant selection a principal made, restored at the next login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextPreference {
    pub organisation_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
}

pub async fn create_session(pool: &SqlitePool, user_id: Uuid, expires_at: DateTime<Utc>) -> AppResult<Uuid> {
    let session_id = Uuid::new_v4();
    sqlx::query("INSERT INTO sessions (id, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(session_id.to_string())
        .bind(user_id.to_string())
        .bind(db_time(utc_now()))
        .bind(db_time(expires_at))
        .execute(pool)
        .await?;
    Ok(session_id)
}

/// The session exists, belongs to the user, is unrevoked and unexpired.
pub async fn is_session_active(pool: &SqlitePool, session_id: Uuid, user_id: Uuid) -> AppResult<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sessions WHERE id = ? AND user_id = ? AND revoked_at IS NULL AND expires_at > ?",
    )
    .bind(session_id.to_string())
    .bind(user_id.to_string())
    .bind(db_time(utc_now()))
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

pub async fn revoke_session(pool: &SqlitePool, session_id: Uuid) -> AppResult<()> {
    sqlx::query("UPDATE sessions SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL")
        .bind(db_time(utc_now()))
        .bind(session_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn load_preference(pool: &SqlitePool, user_id: Uuid) -> AppResult<ContextPreference> {
    let row = sqlx::query("SELECT organisation_id, project_id FROM context_preferences WHERE user_id = ?")
        .bind(user_id.to_string())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(ContextPreference {
            organisation_id: row_parsers::opt_uuid(&row, "organisation_id")?,
            project_id: row_parsers::opt_uuid(&row, "project_id")?,
        }),
        None => Ok(ContextPreference::default()),
    }
}

pub async fn save_preference(pool: &SqlitePool, user_id: Uuid, preference: ContextPreference) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO context_preferences (user_id, organisation_id, project_id, updated_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT (user_id) DO UPDATE SET \
            organisation_id = excluded.organisation_id, project_id = excluded.project_id, updated_at = excluded.updated_at",
    )
    .bind(user_id.to_string())
    .bind(preference.organisation_id.map(|id| id.to_string()))
    .bind(preference.project_id.map(|id| id.to_string()))
    .bind(db_time(utc_now()))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_preference(pool: &SqlitePool, user_id: Uuid) -> AppResult<()> {
    sqlx::query("DELETE FROM context_preferences WHERE user_id = ?")
        .bind(user_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}
