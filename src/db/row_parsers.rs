//! Row decoding for the tenancy tables.
//!
//! Identifiers and timestamps are stored as TEXT; these helpers parse them
//! strictly so a malformed row surfaces as an internal error instead of a
//! defaulted id.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::membership::{Invitation, OrgMembership, ProjectMembership};
use crate::models::organisation::{Organisation, OrganisationSettings};
use crate::models::project::Project;
use crate::models::user::DbUser;

pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, AppError> {
    let s = s.trim();

    // Try RFC3339 first (e.g. 2025-11-19T12:34:56Z)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    // SQLite default timestamp format: "YYYY-MM-DD HH:MM:SS" (with optional fractional seconds)
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    // sqlx's own encoding of DateTime<Utc>
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(naive_date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let ndt = naive_date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| AppError::internal("invalid datetime: date out of range"))?;
        return Ok(Utc.from_utc_datetime(&ndt));
    }

    Err(AppError::internal(format!("invalid datetime: {}", s)))
}

fn text(row: &SqliteRow, col: &str) -> Result<String, AppError> {
    row.try_get::<String, _>(col)
        .map_err(|e| AppError::internal(format!("missing {}: {}", col, e)))
}

fn opt_text(row: &SqliteRow, col: &str) -> Result<Option<String>, AppError> {
    row.try_get::<Option<String>, _>(col)
        .map_err(|e| AppError::internal(format!("missing {}: {}", col, e)))
}

fn flag(row: &SqliteRow, col: &str) -> Result<bool, AppError> {
    row.try_get::<i64, _>(col)
        .map(|v| v != 0)
        .map_err(|e| AppError::internal(format!("missing {}: {}", col, e)))
}

pub fn uuid(row: &SqliteRow, col: &str) -> Result<Uuid, AppError> {
    let s = text(row, col)?;
    Uuid::parse_str(&s).map_err(|e| AppError::internal(format!("invalid uuid in {}: {}", col, e)))
}

pub fn opt_uuid(row: &SqliteRow, col: &str) -> Result<Option<Uuid>, AppError> {
    match opt_text(row, col)? {
        Some(s) => Uuid::parse_str(&s)
            .map(Some)
            .map_err(|e| AppError::internal(format!("invalid uuid in {}: {}", col, e))),
        None => Ok(None),
    }
}

fn datetime(row: &SqliteRow, col: &str) -> Result<DateTime<Utc>, AppError> {
    parse_datetime(&text(row, col)?)
}

fn opt_datetime(row: &SqliteRow, col: &str) -> Result<Option<DateTime<Utc>>, AppError> {
    match opt_text(row, col)? {
        Some(s) if !s.trim().is_empty() => Ok(Some(parse_datetime(&s)?)),
        _ => Ok(None),
    }
}

pub fn db_user_from_row(row: &SqliteRow) -> Result<DbUser, AppError> {
    Ok(DbUser {
        id: uuid(row, "id")?,
        name: text(row, "name")?,
        email: text(row, "email")?,
        password_hash: text(row, "password_hash")?,
        system_role: text(row, "system_role")?.parse()?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
        deleted_at: opt_datetime(row, "deleted_at")?,
    })
}

pub fn organisation_from_row(row: &SqliteRow) -> Result<Organisation, AppError> {
    let settings_raw = text(row, "settings")?;
    let settings: OrganisationSettings = serde_json::from_str(&settings_raw)
        .map_err(|e| AppError::internal(format!("invalid organisation settings: {}", e)))?;

    Ok(Organisation {
        id: uuid(row, "id")?,
        name: text(row, "name")?,
        slug: text(row, "slug")?,
        settings,
        is_active: flag(row, "is_active")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
        deleted_at: opt_datetime(row, "deleted_at")?,
    })
}

pub fn org_membership_from_row(row: &SqliteRow) -> Result<OrgMembership, AppError> {
    Ok(OrgMembership {
        id: uuid(row, "id")?,
        organisation_id: uuid(row, "organisation_id")?,
        user_id: uuid(row, "user_id")?,
        org_role: text(row, "org_role")?.parse()?,
        is_active: flag(row, "is_active")?,
        is_default: flag(row, "is_default")?,
        invited_at: opt_datetime(row, "invited_at")?,
        accepted_at: opt_datetime(row, "accepted_at")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

pub fn project_from_row(row: &SqliteRow) -> Result<Project, AppError> {
    Ok(Project {
        id: uuid(row, "id")?,
        organisation_id: uuid(row, "organisation_id")?,
        name: text(row, "name")?,
        reference: text(row, "reference")?,
        status: text(row, "status")?.parse()?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
        deleted_at: opt_datetime(row, "deleted_at")?,
    })
}

pub fn project_membership_from_row(row: &SqliteRow) -> Result<ProjectMembership, AppError> {
    Ok(ProjectMembership {
        id: uuid(row, "id")?,
        project_id: uuid(row, "project_id")?,
        user_id: uuid(row, "user_id")?,
        project_role: text(row, "project_role")?.parse()?,
        is_active: flag(row, "is_active")?,
        is_default: flag(row, "is_default")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

pub fn invitation_from_row(row: &SqliteRow) -> Result<Invitation, AppError> {
    Ok(Invitation {
        id: uuid(row, "id")?,
        organisation_id: uuid(row, "organisation_id")?,
        email: text(row, "email")?,
        org_role: text(row, "org_role")?.parse()?,
        invited_by: uuid(row, "invited_by")?,
        created_at: datetime(row, "created_at")?,
        expires_at: datetime(row, "expires_at")?,
        accepted_at: opt_datetime(row, "accepted_at")?,
        revoked_at: opt_datetime(row, "revoked_at")?,
    })
}
