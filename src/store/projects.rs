use sqlx::SqlitePool;
use uuid::Uuid;

use super::unique_or;
use crate::authz::{visible_projects_clause, Principal};
use crate::db::row_parsers;
use crate::errors::{AppError, AppResult};
use crate::models::project::{Project, ProjectCreateRequest, ProjectStatus, ProjectUpdateRequest};
use crate::utils::{db_time, utc_now};

const PROJECT_COLUMNS: &str = "p.id, p.organisation_id, p.name, p.reference, p.status, p.created_at, p.updated_at, p.deleted_at";

pub async fn create_project(pool: &SqlitePool, organisation_id: Uuid, payload: ProjectCreateRequest) -> AppResult<Project> {
    let name = payload.name.trim();
    let reference = payload.reference.trim();
    if name.is_empty() || reference.is_empty() {
        return Err(AppError::bad_request("project name and reference are required"));
    }

    let project_id = Uuid::new_v4();
    let now = db_time(utc_now());
    let status = payload.status.unwrap_or(ProjectStatus::Active);

    // the organisation must be live at insert time
    let result = sqlx::query(
        "INSERT INTO projects (id, organisation_id, name, reference, status, created_at, updated_at) \
         SELECT ?, o.id, ?, ?, ?, ?, ? FROM organisations o WHERE o.id = ? AND o.deleted_at IS NULL",
    )
    .bind(project_id.to_string())
    .bind(name)
    .bind(reference)
    .bind(status.as_str())
    .bind(&now)
    .bind(&now)
    .bind(organisation_id.to_string())
    .execute(pool)
    .await
    .map_err(|e| unique_or(e, "project reference already used in this organisation"))?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("organisation not found"));
    }

    tracing::info!(organisation_id = %organisation_id, project_id = %project_id, "project created");

    get_project(pool, organisation_id, project_id)
        .await?
        .ok_or_else(|| AppError::internal("project vanished after insert"))
}

/// Live project by id, only if it belongs to `organisation_id`.
pub async fn get_project(pool: &SqlitePool, organisation_id: Uuid, project_id: Uuid) -> AppResult<Option<Project>> {
    let sql = format!(
        "SELECT {PROJECT_COLUMNS} FROM projects p WHERE p.id = ? AND p.organisation_id = ? AND p.deleted_at IS NULL"
    );
    let row = sqlx::query(&sql)
        .bind(project_id.to_string())
        .bind(organisation_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_parsers::project_from_row).transpose()
}

/// Projects of the organisation the principal may see, by name.
///
/// Org owners and admins see every project; others see those they hold an
/// active membership in. The filter is the data-store visibility predicate.
pub async fn list_org_accessible_projects(
    pool: &SqlitePool,
    organisation_id: Uuid,
    principal: &Principal,
) -> AppResult<Vec<Project>> {
    let filter = visible_projects_clause(principal.user_id, organisation_id);
    let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects p WHERE {} ORDER BY p.name, p.id", filter.sql);

    let mut query = sqlx::query(&sql);
    for value in &filter.binds {
        query = query.bind(value.clone());
    }
    let rows = query.fetch_all(pool).await?;

    rows.iter().map(row_parsers::project_from_row).collect()
}

/// Returns the project before and after the update. The organisation is not updatable.
pub async fn update_project(
    pool: &SqlitePool,
    organisation_id: Uuid,
    project_id: Uuid,
    payload: ProjectUpdateRequest,
) -> AppResult<(Project, Project)> {
    let before = get_project(pool, organisation_id, project_id)
        .await?
        .ok_or_else(|| AppError::not_found("project not found"))?;

    let name = match payload.name {
        Some(n) if n.trim().is_empty() => return Err(AppError::bad_request("project name cannot be empty")),
        Some(n) => n.trim().to_string(),
        None => before.name.clone(),
    };
    let reference = match payload.reference {
        Some(r) if r.trim().is_empty() => return Err(AppError::bad_request("project reference cannot be empty")),
        Some(r) => r.trim().to_string(),
        None => before.reference.clone(),
    };
    let status = payload.status.unwrap_or(before.status);

    sqlx::query("UPDATE projects SET name = ?, reference = ?, status = ?, updated_at = ? WHERE id = ? AND organisation_id = ?")
        .bind(&name)
        .bind(&reference)
        .bind(status.as_str())
        .bind(db_time(utc_now()))
        .bind(project_id.to_string())
        .bind(organisation_id.to_string())
        .execute(pool)
        .await
        .map_err(|e| unique_or(e, "project reference already used in this organisation"))?;

    let after = get_project(pool, organisation_id, project_id)
        .await?
        .ok_or_else(|| AppError::not_found("project not found"))?;

    Ok((before, after))
}

pub async fn soft_delete_project(pool: &SqlitePool, organisation_id: Uuid, project_id: Uuid) -> AppResult<Project> {
    let existing = get_project(pool, organisation_id, project_id)
        .await?
        .ok_or_else(|| AppError::not_found("project not found"))?;

    let now = utc_now();
    sqlx::query("UPDATE projects SET deleted_at = ?, updated_at = ? WHERE id = ? AND organisation_id = ?")
        .bind(db_time(now))
        .bind(db_time(now))
        .bind(project_id.to_string())
        .bind(organisation_id.to_string())
        .execute(pool)
        .await?;

    tracing::info!(organisation_id = %organisation_id, project_id = %project_id, "project soft-deleted");

    Ok(Project {
        deleted_at: Some(now),
        updated_at: now,
        ..existing
    })
}
