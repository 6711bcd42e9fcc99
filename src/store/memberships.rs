use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::authz::{OrgRole, ProjectFacts, ProjectRole};
use crate::db::row_parsers;
use crate::errors::{AppError, AppResult};
use crate::models::membership::{
    OrgMemberView, OrgMembership, ProjectMemberView, ProjectMembership, ProjectMembershipRecord,
};
use crate::utils::{db_time, utc_now};

const ORG_MEMBER_COLUMNS: &str = "om.id, om.organisation_id, om.user_id, om.org_role, om.is_active, om.is_default, \
     om.invited_at, om.accepted_at, om.created_at, om.updated_at";

const PROJECT_MEMBER_COLUMNS: &str =
    "pm.id, pm.project_id, pm.user_id, pm.project_role, pm.is_active, pm.is_default, pm.created_at, pm.updated_at";

// =============================================================================
// READS
// =============================================================================

/// The membership row for (user, organisation), active or not.
pub async fn get_org_membership(pool: &SqlitePool, user_id: Uuid, organisation_id: Uuid) -> AppResult<Option<OrgMembership>> {
    let sql = format!(
        "SELECT {ORG_MEMBER_COLUMNS} FROM organisation_members om WHERE om.user_id = ? AND om.organisation_id = ?"
    );
    let row = sqlx::query(&sql)
        .bind(user_id.to_string())
        .bind(organisation_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_parsers::org_membership_from_row).transpose()
}

/// The membership row for (user, project), active or not.
pub async fn get_project_membership(pool: &SqlitePool, user_id: Uuid, project_id: Uuid) -> AppResult<Option<ProjectMembership>> {
    let sql = format!(
        "SELECT {PROJECT_MEMBER_COLUMNS} FROM project_members pm WHERE pm.user_id = ? AND pm.project_id = ?"
    );
    let row = sqlx::query(&sql)
        .bind(user_id.to_string())
        .bind(project_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_parsers::project_membership_from_row).transpose()
}

/// Role of an active membership in a live organisation.
pub async fn active_org_role(pool: &SqlitePool, user_id: Uuid, organisation_id: Uuid) -> AppResult<Option<OrgRole>> {
    let role: Option<String> = sqlx::query_scalar(
        "SELECT om.org_role FROM organisation_members om \
         JOIN organisations o ON o.id = om.organisation_id AND o.deleted_at IS NULL AND o.is_active = 1 \
         WHERE om.user_id = ? AND om.organisation_id = ? AND om.is_active = 1",
    )
    .bind(user_id.to_string())
    .bind(organisation_id.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(role.map(|r| r.parse::<OrgRole>()).transpose()?)
}

/// Whether the project lives in the organisation, and the user's active role in it.
pub async fn project_facts(
    pool: &SqlitePool,
    user_id: Uuid,
    organisation_id: Uuid,
    project_id: Uuid,
) -> AppResult<ProjectFacts> {
    let row = sqlx::query(
        "SELECT pm.project_role FROM projects p \
         LEFT JOIN project_members pm ON pm.project_id = p.id AND pm.user_id = ? AND pm.is_active = 1 \
         WHERE p.id = ? AND p.organisation_id = ? AND p.deleted_at IS NULL",
    )
    .bind(user_id.to_string())
    .bind(project_id.to_string())
    .bind(organisation_id.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(ProjectFacts::default());
    };

    let role: Option<String> = row.try_get("project_role")?;
    Ok(ProjectFacts {
        in_organisation: true,
        role: role.map(|r| r.parse::<ProjectRole>()).transpose()?,
    })
}

/// Active memberships in live organisations, ordered by organisation name then id.
pub async fn list_orgs_for(pool: &SqlitePool, user_id: Uuid) -> AppResult<Vec<OrgMembership>> {
    let sql = format!(
        "SELECT {ORG_MEMBER_COLUMNS} FROM organisation_members om \
         JOIN organisations o ON o.id = om.organisation_id AND o.deleted_at IS NULL AND o.is_active = 1 \
         WHERE om.user_id = ? AND om.is_active = 1 \
         ORDER BY o.name, o.id"
    );
    let rows = sqlx::query(&sql).bind(user_id.to_string()).fetch_all(pool).await?;

    rows.iter().map(row_parsers::org_membership_from_row).collect()
}

/// Active project memberships of one user inside one organisation, in project name order.
pub async fn list_project_memberships_in(
    pool: &SqlitePool,
    user_id: Uuid,
    organisation_id: Uuid,
) -> AppResult<Vec<ProjectMembership>> {
    let sql = format!(
        "SELECT {PROJECT_MEMBER_COLUMNS} FROM project_members pm \
         JOIN projects p ON p.id = pm.project_id AND p.deleted_at IS NULL \
         WHERE pm.user_id = ? AND p.organisation_id = ? AND pm.is_active = 1 \
         ORDER BY p.name, p.id"
    );
    let rows = sqlx::query(&sql)
        .bind(user_id.to_string())
        .bind(organisation_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_parsers::project_membership_from_row).collect()
}

pub async fn list_org_members(pool: &SqlitePool, organisation_id: Uuid) -> AppResult<Vec<OrgMemberView>> {
    let sql = format!(
        "SELECT {ORG_MEMBER_COLUMNS}, u.name AS member_name, u.email AS member_email \
         FROM organisation_members om JOIN users u ON u.id = om.user_id AND u.deleted_at IS NULL \
         WHERE om.organisation_id = ? AND om.is_active = 1 \
         ORDER BY u.name, u.id"
    );
    let rows = sqlx::query(&sql).bind(organisation_id.to_string()).fetch_all(pool).await?;

    rows.iter()
        .map(|row| -> AppResult<OrgMemberView> {
            Ok(OrgMemberView {
                membership: row_parsers::org_membership_from_row(row)?,
                name: row.try_get("member_name")?,
                email: row.try_get("member_email")?,
            })
        })
        .collect()
}

/// Users holding an active membership, whatever the organisation's own state.
pub async fn active_member_ids(pool: &SqlitePool, organisation_id: Uuid) -> AppResult<Vec<Uuid>> {
    let rows = sqlx::query("SELECT user_id FROM organisation_members WHERE organisation_id = ? AND is_active = 1")
        .bind(organisation_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(|row| row_parsers::uuid(row, "user_id")).collect()
}

pub async fn list_project_members(pool: &SqlitePool, project_id: Uuid) -> AppResult<Vec<ProjectMemberView>> {
    let sql = format!(
        "SELECT {PROJECT_MEMBER_COLUMNS}, u.name AS member_name, u.email AS member_email \
         FROM project_members pm JOIN users u ON u.id = pm.user_id AND u.deleted_at IS NULL \
         WHERE pm.project_id = ? AND pm.is_active = 1 \
         ORDER BY u.name, u.id"
    );
    let rows = sqlx::query(&sql).bind(project_id.to_string()).fetch_all(pool).await?;

    rows.iter()
        .map(|row| -> AppResult<ProjectMemberView> {
            Ok(ProjectMemberView {
                membership: row_parsers::project_membership_from_row(row)?,
                name: row.try_get("member_name")?,
                email: row.try_get("member_email")?,
            })
        })
        .collect()
}

// =============================================================================
// ORGANISATION MEMBERSHIP WRITES
// =============================================================================

async fn require_live_user(pool: &SqlitePool, user_id: Uuid) -> AppResult<()> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id = ? AND deleted_at IS NULL")
        .bind(user_id.to_string())
        .fetch_optional(pool)
        .await?;
    exists.map(|_| ()).ok_or_else(|| AppError::not_found("user not found"))
}

/// Adds a member, or reactivates a former one with the new role.
pub async fn add_org_member(pool: &SqlitePool, organisation_id: Uuid, user_id: Uuid, org_role: OrgRole) -> AppResult<OrgMembership> {
    require_live_user(pool, user_id).await?;

    let now = db_time(utc_now());
    let result = sqlx::query(
        "INSERT INTO organisation_members (id, organisation_id, user_id, org_role, is_active, is_default, created_at, updated_at) \
         SELECT ?, o.id, ?, ?, 1, 0, ?, ? FROM organisations o WHERE o.id = ? AND o.deleted_at IS NULL \
         ON CONFLICT (organisation_id, user_id) DO UPDATE SET \
            org_role = excluded.org_role, is_active = 1, updated_at = excluded.updated_at \
         WHERE organisation_members.is_active = 0",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id.to_string())
    .bind(org_role.as_str())
    .bind(&now)
    .bind(&now)
    .bind(organisation_id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return match get_org_membership(pool, user_id, organisation_id).await? {
            Some(existing) if existing.is_active => Err(AppError::conflict("user is already a member of this organisation")),
            _ => Err(AppError::not_found("organisation not found")),
        };
    }

    tracing::info!(
        organisation_id = %organisation_id,
        user_id = %user_id,
        org_role = org_role.as_str(),
        "organisation member added"
    );

    get_org_membership(pool, user_id, organisation_id)
        .await?
        .ok_or_else(|| AppError::internal("membership vanished after insert"))
}

/// Deactivates a membership and, in the same transaction, every project
/// membership the user holds in that organisation.
pub async fn remove_org_member(pool: &SqlitePool, organisation_id: Uuid, user_id: Uuid) -> AppResult<OrgMembership> {
    let now = db_time(utc_now());
    let mut tx = pool.begin().await?;

    // the last active owner is never deactivated
    let result = sqlx::query(
        "UPDATE organisation_members SET is_active = 0, is_default = 0, updated_at = ? \
         WHERE organisation_id = ? AND user_id = ? AND is_active = 1 \
           AND (org_role <> 'owner' OR EXISTS ( \
                SELECT 1 FROM organisation_members other \
                WHERE other.organisation_id = organisation_members.organisation_id \
                  AND other.org_role = 'owner' AND other.is_active = 1 AND other.user_id <> organisation_members.user_id))",
    )
    .bind(&now)
    .bind(organisation_id.to_string())
    .bind(user_id.to_string())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT org_role FROM organisation_members WHERE organisation_id = ? AND user_id = ? AND is_active = 1",
        )
        .bind(organisation_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        return match role {
            Some(_) => Err(AppError::last_owner_protected("an organisation must keep at least one active owner")),
            None => Err(AppError::not_found("membership not found")),
        };
    }

    let cascaded = sqlx::query(
        "UPDATE project_members SET is_active = 0, is_default = 0, updated_at = ? \
         WHERE user_id = ? AND is_active = 1 \
           AND project_id IN (SELECT id FROM projects WHERE organisation_id = ?)",
    )
    .bind(&now)
    .bind(user_id.to_string())
    .bind(organisation_id.to_string())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    tracing::info!(
        organisation_id = %organisation_id,
        user_id = %user_id,
        project_memberships_deactivated = cascaded,
        "organisation member removed"
    );

    get_org_membership(pool, user_id, organisation_id)
        .await?
        .ok_or_else(|| AppError::internal("membership vanished after update"))
}

/// Returns the membership before and after the role change.
pub async fn change_org_role(
    pool: &SqlitePool,
    organisation_id: Uuid,
    user_id: Uuid,
    org_role: OrgRole,
) -> AppResult<(OrgMembership, OrgMembership)> {
    let before = get_org_membership(pool, user_id, organisation_id)
        .await?
        .filter(|m| m.is_active)
        .ok_or_else(|| AppError::not_found("membership not found"))?;

    let result = sqlx::query(
        "UPDATE organisation_members SET org_role = ?, updated_at = ? \
         WHERE organisation_id = ? AND user_id = ? AND is_active = 1 \
           AND (org_role <> 'owner' OR ? = 'owner' OR EXISTS ( \
                SELECT 1 FROM organisation_members other \
                WHERE other.organisation_id = organisation_members.organisation_id \
                  AND other.org_role = 'owner' AND other.is_active = 1 AND other.user_id <> organisation_members.user_id))",
    )
    .bind(org_role.as_str())
    .bind(db_time(utc_now()))
    .bind(organisation_id.to_string())
    .bind(user_id.to_string())
    .bind(org_role.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        // the membership may have been deactivated since it was read
        let still_active = get_org_membership(pool, user_id, organisation_id)
            .await?
            .is_some_and(|m| m.is_active);
        return if still_active {
            Err(AppError::last_owner_protected("cannot demote the last active owner"))
        } else {
            Err(AppError::not_found("membership not found"))
        };
    }

    let after = get_org_membership(pool, user_id, organisation_id)
        .await?
        .ok_or_else(|| AppError::internal("membership vanished after update"))?;

    tracing::info!(
        organisation_id = %organisation_id,
        user_id = %user_id,
        from = before.org_role.as_str(),
        to = after.org_role.as_str(),
        "organisation role changed"
    );

    Ok((before, after))
}

pub async fn set_default_organisation(pool: &SqlitePool, user_id: Uuid, organisation_id: Uuid) -> AppResult<()> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE organisation_members SET is_default = CASE WHEN organisation_id = ? THEN 1 ELSE 0 END \
         WHERE user_id = ? AND (is_default = 1 OR (organisation_id = ? AND is_active = 1))",
    )
    .bind(organisation_id.to_string())
    .bind(user_id.to_string())
    .bind(organisation_id.to_string())
    .execute(&mut *tx)
    .await?;

    let is_member: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM organisation_members WHERE user_id = ? AND organisation_id = ? AND is_active = 1",
    )
    .bind(user_id.to_string())
    .bind(organisation_id.to_string())
    .fetch_optional(&mut *tx)
    .await?;

    if is_member.is_none() || updated.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(AppError::invalid_tenant_selection("not an active member of that organisation"));
    }

    tx.commit().await?;
    Ok(())
}

// =============================================================================
// PROJECT MEMBERSHIP WRITES
// =============================================================================

async fn project_record(pool: &SqlitePool, organisation_id: Uuid, project_id: Uuid, user_id: Uuid) -> AppResult<ProjectMembershipRecord> {
    let membership = get_project_membership(pool, user_id, project_id)
        .await?
        .ok_or_else(|| AppError::internal("project membership vanished after write"))?;
    Ok(ProjectMembershipRecord { organisation_id, membership })
}

async fn project_in_organisation(pool: &SqlitePool, organisation_id: Uuid, project_id: Uuid) -> AppResult<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM projects WHERE id = ? AND organisation_id = ? AND deleted_at IS NULL",
    )
    .bind(project_id.to_string())
    .bind(organisation_id.to_string())
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

/// Adds (or reactivates) a project membership.
///
/// The organisation-membership prerequisite is part of the INSERT itself, so a
/// concurrent removal from the organisation either happens before (insert finds
/// no membership) or after (its cascade deactivates the new row).
pub async fn add_project_member(
    pool: &SqlitePool,
    organisation_id: Uuid,
    project_id: Uuid,
    user_id: Uuid,
    project_role: ProjectRole,
) -> AppResult<ProjectMembershipRecord> {
    let now = db_time(utc_now());
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        "INSERT INTO project_members (id, project_id, user_id, project_role, is_active, is_default, created_at, updated_at) \
         SELECT ?, p.id, ?, ?, 1, 0, ?, ? FROM projects p \
         WHERE p.id = ? AND p.organisation_id = ? AND p.deleted_at IS NULL \
           AND EXISTS (SELECT 1 FROM organisation_members om \
                       WHERE om.organisation_id = p.organisation_id AND om.user_id = ? AND om.is_active = 1) \
         ON CONFLICT (project_id, user_id) DO UPDATE SET \
            project_role = excluded.project_role, is_active = 1, updated_at = excluded.updated_at \
         WHERE project_members.is_active = 0",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id.to_string())
    .bind(project_role.as_str())
    .bind(&now)
    .bind(&now)
    .bind(project_id.to_string())
    .bind(organisation_id.to_string())
    .bind(user_id.to_string())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;

        if !project_in_organisation(pool, organisation_id, project_id).await? {
            return Err(AppError::not_found("project not found"));
        }
        if get_project_membership(pool, user_id, project_id).await?.is_some_and(|m| m.is_active) {
            return Err(AppError::conflict("user is already a member of this project"));
        }
        return Err(AppError::prerequisite_missing(
            "user must be an active member of the project's organisation",
        ));
    }

    tx.commit().await?;

    tracing::info!(
        organisation_id = %organisation_id,
        project_id = %project_id,
        user_id = %user_id,
        project_role = project_role.as_str(),
        "project member added"
    );

    project_record(pool, organisation_id, project_id, user_id).await
}

pub async fn remove_project_member(
    pool: &SqlitePool,
    organisation_id: Uuid,
    project_id: Uuid,
    user_id: Uuid,
) -> AppResult<ProjectMembershipRecord> {
    let result = sqlx::query(
        "UPDATE project_members SET is_active = 0, is_default = 0, updated_at = ? \
         WHERE project_id = ? AND user_id = ? AND is_active = 1 \
           AND project_id IN (SELECT id FROM projects WHERE organisation_id = ?)",
    )
    .bind(db_time(utc_now()))
    .bind(project_id.to_string())
    .bind(user_id.to_string())
    .bind(organisation_id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("project membership not found"));
    }

    tracing::info!(project_id = %project_id, user_id = %user_id, "project member removed");
    project_record(pool, organisation_id, project_id, user_id).await
}

/// Returns the record before and after the role change.
pub async fn change_project_role(
    pool: &SqlitePool,
    organisation_id: Uuid,
    project_id: Uuid,
    user_id: Uuid,
    project_role: ProjectRole,
) -> AppResult<(ProjectMembershipRecord, ProjectMembershipRecord)> {
    if !project_in_organisation(pool, organisation_id, project_id).await? {
        return Err(AppError::not_found("project not found"));
    }

    let before = get_project_membership(pool, user_id, project_id)
        .await?
        .filter(|m| m.is_active)
        .ok_or_else(|| AppError::not_found("project membership not found"))?;

    sqlx::query("UPDATE project_members SET project_role = ?, updated_at = ? WHERE id = ?")
        .bind(project_role.as_str())
        .bind(db_time(utc_now()))
        .bind(before.id.to_string())
        .execute(pool)
        .await?;

    let after = project_record(pool, organisation_id, project_id, user_id).await?;
    Ok((ProjectMembershipRecord { organisation_id, membership: before }, after))
}

/// Flags one project of the organisation as the user's default there.
pub async fn set_default_project(pool: &SqlitePool, user_id: Uuid, project_id: Uuid) -> AppResult<()> {
    let mut tx = pool.begin().await?;

    let organisation_id: Option<String> = sqlx::query_scalar(
        "SELECT p.organisation_id FROM project_members pm JOIN projects p ON p.id = pm.project_id AND p.deleted_at IS NULL \
         WHERE pm.user_id = ? AND pm.project_id = ? AND pm.is_active = 1",
    )
    .bind(user_id.to_string())
    .bind(project_id.to_string())
    .fetch_optional(&mut *tx)
    .await?;

    let Some(organisation_id) = organisation_id else {
        tx.rollback().await?;
        return Err(AppError::invalid_tenant_selection("not an active member of that project"));
    };

    sqlx::query(
        "UPDATE project_members SET is_default = CASE WHEN project_id = ? THEN 1 ELSE 0 END \
         WHERE user_id = ? AND project_id IN (SELECT id FROM projects WHERE organisation_id = ?) \
           AND (is_default = 1 OR project_id = ?)",
    )
    .bind(project_id.to_string())
    .bind(user_id.to_string())
    .bind(&organisation_id)
    .bind(project_id.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
