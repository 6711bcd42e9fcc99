use sqlx::SqlitePool;
use uuid::Uuid;

use super::unique_or;
use crate::authz::{OrgRole, Principal};
use crate::db::row_parsers;
use crate::errors::{AppError, AppResult};
use crate::models::membership::OrgMembership;
use crate::models::organisation::{Organisation, OrganisationSettings, OrganisationUpdateRequest};
use crate::store::memberships;
use crate::utils::{db_time, slugify, utc_now, validate_slug};

const ORGANISATION_COLUMNS: &str = "o.id, o.name, o.slug, o.settings, o.is_active, o.created_at, o.updated_at, o.deleted_at";

fn settings_json(settings: &OrganisationSettings) -> AppResult<String> {
    serde_json::to_string(settings).map_err(|e| AppError::internal(format!("failed to encode settings: {e}")))
}

/// Creates the organisation and makes `creator` its first owner, atomically.
///
/// The owner membership becomes the creator's default when they have none yet.
pub async fn create_organisation(
    pool: &SqlitePool,
    creator_id: Uuid,
    name: &str,
    slug: Option<&str>,
    settings: OrganisationSettings,
) -> AppResult<(Organisation, OrgMembership)> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("organisation name is required"));
    }

    let slug = match slug {
        Some(s) => s.trim().to_string(),
        None => slugify(name),
    };
    validate_slug(&slug)?;

    let organisation_id = Uuid::new_v4();
    let now = db_time(utc_now());
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO organisations (id, name, slug, settings, is_active, created_at, updated_at) VALUES (?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(organisation_id.to_string())
    .bind(name)
    .bind(&slug)
    .bind(settings_json(&settings)?)
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await
    .map_err(|e| unique_or(e, "organisation slug already taken"))?;

    sqlx::query(
        "INSERT INTO organisation_members (id, organisation_id, user_id, org_role, is_active, is_default, accepted_at, created_at, updated_at) \
         SELECT ?, ?, ?, ?, 1, \
                NOT EXISTS (SELECT 1 FROM organisation_members WHERE user_id = ? AND is_default = 1 AND is_active = 1), \
                ?, ?, ?",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(organisation_id.to_string())
    .bind(creator_id.to_string())
    .bind(OrgRole::Owner.as_str())
    .bind(creator_id.to_string())
    .bind(&now)
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(organisation_id = %organisation_id, slug = %slug, owner_id = %creator_id, "organisation created");

    let organisation = get_organisation(pool, organisation_id)
        .await?
        .ok_or_else(|| AppError::internal("organisation vanished after insert"))?;
    let owner = memberships::get_org_membership(pool, creator_id, organisation_id)
        .await?
        .ok_or_else(|| AppError::internal("owner membership vanished after insert"))?;

    Ok((organisation, owner))
}

/// Live (not soft-deleted) organisation by id, active or not.
pub async fn get_organisation(pool: &SqlitePool, organisation_id: Uuid) -> AppResult<Option<Organisation>> {
    let sql = format!("SELECT {ORGANISATION_COLUMNS} FROM organisations o WHERE o.id = ? AND o.deleted_at IS NULL");
    let row = sqlx::query(&sql)
        .bind(organisation_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_parsers::organisation_from_row).transpose()
}

/// Organisations the principal belongs to; system admins see all live ones.
pub async fn list_for(pool: &SqlitePool, principal: &Principal) -> AppResult<Vec<Organisation>> {
    let rows = if principal.is_system_admin() {
        let sql = format!("SELECT {ORGANISATION_COLUMNS} FROM organisations o WHERE o.deleted_at IS NULL ORDER BY o.name, o.id");
        sqlx::query(&sql).fetch_all(pool).await?
    } else {
        let sql = format!(
            "SELECT {ORGANISATION_COLUMNS} FROM organisations o \
             JOIN organisation_members om ON om.organisation_id = o.id AND om.user_id = ? AND om.is_active = 1 \
             WHERE o.deleted_at IS NULL AND o.is_active = 1 \
             ORDER BY o.name, o.id"
        );
        sqlx::query(&sql)
            .bind(principal.user_id.to_string())
            .fetch_all(pool)
            .await?
    };

    rows.iter().map(row_parsers::organisation_from_row).collect()
}

/// Returns the organisation before and after the update.
pub async fn update_organisation(
    pool: &SqlitePool,
    organisation_id: Uuid,
    payload: OrganisationUpdateRequest,
) -> AppResult<(Organisation, Organisation)> {
    let before = get_organisation(pool, organisation_id)
        .await?
        .ok_or_else(|| AppError::not_found("organisation not found"))?;

    let name = match payload.name {
        Some(n) if n.trim().is_empty() => return Err(AppError::bad_request("organisation name cannot be empty")),
        Some(n) => n.trim().to_string(),
        None => before.name.clone(),
    };
    let settings = payload.settings.unwrap_or_else(|| before.settings.clone());
    let is_active = payload.is_active.unwrap_or(before.is_active);

    sqlx::query("UPDATE organisations SET name = ?, settings = ?, is_active = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(&name)
        .bind(settings_json(&settings)?)
        .bind(is_active)
        .bind(db_time(utc_now()))
        .bind(organisation_id.to_string())
        .execute(pool)
        .await?;

    let after = get_organisation(pool, organisation_id)
        .await?
        .ok_or_else(|| AppError::not_found("organisation not found"))?;

    Ok((before, after))
}

pub async fn soft_delete_organisation(pool: &SqlitePool, organisation_id: Uuid) -> AppResult<Organisation> {
    let existing = get_organisation(pool, organisation_id)
        .await?
        .ok_or_else(|| AppError::not_found("organisation not found"))?;

    let now = utc_now();
    sqlx::query("UPDATE organisations SET deleted_at = ?, is_active = 0, updated_at = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(db_time(now))
        .bind(db_time(now))
        .bind(organisation_id.to_string())
        .execute(pool)
        .await?;

    tracing::warn!(organisation_id = %organisation_id, "organisation soft-deleted");

    Ok(Organisation {
        is_active: false,
        deleted_at: Some(now),
        updated_at: now,
        ..existing
    })
}
