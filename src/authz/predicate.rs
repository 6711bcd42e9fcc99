//! Data-store enforcement.
//!
//! Builds the SQL form of the decision procedure. Every grant lookup reads
//! `org_role_grants` / `project_role_grants`, which [`sync_grant_tables`]
//! rewrites from the compiled tables at startup, so the data store and the
//! in-process mirror share one source of truth.

use sqlx::SqlitePool;
use uuid::Uuid;

use super::principal::Access;
use super::roles::{OrgRole, SystemRole};
use super::tables::grant_rows;

/// A SQL fragment with its positional binds, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    pub sql: String,
    pub binds: Vec<Option<String>>,
}

impl Predicate {
    fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), binds: Vec::new() }
    }

    fn bind(mut self, value: impl Into<String>) -> Self {
        self.binds.push(Some(value.into()));
        self
    }

    fn bind_opt(mut self, value: Option<String>) -> Self {
        self.binds.push(value);
        self
    }
}

/// `('owner','admin')`, derived from [`OrgRole::is_org_admin`].
fn org_admin_roles_sql() -> String {
    let roles: Vec<String> = OrgRole::ALL
        .iter()
        .filter(|role| role.is_org_admin())
        .map(|role| format!("'{}'", role.as_str()))
        .collect();
    format!("({})", roles.join(", "))
}

fn system_admin_sql(user_alias: &str) -> String {
    format!("{user_alias}.system_role = '{}'", SystemRole::SystemAdmin.as_str())
}

/// Steps 3-5 for an already-joined `om` / `p` / `pm` row set.
fn access_clause(access: Access, project_requested: bool) -> Predicate {
    match access {
        Access::Org { resource, action } => Predicate::new(
            "EXISTS (SELECT 1 FROM org_role_grants g \
             WHERE g.org_role = om.org_role AND g.resource = ? AND g.action = ?)",
        )
        .bind(resource.as_str())
        .bind(action.as_str()),
        Access::ProjectVisibility if !project_requested => {
            Predicate::new(format!("om.org_role IN {}", org_admin_roles_sql()))
        }
        Access::ProjectVisibility => Predicate::new(format!(
            "(p.id IS NOT NULL AND (om.org_role IN {} OR pm.id IS NOT NULL))",
            org_admin_roles_sql()
        )),
        Access::Project { resource, action } => Predicate::new(
            "(pm.id IS NOT NULL AND EXISTS (SELECT 1 FROM project_role_grants g \
             WHERE g.project_role = pm.project_role AND g.resource = ? AND g.action = ?))",
        )
        .bind(resource.as_str())
        .bind(action.as_str()),
    }
}

/// One-row query answering `decide(user, organisation, project?, access)` as 0/1.
///
/// Returns no row when the user does not exist (treated as Deny).
pub fn decision_query(user_id: Uuid, organisation_id: Uuid, project_id: Option<Uuid>, access: Access) -> Predicate {
    let clause = access_clause(access, project_id.is_some());
    let sql = format!(
        "SELECT CASE \
            WHEN {sysadmin} THEN 1 \
            WHEN om.id IS NULL THEN 0 \
            WHEN {clause} THEN 1 \
            ELSE 0 END AS allowed \
         FROM users u \
         LEFT JOIN organisations o ON o.id = ? AND o.deleted_at IS NULL AND o.is_active = 1 \
         LEFT JOIN organisation_members om ON om.organisation_id = o.id AND om.user_id = u.id AND om.is_active = 1 \
         LEFT JOIN projects p ON p.id = ? AND p.organisation_id = o.id AND p.deleted_at IS NULL \
         LEFT JOIN project_members pm ON pm.project_id = p.id AND pm.user_id = u.id AND pm.is_active = 1 \
         WHERE u.id = ? AND u.deleted_at IS NULL",
        sysadmin = system_admin_sql("u"),
        clause = clause.sql,
    );

    let mut predicate = Predicate::new(sql);
    predicate.binds = clause.binds;
    predicate
        .bind(organisation_id.to_string())
        .bind_opt(project_id.map(|id| id.to_string()))
        .bind(user_id.to_string())
}

/// Row filter for `projects p` implementing step 4 for one user and organisation.
///
/// Callers select from `projects p` and append this after `WHERE`.
pub fn visible_projects_clause(user_id: Uuid, organisation_id: Uuid) -> Predicate {
    Predicate::new(format!(
        "p.organisation_id = ? AND p.deleted_at IS NULL AND EXISTS (\
            SELECT 1 FROM users u \
            JOIN organisations o ON o.id = p.organisation_id AND o.deleted_at IS NULL AND o.is_active = 1 \
            LEFT JOIN organisation_members om ON om.organisation_id = o.id AND om.user_id = u.id AND om.is_active = 1 \
            LEFT JOIN project_members pm ON pm.project_id = p.id AND pm.user_id = u.id AND pm.is_active = 1 \
            WHERE u.id = ? AND u.deleted_at IS NULL \
              AND ({sysadmin} OR (om.id IS NOT NULL AND (om.org_role IN {admins} OR pm.id IS NOT NULL))))",
        sysadmin = system_admin_sql("u"),
        admins = org_admin_roles_sql(),
    ))
    .bind(organisation_id.to_string())
    .bind(user_id.to_string())
}

/// Row filter for any business-entity table carrying a `project_id` column.
///
/// `project_column` is the qualified column (e.g. `m.project_id`). Rows the user
/// may not access under step 5 simply do not match, so reads filter silently.
pub fn project_rows_clause(project_column: &str, user_id: Uuid, access: Access) -> Predicate {
    let Access::Project { resource, action } = access else {
        // only project-scoped data lives in entity tables
        return Predicate::new("0");
    };

    Predicate::new(format!(
        "EXISTS (\
            SELECT 1 FROM users u \
            JOIN projects p ON p.id = {project_column} AND p.deleted_at IS NULL \
            JOIN organisations o ON o.id = p.organisation_id AND o.deleted_at IS NULL AND o.is_active = 1 \
            LEFT JOIN organisation_members om ON om.organisation_id = o.id AND om.user_id = u.id AND om.is_active = 1 \
            LEFT JOIN project_members pm ON pm.project_id = p.id AND pm.user_id = u.id AND pm.is_active = 1 \
            WHERE u.id = ? AND u.deleted_at IS NULL \
              AND ({sysadmin} OR (om.id IS NOT NULL AND pm.id IS NOT NULL AND EXISTS (\
                    SELECT 1 FROM project_role_grants g \
                    WHERE g.project_role = pm.project_role AND g.resource = ? AND g.action = ?))))",
        sysadmin = system_admin_sql("u"),
    ))
    .bind(user_id.to_string())
    .bind(resource.as_str())
    .bind(action.as_str())
}

/// Rewrites the grant tables from the compiled permission tables.
pub async fn sync_grant_tables(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let (org_rows, project_rows) = grant_rows();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM org_role_grants").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM project_role_grants").execute(&mut *tx).await?;

    for row in &org_rows {
        sqlx::query("INSERT INTO org_role_grants (org_role, resource, action) VALUES (?, ?, ?)")
            .bind(row.role)
            .bind(row.resource)
            .bind(row.action)
            .execute(&mut *tx)
            .await?;
    }

    for row in &project_rows {
        sqlx::query("INSERT INTO project_role_grants (project_role, resource, action) VALUES (?, ?, ?)")
            .bind(row.role)
            .bind(row.resource)
            .bind(row.action)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    tracing::info!(
        org_grants = org_rows.len(),
        project_grants = project_rows.len(),
        "permission tables synchronised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::tables::{OrgAction, OrgResource, ProjectAction, ProjectResource};

    #[test]
    fn org_admin_roles_come_from_role_enum() {
        assert_eq!(org_admin_roles_sql(), "('owner', 'admin')");
    }

    #[test]
    fn decision_query_binds_in_placeholder_order() {
        let user = Uuid::new_v4();
        let org = Uuid::new_v4();
        let q = decision_query(user, org, None, Access::org(OrgResource::Billing, OrgAction::Edit));

        assert_eq!(q.sql.matches('?').count(), q.binds.len());
        assert_eq!(q.binds[0].as_deref(), Some("billing"));
        assert_eq!(q.binds[1].as_deref(), Some("edit"));
        assert_eq!(q.binds[2], Some(org.to_string()));
        assert_eq!(q.binds[3], None);
        assert_eq!(q.binds[4], Some(user.to_string()));
    }

    #[test]
    fn project_rows_clause_binds_match_placeholders() {
        let q = project_rows_clause(
            "m.project_id",
            Uuid::new_v4(),
            Access::project(ProjectResource::Milestones, ProjectAction::View),
        );
        assert_eq!(q.sql.matches('?').count(), q.binds.len());
        assert!(q.sql.contains("m.project_id"));
    }

    #[test]
    fn non_project_access_matches_no_rows() {
        let q = project_rows_clause("m.project_id", Uuid::new_v4(), Access::ProjectVisibility);
        assert_eq!(q.sql, "0");
        assert!(q.binds.is_empty());
    }
}
