//! Closed role types for the three authorization axes.
//!
//! Roles are parsed from their storage names exactly once, at the database or
//! request boundary. An unknown name is an error, never an empty grant set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown {axis} role: {value}")]
pub struct UnknownRole {
    pub axis: &'static str,
    pub value: String,
}

/// Platform-wide role carried by every principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SystemRole {
    /// Platform operator; satisfies every check.
    SystemAdmin,
    User,
}

impl SystemRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemRole::SystemAdmin => "system_admin",
            SystemRole::User => "user",
        }
    }
}

impl Default for SystemRole {
    fn default() -> Self {
        SystemRole::User
    }
}

impl FromStr for SystemRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system_admin" => Ok(SystemRole::SystemAdmin),
            "user" => Ok(SystemRole::User),
            other => Err(UnknownRole { axis: "system", value: other.to_string() }),
        }
    }
}

/// Role held inside one organisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrgRole {
    Owner,
    Admin,
    Member,
}

impl OrgRole {
    pub const ALL: [OrgRole; 3] = [OrgRole::Owner, OrgRole::Admin, OrgRole::Member];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrgRole::Owner => "owner",
            OrgRole::Admin => "admin",
            OrgRole::Member => "member",
        }
    }

    /// Owners and admins see every project of the organisation.
    pub fn is_org_admin(&self) -> bool {
        matches!(self, OrgRole::Owner | OrgRole::Admin)
    }

    /// True when every organisation grant of `self` is also held by `other`.
    pub fn is_subsumed_by(&self, other: OrgRole) -> bool {
        super::tables::org_grant_iter(*self)
            .all(|(resource, action)| super::tables::has_org_permission(other, resource, action))
    }
}

impl FromStr for OrgRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(OrgRole::Owner),
            "admin" => Ok(OrgRole::Admin),
            "member" => Ok(OrgRole::Member),
            other => Err(UnknownRole { axis: "organisation", value: other.to_string() }),
        }
    }
}

/// Role held inside one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProjectRole {
    Admin,
    SupplierPm,
    CustomerPm,
    Contributor,
    Viewer,
}

impl ProjectRole {
    pub const ALL: [ProjectRole; 5] = [
        ProjectRole::Admin,
        ProjectRole::SupplierPm,
        ProjectRole::CustomerPm,
        ProjectRole::Contributor,
        ProjectRole::Viewer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectRole::Admin => "admin",
            ProjectRole::SupplierPm => "supplier_pm",
            ProjectRole::CustomerPm => "customer_pm",
            ProjectRole::Contributor => "contributor",
            ProjectRole::Viewer => "viewer",
        }
    }

    /// Roles allowed to preview the project as someone else.
    pub fn can_preview_roles(&self) -> bool {
        matches!(self, ProjectRole::Admin | ProjectRole::SupplierPm)
    }

    /// True when every project grant of `self` is also held by `other`.
    pub fn is_subsumed_by(&self, other: ProjectRole) -> bool {
        super::tables::project_grant_iter(*self)
            .all(|(resource, action)| super::tables::has_project_permission(other, resource, action))
    }
}

impl FromStr for ProjectRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(ProjectRole::Admin),
            "supplier_pm" => Ok(ProjectRole::SupplierPm),
            "customer_pm" => Ok(ProjectRole::CustomerPm),
            "contributor" => Ok(ProjectRole::Contributor),
            "viewer" => Ok(ProjectRole::Viewer),
            other => Err(UnknownRole { axis: "project", value: other.to_string() }),
        }
    }
}

impl fmt::Display for SystemRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for OrgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ProjectRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_storage_names() {
        for role in OrgRole::ALL {
            assert_eq!(role.as_str().parse::<OrgRole>().unwrap(), role);
        }
        for role in ProjectRole::ALL {
            assert_eq!(role.as_str().parse::<ProjectRole>().unwrap(), role);
        }
    }

    #[test]
    fn misspelled_role_is_rejected() {
        let err = "ownr".parse::<OrgRole>().unwrap_err();
        assert_eq!(err.axis, "organisation");
        assert!("Viewer".parse::<ProjectRole>().is_err());
        assert!("superuser".parse::<SystemRole>().is_err());
    }

    #[test]
    fn org_subsumption_follows_hierarchy() {
        assert!(OrgRole::Member.is_subsumed_by(OrgRole::Admin));
        assert!(OrgRole::Admin.is_subsumed_by(OrgRole::Owner));
        assert!(!OrgRole::Owner.is_subsumed_by(OrgRole::Admin));
        assert!(!OrgRole::Admin.is_subsumed_by(OrgRole::Member));
    }

    #[test]
    fn project_subsumption_uses_grants() {
        for role in ProjectRole::ALL {
            assert!(role.is_subsumed_by(ProjectRole::Admin));
        }
        for role in [ProjectRole::SupplierPm, ProjectRole::CustomerPm] {
            assert!(ProjectRole::Viewer.is_subsumed_by(role));
        }
        // contributors never see financial documents, viewers do
        assert!(!ProjectRole::Viewer.is_subsumed_by(ProjectRole::Contributor));
        assert!(ProjectRole::CustomerPm.is_subsumed_by(ProjectRole::SupplierPm));
        assert!(!ProjectRole::SupplierPm.is_subsumed_by(ProjectRole::CustomerPm));
        assert!(!ProjectRole::Contributor.is_subsumed_by(ProjectRole::CustomerPm));
    }
}
