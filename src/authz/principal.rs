use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::roles::SystemRole;
use super::tables::{OrgAction, OrgResource, ProjectAction, ProjectResource};

/// Principal represents the authenticated user as seen by the decision procedure.
///
/// The system role is always loaded from the database for the current request,
/// never taken from token claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    pub system_role: SystemRole,
}

impl Principal {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            system_role: SystemRole::User,
        }
    }

    pub fn with_system_role(mut self, system_role: SystemRole) -> Self {
        self.system_role = system_role;
        self
    }

    pub fn is_system_admin(&self) -> bool {
        self.system_role == SystemRole::SystemAdmin
    }
}

/// Tenant coordinates of a decision: always an organisation, optionally a project in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceContext {
    pub organisation_id: Uuid,
    pub project_id: Option<Uuid>,
}

impl ResourceContext {
    pub fn organisation(organisation_id: Uuid) -> Self {
        Self {
            organisation_id,
            project_id: None,
        }
    }

    pub fn with_project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }
}

/// What is being attempted, typed per table so an organisation action can never
/// be paired with a project resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Access {
    /// Organisation-scoped resource.
    Org { resource: OrgResource, action: OrgAction },
    /// "Does this project exist / may it be listed".
    ProjectVisibility,
    /// Project-scoped business data.
    Project { resource: ProjectResource, action: ProjectAction },
}

impl Access {
    pub fn org(resource: OrgResource, action: OrgAction) -> Self {
        Access::Org { resource, action }
    }

    pub fn project(resource: ProjectResource, action: ProjectAction) -> Self {
        Access::Project { resource, action }
    }

    /// Stable label used in logs, audit payloads and cache keys.
    pub fn label(&self) -> String {
        match self {
            Access::Org { resource, action } => format!("org:{}.{}", resource.as_str(), action.as_str()),
            Access::ProjectVisibility => "project:visibility".to_string(),
            Access::Project { resource, action } => {
                format!("project:{}.{}", resource.as_str(), action.as_str())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown access label: {0}")]
pub struct UnknownAccess(pub String);

impl FromStr for Access {
    type Err = UnknownAccess;

    /// Parses the form produced by [`Access::label`].
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let unknown = || UnknownAccess(value.to_string());
        if value == "project:visibility" {
            return Ok(Access::ProjectVisibility);
        }

        let (scope, rest) = value.split_once(':').ok_or_else(unknown)?;
        let (resource, action) = rest.split_once('.').ok_or_else(unknown)?;
        match scope {
            "org" => {
                let resource = OrgResource::ALL.into_iter().find(|r| r.as_str() == resource).ok_or_else(unknown)?;
                let action = OrgAction::ALL.into_iter().find(|a| a.as_str() == action).ok_or_else(unknown)?;
                Ok(Access::org(resource, action))
            }
            "project" => {
                let resource = ProjectResource::ALL
                    .into_iter()
                    .find(|r| r.as_str() == resource)
                    .ok_or_else(unknown)?;
                let action = ProjectAction::ALL.into_iter().find(|a| a.as_str() == action).ok_or_else(unknown)?;
                Ok(Access::project(resource, action))
            }
            _ => Err(unknown()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn from_bool(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    pub fn is_allow(&self) -> bool {
        *self == Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_back() {
        let access: Access = "org:members.invite".parse().unwrap();
        assert_eq!(access, Access::org(OrgResource::Members, OrgAction::Invite));

        let access: Access = "project:financial_docs.sign".parse().unwrap();
        assert_eq!(access, Access::project(ProjectResource::FinancialDocs, ProjectAction::Sign));

        assert_eq!("project:visibility".parse::<Access>().unwrap(), Access::ProjectVisibility);
    }

    #[test]
    fn cross_table_pairs_are_rejected() {
        assert!("org:milestones.view".parse::<Access>().is_err());
        assert!("project:billing.view".parse::<Access>().is_err());
        assert!("members.invite".parse::<Access>().is_err());
    }
}
