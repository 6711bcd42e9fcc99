//! In-process decision procedure.
//!
//! This is the mirror of the SQL enforcement in [`super::predicate`]: same
//! steps, same tables, evaluated over a [`MembershipFacts`] snapshot instead
//! of live rows. UI gating and capability listings use it; the parity check
//! in [`super::evaluator::Authorizer`] compares it against the data store.

use super::principal::{Access, Decision, Principal};
use super::roles::{OrgRole, ProjectRole};
use super::tables::{has_org_permission, has_project_permission};

/// Project half of the facts, present only when a project id was supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProjectFacts {
    /// The project exists, is not deleted, and belongs to the organisation asked about.
    pub in_organisation: bool,
    /// Role of an active project membership, if any.
    pub role: Option<ProjectRole>,
}

/// Everything the procedure needs about one (principal, organisation, project?) tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MembershipFacts {
    /// Role of an active membership in a live organisation.
    pub org_role: Option<OrgRole>,
    pub project: Option<ProjectFacts>,
}

impl MembershipFacts {
    pub fn org(org_role: Option<OrgRole>) -> Self {
        Self { org_role, project: None }
    }

    pub fn with_project(mut self, in_organisation: bool, role: Option<ProjectRole>) -> Self {
        self.project = Some(ProjectFacts { in_organisation, role });
        self
    }

    /// Project role usable for step 5: only counts when the project is in the organisation.
    pub fn effective_project_role(&self) -> Option<ProjectRole> {
        self.project
            .filter(|p| p.in_organisation)
            .and_then(|p| p.role)
    }
}

/// Steps 1-5 over a facts snapshot.
pub fn decide(principal: &Principal, facts: &MembershipFacts, access: Access) -> Decision {
    if principal.is_system_admin() {
        return Decision::Allow;
    }
    decide_for_roles(facts, access)
}

/// Steps 2-5 only. Used when evaluating an overlaid role set, where the system
/// admin bypass must not mask the previewed role.
pub fn decide_for_roles(facts: &MembershipFacts, access: Access) -> Decision {
    let Some(org_role) = facts.org_role else {
        return Decision::Deny;
    };

    let allowed = match access {
        Access::Org { resource, action } => has_org_permission(org_role, resource, action),
        Access::ProjectVisibility => match facts.project {
            None => org_role.is_org_admin(),
            Some(project) if !project.in_organisation => false,
            Some(project) => org_role.is_org_admin() || project.role.is_some(),
        },
        Access::Project { resource, action } => match facts.effective_project_role() {
            Some(project_role) => has_project_permission(project_role, resource, action),
            None => false,
        },
    };

    Decision::from_bool(allowed)
}
