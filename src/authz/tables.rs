//! Static permission tables.
//!
//! Both tables are exhaustive `match`es over (role, resource) with no wildcard
//! arm: adding a role or resource does not compile until its row is written.
//! The SQL enforcement reads the same rows after [`grant_rows`] materialises
//! them into `org_role_grants` / `project_role_grants`.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::roles::{OrgRole, ProjectRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrgResource {
    Organisation,
    Members,
    Settings,
    Billing,
    OrgProjects,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrgAction {
    View,
    Create,
    Edit,
    Delete,
    Manage,
    Invite,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProjectResource {
    Dashboard,
    Milestones,
    Deliverables,
    Resources,
    Timesheets,
    Expenses,
    FinancialDocs,
    ProjectSettings,
    Team,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProjectAction {
    View,
    Create,
    Edit,
    Delete,
    Submit,
    Approve,
    Sign,
    Export,
}

impl OrgResource {
    pub const ALL: [OrgResource; 5] = [
        OrgResource::Organisation,
        OrgResource::Members,
        OrgResource::Settings,
        OrgResource::Billing,
        OrgResource::OrgProjects,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrgResource::Organisation => "organisation",
            OrgResource::Members => "members",
            OrgResource::Settings => "settings",
            OrgResource::Billing => "billing",
            OrgResource::OrgProjects => "org_projects",
        }
    }
}

impl OrgAction {
    pub const ALL: [OrgAction; 7] = [
        OrgAction::View,
        OrgAction::Create,
        OrgAction::Edit,
        OrgAction::Delete,
        OrgAction::Manage,
        OrgAction::Invite,
        OrgAction::Remove,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrgAction::View => "view",
            OrgAction::Create => "create",
            OrgAction::Edit => "edit",
            OrgAction::Delete => "delete",
            OrgAction::Manage => "manage",
            OrgAction::Invite => "invite",
            OrgAction::Remove => "remove",
        }
    }
}

impl ProjectResource {
    pub const ALL: [ProjectResource; 9] = [
        ProjectResource::Dashboard,
        ProjectResource::Milestones,
        ProjectResource::Deliverables,
        ProjectResource::Resources,
        ProjectResource::Timesheets,
        ProjectResource::Expenses,
        ProjectResource::FinancialDocs,
        ProjectResource::ProjectSettings,
        ProjectResource::Team,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectResource::Dashboard => "dashboard",
            ProjectResource::Milestones => "milestones",
            ProjectResource::Deliverables => "deliverables",
            ProjectResource::Resources => "resources",
            ProjectResource::Timesheets => "timesheets",
            ProjectResource::Expenses => "expenses",
            ProjectResource::FinancialDocs => "financial_docs",
            ProjectResource::ProjectSettings => "project_settings",
            ProjectResource::Team => "team",
        }
    }
}

impl ProjectAction {
    pub const ALL: [ProjectAction; 8] = [
        ProjectAction::View,
        ProjectAction::Create,
        ProjectAction::Edit,
        ProjectAction::Delete,
        ProjectAction::Submit,
        ProjectAction::Approve,
        ProjectAction::Sign,
        ProjectAction::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectAction::View => "view",
            ProjectAction::Create => "create",
            ProjectAction::Edit => "edit",
            ProjectAction::Delete => "delete",
            ProjectAction::Submit => "submit",
            ProjectAction::Approve => "approve",
            ProjectAction::Sign => "sign",
            ProjectAction::Export => "export",
        }
    }
}

use OrgAction as OA;
use ProjectAction as PA;

const NONE_ORG: &[OrgAction] = &[];
const NONE_PROJECT: &[ProjectAction] = &[];

/// Organisation table row for `(role, resource)`.
pub fn org_grants(role: OrgRole, resource: OrgResource) -> &'static [OrgAction] {
    use OrgResource as R;
    match (role, resource) {
        (OrgRole::Owner, R::Organisation) => &[OA::View, OA::Edit, OA::Delete, OA::Manage],
        (OrgRole::Owner, R::Members) => &[OA::View, OA::Edit, OA::Manage, OA::Invite, OA::Remove],
        (OrgRole::Owner, R::Settings) => &[OA::View, OA::Edit, OA::Manage],
        (OrgRole::Owner, R::Billing) => &[OA::View, OA::Edit, OA::Manage],
        (OrgRole::Owner, R::OrgProjects) => &[OA::View, OA::Create, OA::Edit, OA::Delete, OA::Manage],

        (OrgRole::Admin, R::Organisation) => &[OA::View, OA::Edit],
        (OrgRole::Admin, R::Members) => &[OA::View, OA::Edit, OA::Invite, OA::Remove],
        (OrgRole::Admin, R::Settings) => &[OA::View, OA::Edit],
        (OrgRole::Admin, R::Billing) => &[OA::View],
        (OrgRole::Admin, R::OrgProjects) => &[OA::View, OA::Create, OA::Edit, OA::Delete, OA::Manage],

        (OrgRole::Member, R::Organisation) => &[OA::View],
        (OrgRole::Member, R::Members) => &[OA::View],
        (OrgRole::Member, R::Settings) => NONE_ORG,
        (OrgRole::Member, R::Billing) => NONE_ORG,
        (OrgRole::Member, R::OrgProjects) => &[OA::View],
    }
}

/// Project table row for `(role, resource)`.
pub fn project_grants(role: ProjectRole, resource: ProjectResource) -> &'static [ProjectAction] {
    use ProjectResource as R;
    use ProjectRole as P;
    const ALL: &[ProjectAction] = &ProjectAction::ALL;
    const VIEW: &[ProjectAction] = &[PA::View];

    match (role, resource) {
        (P::Admin, R::Dashboard) => ALL,
        (P::Admin, R::Milestones) => ALL,
        (P::Admin, R::Deliverables) => ALL,
        (P::Admin, R::Resources) => ALL,
        (P::Admin, R::Timesheets) => ALL,
        (P::Admin, R::Expenses) => ALL,
        (P::Admin, R::FinancialDocs) => ALL,
        (P::Admin, R::ProjectSettings) => ALL,
        (P::Admin, R::Team) => ALL,

        (P::SupplierPm, R::Dashboard) => &[PA::View, PA::Export],
        (P::SupplierPm, R::Milestones) => &[PA::View, PA::Create, PA::Edit, PA::Delete, PA::Sign, PA::Export],
        (P::SupplierPm, R::Deliverables) => &[
            PA::View,
            PA::Create,
            PA::Edit,
            PA::Delete,
            PA::Submit,
            PA::Approve,
            PA::Sign,
            PA::Export,
        ],
        (P::SupplierPm, R::Resources) => &[PA::View, PA::Create, PA::Edit, PA::Delete, PA::Export],
        (P::SupplierPm, R::Timesheets) => &[PA::View, PA::Create, PA::Edit, PA::Submit, PA::Approve, PA::Export],
        (P::SupplierPm, R::Expenses) => &[PA::View, PA::Create, PA::Edit, PA::Submit, PA::Approve, PA::Export],
        (P::SupplierPm, R::FinancialDocs) => &[PA::View, PA::Create, PA::Edit, PA::Export],
        (P::SupplierPm, R::ProjectSettings) => &[PA::View, PA::Edit],
        (P::SupplierPm, R::Team) => &[PA::View, PA::Edit],

        (P::CustomerPm, R::Dashboard) => &[PA::View, PA::Export],
        (P::CustomerPm, R::Milestones) => &[PA::View, PA::Sign, PA::Export],
        (P::CustomerPm, R::Deliverables) => &[PA::View, PA::Approve, PA::Sign, PA::Export],
        (P::CustomerPm, R::Resources) => VIEW,
        (P::CustomerPm, R::Timesheets) => &[PA::View, PA::Approve],
        (P::CustomerPm, R::Expenses) => &[PA::View, PA::Approve],
        (P::CustomerPm, R::FinancialDocs) => &[PA::View, PA::Export],
        (P::CustomerPm, R::ProjectSettings) => VIEW,
        (P::CustomerPm, R::Team) => VIEW,

        (P::Contributor, R::Dashboard) => VIEW,
        (P::Contributor, R::Milestones) => VIEW,
        (P::Contributor, R::Deliverables) => &[PA::View, PA::Edit, PA::Submit],
        (P::Contributor, R::Resources) => VIEW,
        (P::Contributor, R::Timesheets) => &[PA::View, PA::Create, PA::Edit, PA::Submit],
        (P::Contributor, R::Expenses) => &[PA::View, PA::Create, PA::Edit, PA::Submit],
        (P::Contributor, R::FinancialDocs) => NONE_PROJECT,
        (P::Contributor, R::ProjectSettings) => NONE_PROJECT,
        (P::Contributor, R::Team) => VIEW,

        (P::Viewer, R::Dashboard) => VIEW,
        (P::Viewer, R::Milestones) => VIEW,
        (P::Viewer, R::Deliverables) => VIEW,
        (P::Viewer, R::Resources) => VIEW,
        (P::Viewer, R::Timesheets) => VIEW,
        (P::Viewer, R::Expenses) => VIEW,
        (P::Viewer, R::FinancialDocs) => VIEW,
        (P::Viewer, R::ProjectSettings) => VIEW,
        (P::Viewer, R::Team) => VIEW,
    }
}

pub fn has_org_permission(role: OrgRole, resource: OrgResource, action: OrgAction) -> bool {
    org_grants(role, resource).contains(&action)
}

pub fn has_project_permission(role: ProjectRole, resource: ProjectResource, action: ProjectAction) -> bool {
    project_grants(role, resource).contains(&action)
}

pub(crate) fn org_grant_iter(role: OrgRole) -> impl Iterator<Item = (OrgResource, OrgAction)> {
    OrgResource::ALL
        .into_iter()
        .flat_map(move |resource| org_grants(role, resource).iter().map(move |action| (resource, *action)))
}

pub(crate) fn project_grant_iter(role: ProjectRole) -> impl Iterator<Item = (ProjectResource, ProjectAction)> {
    ProjectResource::ALL
        .into_iter()
        .flat_map(move |resource| project_grants(role, resource).iter().map(move |action| (resource, *action)))
}

/// A single allowed (role, resource, action) triple, as stored in the grant tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantRow {
    pub role: &'static str,
    pub resource: &'static str,
    pub action: &'static str,
}

/// Every `true` cell of both tables as (org rows, project rows).
pub fn grant_rows() -> (Vec<GrantRow>, Vec<GrantRow>) {
    let org = OrgRole::ALL
        .into_iter()
        .flat_map(|role| {
            org_grant_iter(role).map(move |(resource, action)| GrantRow {
                role: role.as_str(),
                resource: resource.as_str(),
                action: action.as_str(),
            })
        })
        .collect();

    let project = ProjectRole::ALL
        .into_iter()
        .flat_map(|role| {
            project_grant_iter(role).map(move |(resource, action)| GrantRow {
                role: role.as_str(),
                resource: resource.as_str(),
                action: action.as_str(),
            })
        })
        .collect();

    (org, project)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_owner_edits_billing_or_deletes_organisation() {
        for role in OrgRole::ALL {
            let expected = role == OrgRole::Owner;
            assert_eq!(has_org_permission(role, OrgResource::Billing, OrgAction::Edit), expected);
            assert_eq!(has_org_permission(role, OrgResource::Organisation, OrgAction::Delete), expected);
            assert_eq!(has_org_permission(role, OrgResource::Members, OrgAction::Manage), expected);
        }
    }

    #[test]
    fn admin_invites_and_removes_members() {
        assert!(has_org_permission(OrgRole::Admin, OrgResource::Members, OrgAction::Invite));
        assert!(has_org_permission(OrgRole::Admin, OrgResource::Members, OrgAction::Remove));
        assert!(!has_org_permission(OrgRole::Member, OrgResource::Members, OrgAction::Invite));
    }

    #[test]
    fn viewer_reads_everything_and_writes_nothing() {
        for resource in ProjectResource::ALL {
            for action in ProjectAction::ALL {
                let expected = action == ProjectAction::View;
                assert_eq!(
                    has_project_permission(ProjectRole::Viewer, resource, action),
                    expected,
                    "viewer {:?} {:?}",
                    resource,
                    action
                );
            }
        }
    }

    #[test]
    fn project_admin_holds_every_action() {
        for resource in ProjectResource::ALL {
            for action in ProjectAction::ALL {
                assert!(has_project_permission(ProjectRole::Admin, resource, action));
            }
        }
    }

    #[test]
    fn table_rows_have_no_duplicates() {
        for role in OrgRole::ALL {
            for resource in OrgResource::ALL {
                let row = org_grants(role, resource);
                let mut seen = std::collections::HashSet::new();
                assert!(row.iter().all(|a| seen.insert(*a)), "{role} {resource:?}");
            }
        }
        for role in ProjectRole::ALL {
            for resource in ProjectResource::ALL {
                let row = project_grants(role, resource);
                let mut seen = std::collections::HashSet::new();
                assert!(row.iter().all(|a| seen.insert(*a)), "{role} {resource:?}");
            }
        }
    }

    #[test]
    fn grant_rows_match_lookup() {
        let (org, project) = grant_rows();
        let org_cells: usize = OrgRole::ALL.iter().map(|r| org_grant_iter(*r).count()).sum();
        let project_cells: usize = ProjectRole::ALL.iter().map(|r| project_grant_iter(*r).count()).sum();
        assert_eq!(org.len(), org_cells);
        assert_eq!(project.len(), project_cells);
        assert!(org.contains(&GrantRow { role: "owner", resource: "billing", action: "edit" }));
        assert!(!project.iter().any(|row| row.role == "viewer" && row.action != "view"));
    }
}
