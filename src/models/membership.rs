use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::authz::{OrgRole, ProjectRole};
use crate::events::{Loggable, Severity};

// =============================================================================
// ORGANISATION MEMBERSHIP
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct OrgMembership {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub user_id: Uuid,
    pub org_role: OrgRole,
    pub is_active: bool,
    pub is_default: bool,
    pub invited_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loggable for OrgMembership {
    fn entity_type() -> &'static str { "organisation_member" }
    fn subject_id(&self) -> Uuid { self.user_id }
    fn organisation_id(&self) -> Option<Uuid> { Some(self.organisation_id) }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddOrgMemberRequest {
    pub user_id: Uuid,
    pub org_role: OrgRole,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangeOrgRoleRequest {
    pub org_role: OrgRole,
}

/// Roster entry joined with the member's public profile.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrgMemberView {
    #[serde(flatten)]
    pub membership: OrgMembership,
    pub name: String,
    pub email: String,
}

// =============================================================================
// INVITATION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Invitation {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub email: String,
    pub org_role: OrgRole,
    pub invited_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Loggable for Invitation {
    fn entity_type() -> &'static str { "invitation" }
    fn subject_id(&self) -> Uuid { self.id }
    fn organisation_id(&self) -> Option<Uuid> { Some(self.organisation_id) }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct InviteMemberRequest {
    #[schema(example = "carol@example.com")]
    pub email: String,
    pub org_role: OrgRole,
}

/// Returned once to the inviter; only the token hash is stored.
#[derive(Debug, Serialize, ToSchema)]
pub struct InvitationCreated {
    pub invitation: Invitation,
    pub token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AcceptInvitationRequest {
    pub token: String,
}

// =============================================================================
// PROJECT MEMBERSHIP
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct ProjectMembership {
    pub id: Uuid,
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub project_role: ProjectRole,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit wrapper carrying the owning organisation alongside the membership.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProjectMembershipRecord {
    pub organisation_id: Uuid,
    #[serde(flatten)]
    pub membership: ProjectMembership,
}

impl Loggable for ProjectMembershipRecord {
    fn entity_type() -> &'static str { "project_member" }
    fn subject_id(&self) -> Uuid { self.membership.user_id }
    fn organisation_id(&self) -> Option<Uuid> { Some(self.organisation_id) }
    fn severity(&self) -> Severity { Severity::Critical }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddProjectMemberRequest {
    pub user_id: Uuid,
    pub project_role: ProjectRole,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangeProjectRoleRequest {
    pub project_role: ProjectRole,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProjectMemberView {
    #[serde(flatten)]
    pub membership: ProjectMembership,
    pub name: String,
    pub email: String,
}
