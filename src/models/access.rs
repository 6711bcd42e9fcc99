use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::authz::{Access, Decision, OrgAction, OrgResource, ProjectAction, ProjectResource};

#[derive(Debug, Deserialize, ToSchema)]
pub struct DecideRequest {
    pub organisation_id: Uuid,
    pub project_id: Option<Uuid>,
    /// `{"scope": "org", "resource": "members", "action": "invite"}`,
    /// `{"scope": "project_visibility"}` or
    /// `{"scope": "project", "resource": "milestones", "action": "view"}`.
    #[schema(value_type = Object)]
    pub access: Access,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DecideResponse {
    pub decision: Decision,
    pub access: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrgCapability {
    pub resource: OrgResource,
    pub actions: Vec<OrgAction>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProjectCapability {
    pub resource: ProjectResource,
    pub actions: Vec<ProjectAction>,
}

/// Controls the presentation layer may show in the current context.
///
/// Never wider than the real roles allow, whatever overlay is active.
#[derive(Debug, Serialize, ToSchema)]
pub struct CapabilitiesResponse {
    pub organisation_id: Uuid,
    pub project_id: Option<Uuid>,
    pub impersonating: bool,
    pub can_view_project: bool,
    pub organisation: Vec<OrgCapability>,
    pub project: Vec<ProjectCapability>,
}
