use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::authz::{OrgRole, ProjectRole};
use crate::tenant::ImpersonationOverlay;

#[derive(Debug, Deserialize, ToSchema)]
pub struct SwitchOrganisationRequest {
    pub organisation_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SwitchProjectRequest {
    pub project_id: Uuid,
}

/// Roles to preview. An omitted axis is not overlaid.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ViewAsRequest {
    pub org_role: Option<OrgRole>,
    pub project_role: Option<ProjectRole>,
}

/// `applied` is false when the request was refused; the overlay is then unchanged.
#[derive(Debug, Serialize, ToSchema)]
pub struct ViewAsResponse {
    pub applied: bool,
    pub overlay: ImpersonationOverlay,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
