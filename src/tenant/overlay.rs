//! "View as" overlay.
//!
//! A session may preview a lower organisation or project role. The overlay
//! only narrows what the presentation layer shows: [`gate`] intersects the
//! previewed decision with the real one, and the data-store evaluator never
//! sees the overlay at all.

use serde::Serialize;
use utoipa::ToSchema;

use crate::authz::{decide, decide_for_roles, Access, Decision, MembershipFacts, OrgRole, Principal, ProjectRole, SystemRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ToSchema)]
pub struct ImpersonationOverlay {
    pub org_role: Option<OrgRole>,
    pub project_role: Option<ProjectRole>,
}

impl ImpersonationOverlay {
    pub fn new(org_role: Option<OrgRole>, project_role: Option<ProjectRole>) -> Self {
        Self { org_role, project_role }
    }

    pub fn is_active(&self) -> bool {
        self.org_role.is_some() || self.project_role.is_some()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn clear_project(&mut self) {
        self.project_role = None;
    }

    /// Facts with the overlaid roles substituted for the real ones.
    pub fn apply(&self, facts: &MembershipFacts) -> MembershipFacts {
        let mut effective = *facts;
        effective.org_role = effective_org_role(self, facts.org_role);
        if let Some(project) = effective.project.as_mut() {
            project.role = effective_project_role(self, project.role);
        }
        effective
    }
}

/// Roles the session actually holds in its current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealRoles {
    pub system_role: SystemRole,
    pub org_role: Option<OrgRole>,
    pub project_role: Option<ProjectRole>,
    /// A project is selected, so a project-axis overlay has something to apply to.
    pub project_selected: bool,
}

impl RealRoles {
    fn is_system_admin(&self) -> bool {
        self.system_role == SystemRole::SystemAdmin
    }

    fn is_org_admin(&self) -> bool {
        self.org_role.is_some_and(|role| role.is_org_admin())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OverlayRejection {
    #[error("current roles may not preview other roles")]
    NotPermitted,
    #[error("requested role is not a downgrade of the current role")]
    Escalation,
    #[error("overlay no longer permitted by current roles")]
    Stale,
}

pub fn can_set_org_overlay(real: &RealRoles) -> bool {
    real.is_system_admin() || real.is_org_admin()
}

pub fn can_set_project_overlay(real: &RealRoles) -> bool {
    real.is_system_admin() || real.is_org_admin() || real.project_role.is_some_and(|role| role.can_preview_roles())
}

/// Checks a requested overlay against the real roles.
///
/// Each axis must be previewable, and the previewed role must be subsumed by
/// the real one. System admins may preview any role; an org owner or admin
/// without a project role may preview any project role.
pub fn validate(real: &RealRoles, requested: &ImpersonationOverlay) -> Result<(), OverlayRejection> {
    if let Some(org_role) = requested.org_role {
        if !can_set_org_overlay(real) {
            return Err(OverlayRejection::NotPermitted);
        }
        if !real.is_system_admin() && !real.org_role.is_some_and(|actual| org_role.is_subsumed_by(actual)) {
            return Err(OverlayRejection::Escalation);
        }
    }

    if let Some(project_role) = requested.project_role {
        if !real.project_selected || !can_set_project_overlay(real) {
            return Err(OverlayRejection::NotPermitted);
        }
        if !real.is_system_admin() {
            if let Some(actual) = real.project_role {
                if !project_role.is_subsumed_by(actual) {
                    return Err(OverlayRejection::Escalation);
                }
            }
        }
    }

    Ok(())
}

/// Re-validates an existing overlay after the real roles were reloaded.
pub fn recheck(real: &RealRoles, overlay: &ImpersonationOverlay) -> Result<(), OverlayRejection> {
    if !overlay.is_active() {
        return Ok(());
    }
    validate(real, overlay).map_err(|_| OverlayRejection::Stale)
}

pub fn effective_org_role(overlay: &ImpersonationOverlay, actual: Option<OrgRole>) -> Option<OrgRole> {
    overlay.org_role.or(actual)
}

pub fn effective_project_role(overlay: &ImpersonationOverlay, actual: Option<ProjectRole>) -> Option<ProjectRole> {
    overlay.project_role.or(actual)
}

/// Presentation-layer decision: allowed only if both the real roles and the
/// previewed roles allow it.
pub fn gate(principal: &Principal, facts: &MembershipFacts, overlay: &ImpersonationOverlay, access: Access) -> Decision {
    let real = decide(principal, facts, access);
    if !overlay.is_active() || !real.is_allow() {
        return real;
    }
    decide_for_roles(&overlay.apply(facts), access)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{OrgAction, OrgResource, ProjectAction, ProjectResource};
    use uuid::Uuid;

    fn real(org_role: Option<OrgRole>, project_role: Option<ProjectRole>) -> RealRoles {
        RealRoles {
            system_role: SystemRole::User,
            org_role,
            project_role,
            project_selected: true,
        }
    }

    #[test]
    fn member_cannot_set_org_overlay() {
        let roles = real(Some(OrgRole::Member), None);
        let requested = ImpersonationOverlay::new(Some(OrgRole::Member), None);
        assert_eq!(validate(&roles, &requested), Err(OverlayRejection::NotPermitted));
    }

    #[test]
    fn admin_cannot_preview_owner() {
        let roles = real(Some(OrgRole::Admin), None);
        let requested = ImpersonationOverlay::new(Some(OrgRole::Owner), None);
        assert_eq!(validate(&roles, &requested), Err(OverlayRejection::Escalation));
    }

    #[test]
    fn supplier_pm_may_preview_contributor_not_admin() {
        let roles = real(Some(OrgRole::Member), Some(ProjectRole::SupplierPm));
        assert!(validate(&roles, &ImpersonationOverlay::new(None, Some(ProjectRole::Contributor))).is_ok());
        assert_eq!(
            validate(&roles, &ImpersonationOverlay::new(None, Some(ProjectRole::Admin))),
            Err(OverlayRejection::Escalation)
        );
    }

    #[test]
    fn viewer_cannot_set_project_overlay() {
        let roles = real(Some(OrgRole::Member), Some(ProjectRole::Viewer));
        assert_eq!(
            validate(&roles, &ImpersonationOverlay::new(None, Some(ProjectRole::Viewer))),
            Err(OverlayRejection::NotPermitted)
        );
    }

    #[test]
    fn project_overlay_needs_a_selected_project() {
        let mut roles = real(Some(OrgRole::Owner), None);
        roles.project_selected = false;
        assert_eq!(
            validate(&roles, &ImpersonationOverlay::new(None, Some(ProjectRole::Viewer))),
            Err(OverlayRejection::NotPermitted)
        );
    }

    #[test]
    fn demoted_session_overlay_goes_stale() {
        let overlay = ImpersonationOverlay::new(Some(OrgRole::Member), None);
        assert!(recheck(&real(Some(OrgRole::Admin), None), &overlay).is_ok());
        assert_eq!(recheck(&real(Some(OrgRole::Member), None), &overlay), Err(OverlayRejection::Stale));
    }

    #[test]
    fn gate_never_exceeds_real_roles() {
        let principal = Principal::new(Uuid::new_v4());
        let facts = MembershipFacts::org(Some(OrgRole::Owner)).with_project(true, Some(ProjectRole::Viewer));
        // an owner who is only a project viewer previews supplier_pm
        let overlay = ImpersonationOverlay::new(None, Some(ProjectRole::SupplierPm));
        let edit = Access::project(ProjectResource::Milestones, ProjectAction::Edit);
        let view = Access::project(ProjectResource::Milestones, ProjectAction::View);

        assert_eq!(gate(&principal, &facts, &overlay, edit), Decision::Deny);
        assert_eq!(gate(&principal, &facts, &overlay, view), Decision::Allow);
    }

    #[test]
    fn gate_hides_controls_under_preview() {
        let principal = Principal::new(Uuid::new_v4());
        let facts = MembershipFacts::org(Some(OrgRole::Owner));
        let overlay = ImpersonationOverlay::new(Some(OrgRole::Member), None);
        let billing = Access::org(OrgResource::Billing, OrgAction::View);

        assert_eq!(decide(&principal, &facts, billing), Decision::Allow);
        assert_eq!(gate(&principal, &facts, &overlay, billing), Decision::Deny);
    }

    #[test]
    fn system_admin_preview_uses_previewed_role() {
        let principal = Principal::new(Uuid::new_v4()).with_system_role(SystemRole::SystemAdmin);
        let facts = MembershipFacts::default();
        let overlay = ImpersonationOverlay::new(Some(OrgRole::Member), None);

        assert_eq!(
            gate(&principal, &facts, &overlay, Access::org(OrgResource::Organisation, OrgAction::View)),
            Decision::Allow
        );
        assert_eq!(
            gate(&principal, &facts, &overlay, Access::org(OrgResource::Members, OrgAction::Invite)),
            Decision::Deny
        );
    }
}
