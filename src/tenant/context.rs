//! Per-session tenant context.
//!
//! Holds the selected organisation and project, the roles the session really
//! has there, and the view-as overlay. Switches are supersedable: each takes a
//! ticket before fetching without the lock held, and a fetch whose ticket is
//! no longer the newest when it returns is discarded.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

use super::overlay::{self, ImpersonationOverlay, OverlayRejection, RealRoles};
use crate::authz::{OrgRole, Principal, ProjectRole};
use crate::errors::{AppError, AppResult};
use crate::models::membership::{OrgMembership, ProjectMembership};
use crate::models::project::Project;
use crate::store::sessions::ContextPreference;

/// Everything the context needs from the outside world.
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Active memberships in live organisations, in selection order.
    async fn org_memberships(&self, user_id: Uuid) -> AppResult<Vec<OrgMembership>>;
    /// Projects of the organisation visible to the principal, in selection order.
    async fn accessible_projects(&self, principal: &Principal, organisation_id: Uuid) -> AppResult<Vec<Project>>;
    async fn project_memberships(&self, user_id: Uuid, organisation_id: Uuid) -> AppResult<Vec<ProjectMembership>>;
    async fn load_preference(&self, user_id: Uuid) -> AppResult<ContextPreference>;
    async fn save_preference(&self, user_id: Uuid, preference: ContextPreference) -> AppResult<()>;

    /// Called before a switch fetches anything.
    fn on_switch(&self, _user_id: Uuid) {}

    /// Called when an overlay is dropped because the real roles no longer permit it.
    fn on_stale_overlay(&self, _user_id: Uuid, _organisation_id: Uuid, _overlay: ImpersonationOverlay) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Loading,
    Ready,
    NoAccess,
    /// Retryable.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Uninitialized,
    Loading,
    Ready,
    NoAccess,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantSelection {
    pub organisation_id: Uuid,
    pub org_role: OrgRole,
    pub project_id: Option<Uuid>,
    pub project_role: Option<ProjectRole>,
}

/// Serializable view of a context, returned by the context endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ContextSnapshot {
    pub status: ContextStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub organisation_id: Option<Uuid>,
    pub org_role: Option<OrgRole>,
    pub project_id: Option<Uuid>,
    pub project_role: Option<ProjectRole>,
    pub overlay: ImpersonationOverlay,
    pub effective_org_role: Option<OrgRole>,
    pub effective_project_role: Option<ProjectRole>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchTicket(u64);

/// Result of a supersedable operation.
#[derive(Debug, Clone)]
pub enum SwitchOutcome {
    Applied(ContextSnapshot),
    /// A newer switch started while this one was fetching; nothing was applied.
    Superseded,
}

pub struct TenantContext {
    principal: Principal,
    state: ContextState,
    selection: Option<TenantSelection>,
    overlay: ImpersonationOverlay,
    generation: u64,
}

impl TenantContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            state: ContextState::Uninitialized,
            selection: None,
            overlay: ImpersonationOverlay::default(),
            generation: 0,
        }
    }

    pub fn principal(&self) -> Principal {
        self.principal
    }

    /// The system role is re-read on every request and may have changed.
    pub fn set_principal(&mut self, principal: Principal) {
        self.principal = principal;
    }

    pub fn state(&self) -> &ContextState {
        &self.state
    }

    pub fn selection(&self) -> Option<TenantSelection> {
        self.selection
    }

    pub fn overlay(&self) -> ImpersonationOverlay {
        self.overlay
    }

    pub fn real_roles(&self) -> RealRoles {
        RealRoles {
            system_role: self.principal.system_role,
            org_role: self.selection.map(|s| s.org_role),
            project_role: self.selection.and_then(|s| s.project_role),
            project_selected: self.selection.is_some_and(|s| s.project_id.is_some()),
        }
    }

    pub fn take_ticket(&mut self) -> SwitchTicket {
        self.generation += 1;
        SwitchTicket(self.generation)
    }

    pub fn is_current(&self, ticket: SwitchTicket) -> bool {
        ticket.0 == self.generation
    }

    /// Replaces the overlay if the real roles permit it; otherwise leaves it unchanged.
    pub fn set_overlay(&mut self, requested: ImpersonationOverlay) -> Result<ImpersonationOverlay, OverlayRejection> {
        if self.state != ContextState::Ready {
            return Err(OverlayRejection::NotPermitted);
        }
        overlay::validate(&self.real_roles(), &requested)?;
        self.overlay = requested;
        Ok(self.overlay)
    }

    /// Returns the overlay that was cleared.
    pub fn clear_overlay(&mut self) -> ImpersonationOverlay {
        std::mem::take(&mut self.overlay)
    }

    /// Drops the overlay when the current real roles no longer allow it.
    fn drop_stale_overlay(&mut self) -> Option<ImpersonationOverlay> {
        match overlay::recheck(&self.real_roles(), &self.overlay) {
            Ok(()) => None,
            Err(_) => Some(self.clear_overlay()),
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let (status, failure_reason) = match &self.state {
            ContextState::Uninitialized => (ContextStatus::Uninitialized, None),
            ContextState::Loading => (ContextStatus::Loading, None),
            ContextState::Ready => (ContextStatus::Ready, None),
            ContextState::NoAccess => (ContextStatus::NoAccess, None),
            ContextState::Failed(reason) => (ContextStatus::Failed, Some(reason.clone())),
        };
        let org_role = self.selection.map(|s| s.org_role);
        let project_role = self.selection.and_then(|s| s.project_role);

        ContextSnapshot {
            status,
            failure_reason,
            organisation_id: self.selection.map(|s| s.organisation_id),
            org_role,
            project_id: self.selection.and_then(|s| s.project_id),
            project_role,
            overlay: self.overlay,
            effective_org_role: overlay::effective_org_role(&self.overlay, org_role),
            effective_project_role: overlay::effective_project_role(&self.overlay, project_role),
        }
    }

    fn apply(&mut self, selection: Option<TenantSelection>) {
        self.state = if selection.is_some() {
            ContextState::Ready
        } else {
            ContextState::NoAccess
        };
        self.selection = selection;
    }
}

// =============================================================================
// SELECTION RULES
// =============================================================================

/// Persisted selection if still a membership, else the default-flagged one, else the first.
pub fn select_organisation(memberships: &[OrgMembership], preferred: Option<Uuid>) -> Option<&OrgMembership> {
    preferred
        .and_then(|id| memberships.iter().find(|m| m.organisation_id == id))
        .or_else(|| memberships.iter().find(|m| m.is_default))
        .or_else(|| memberships.first())
}

/// Picks the starting project inside one organisation.
///
/// Candidates are the visible projects the principal is a member of. Only an
/// org owner or admin with no project membership at all falls back to any
/// visible project.
pub fn select_project(
    projects: &[Project],
    memberships: &[ProjectMembership],
    org_role: OrgRole,
    preferred: Option<Uuid>,
) -> Option<(Uuid, Option<ProjectRole>)> {
    let role_in = |project_id: Uuid| {
        memberships
            .iter()
            .find(|m| m.project_id == project_id && m.is_active)
            .map(|m| m.project_role)
    };
    let member_projects: Vec<&Project> = projects.iter().filter(|p| role_in(p.id).is_some()).collect();

    if !member_projects.is_empty() {
        let chosen = preferred
            .and_then(|id| member_projects.iter().find(|p| p.id == id))
            .or_else(|| {
                member_projects
                    .iter()
                    .find(|p| memberships.iter().any(|m| m.project_id == p.id && m.is_default))
            })
            .or_else(|| member_projects.first())?;
        return Some((chosen.id, role_in(chosen.id)));
    }

    if org_role.is_org_admin() {
        let chosen = preferred
            .and_then(|id| projects.iter().find(|p| p.id == id))
            .or_else(|| projects.first())?;
        return Some((chosen.id, None));
    }

    None
}

async fn project_for(
    source: &dyn ContextSource,
    principal: &Principal,
    membership: &OrgMembership,
    preferred: Option<Uuid>,
) -> AppResult<Option<(Uuid, Option<ProjectRole>)>> {
    let projects = source.accessible_projects(principal, membership.organisation_id).await?;
    let memberships = source
        .project_memberships(principal.user_id, membership.organisation_id)
        .await?;
    Ok(select_project(&projects, &memberships, membership.org_role, preferred))
}

fn selection_from(membership: &OrgMembership, project: Option<(Uuid, Option<ProjectRole>)>) -> TenantSelection {
    TenantSelection {
        organisation_id: membership.organisation_id,
        org_role: membership.org_role,
        project_id: project.map(|(id, _)| id),
        project_role: project.and_then(|(_, role)| role),
    }
}

fn preference_of(selection: Option<TenantSelection>) -> ContextPreference {
    ContextPreference {
        organisation_id: selection.map(|s| s.organisation_id),
        project_id: selection.and_then(|s| s.project_id),
    }
}

async fn load_initial(source: &dyn ContextSource, principal: &Principal) -> AppResult<Option<TenantSelection>> {
    let memberships = source.org_memberships(principal.user_id).await?;
    if memberships.is_empty() {
        return Ok(None);
    }

    let preference = source.load_preference(principal.user_id).await?;
    let Some(membership) = select_organisation(&memberships, preference.organisation_id) else {
        return Ok(None);
    };

    // a persisted project only counts inside the persisted organisation
    let preferred_project = preference
        .project_id
        .filter(|_| preference.organisation_id == Some(membership.organisation_id));
    let project = project_for(source, principal, membership, preferred_project).await?;

    Ok(Some(selection_from(membership, project)))
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Loads the context on first use; a ready context is returned as is.
///
/// Permitted from `Uninitialized` and `Failed`.
pub async fn initialise(ctx: &Mutex<TenantContext>, source: &dyn ContextSource) -> AppResult<SwitchOutcome> {
    let (ticket, principal) = {
        let mut guard = ctx.lock().await;
        match guard.state {
            ContextState::Ready | ContextState::NoAccess => return Ok(SwitchOutcome::Applied(guard.snapshot())),
            ContextState::Uninitialized | ContextState::Loading | ContextState::Failed(_) => {}
        }
        guard.state = ContextState::Loading;
        (guard.take_ticket(), guard.principal())
    };

    source.on_switch(principal.user_id);
    let loaded = load_initial(source, &principal).await;

    let mut guard = ctx.lock().await;
    if !guard.is_current(ticket) {
        tracing::debug!(user_id = %principal.user_id, "superseded context load discarded");
        return Ok(SwitchOutcome::Superseded);
    }

    match loaded {
        Ok(selection) => {
            guard.apply(selection);
            source
                .save_preference(principal.user_id, preference_of(selection))
                .await?;
            tracing::info!(
                user_id = %principal.user_id,
                organisation_id = ?selection.map(|s| s.organisation_id),
                project_id = ?selection.and_then(|s| s.project_id),
                "tenant context initialised"
            );
            Ok(SwitchOutcome::Applied(guard.snapshot()))
        }
        Err(e) => {
            tracing::error!(user_id = %principal.user_id, error = %e, "tenant context load failed");
            guard.state = ContextState::Failed(e.to_string());
            Err(e)
        }
    }
}

/// Moves to another organisation. Clears the persisted project and the whole overlay.
///
/// On rejection or failure the previous context is kept.
pub async fn switch_organisation(
    ctx: &Mutex<TenantContext>,
    source: &dyn ContextSource,
    organisation_id: Uuid,
) -> AppResult<SwitchOutcome> {
    let (ticket, principal) = {
        let mut guard = ctx.lock().await;
        (guard.take_ticket(), guard.principal())
    };

    source.on_switch(principal.user_id);
    let fetched = async {
        let memberships = source.org_memberships(principal.user_id).await?;
        let membership = memberships
            .into_iter()
            .find(|m| m.organisation_id == organisation_id)
            .ok_or_else(|| AppError::invalid_tenant_selection("not an active member of that organisation"))?;
        // the previous project never seeds the selection
        let project = project_for(source, &principal, &membership, None).await?;
        Ok::<_, AppError>(selection_from(&membership, project))
    }
    .await;

    let mut guard = ctx.lock().await;
    if !guard.is_current(ticket) {
        tracing::debug!(user_id = %principal.user_id, "superseded organisation switch discarded");
        return Ok(SwitchOutcome::Superseded);
    }

    let selection = fetched?;
    guard.apply(Some(selection));
    guard.clear_overlay();
    source
        .save_preference(principal.user_id, preference_of(Some(selection)))
        .await?;

    tracing::info!(
        user_id = %principal.user_id,
        organisation_id = %selection.organisation_id,
        project_id = ?selection.project_id,
        "organisation switched"
    );

    Ok(SwitchOutcome::Applied(guard.snapshot()))
}

/// Moves to another project of the current organisation. Clears the project half of the overlay.
pub async fn switch_project(
    ctx: &Mutex<TenantContext>,
    source: &dyn ContextSource,
    project_id: Uuid,
) -> AppResult<SwitchOutcome> {
    let (ticket, principal, current) = {
        let mut guard = ctx.lock().await;
        let current = match (&guard.state, guard.selection) {
            (ContextState::Ready, Some(selection)) => selection,
            _ => return Err(AppError::invalid_tenant_selection("no organisation selected")),
        };
        (guard.take_ticket(), guard.principal(), current)
    };

    source.on_switch(principal.user_id);
    let fetched = async {
        let projects = source.accessible_projects(&principal, current.organisation_id).await?;
        if !projects.iter().any(|p| p.id == project_id) {
            return Err(AppError::invalid_tenant_selection("project is not visible in the current organisation"));
        }
        let role = source
            .project_memberships(principal.user_id, current.organisation_id)
            .await?
            .into_iter()
            .find(|m| m.project_id == project_id && m.is_active)
            .map(|m| m.project_role);
        Ok(role)
    }
    .await;

    let mut guard = ctx.lock().await;
    if !guard.is_current(ticket) {
        tracing::debug!(user_id = %principal.user_id, "superseded project switch discarded");
        return Ok(SwitchOutcome::Superseded);
    }

    let project_role = fetched?;
    let selection = TenantSelection {
        project_id: Some(project_id),
        project_role,
        ..current
    };
    guard.apply(Some(selection));
    guard.overlay.clear_project();
    source
        .save_preference(principal.user_id, preference_of(Some(selection)))
        .await?;

    tracing::info!(user_id = %principal.user_id, project_id = %project_id, "project switched");

    Ok(SwitchOutcome::Applied(guard.snapshot()))
}

/// Re-reads the real roles for the current selection and drops an overlay they
/// no longer permit. A selection that lost its organisation is re-initialised.
pub async fn refresh(ctx: &Mutex<TenantContext>, source: &dyn ContextSource) -> AppResult<SwitchOutcome> {
    let (ticket, principal, current) = {
        let mut guard = ctx.lock().await;
        let state = guard.state.clone();
        match (state, guard.selection) {
            (ContextState::Ready, Some(selection)) => (guard.take_ticket(), guard.principal(), selection),
            (ContextState::Loading, _) => return Ok(SwitchOutcome::Applied(guard.snapshot())),
            _ => {
                drop(guard);
                return initialise_fresh(ctx, source).await;
            }
        }
    };

    let fetched = async {
        let memberships = source.org_memberships(principal.user_id).await?;
        let Some(membership) = memberships.into_iter().find(|m| m.organisation_id == current.organisation_id) else {
            return Ok(None);
        };
        let project = match current.project_id {
            Some(project_id) => {
                let projects = source.accessible_projects(&principal, current.organisation_id).await?;
                if projects.iter().any(|p| p.id == project_id) {
                    let role = source
                        .project_memberships(principal.user_id, current.organisation_id)
                        .await?
                        .into_iter()
                        .find(|m| m.project_id == project_id && m.is_active)
                        .map(|m| m.project_role);
                    Some((project_id, role))
                } else {
                    project_for(source, &principal, &membership, None).await?
                }
            }
            None => None,
        };
        Ok::<_, AppError>(Some(selection_from(&membership, project)))
    }
    .await;

    let mut guard = ctx.lock().await;
    if !guard.is_current(ticket) {
        return Ok(SwitchOutcome::Superseded);
    }

    match fetched? {
        Some(selection) => {
            guard.apply(Some(selection));
            if let Some(stale) = guard.drop_stale_overlay() {
                tracing::warn!(
                    user_id = %principal.user_id,
                    organisation_id = %selection.organisation_id,
                    overlay = ?stale,
                    "stale view-as overlay cleared"
                );
                source.on_stale_overlay(principal.user_id, selection.organisation_id, stale);
            }
            Ok(SwitchOutcome::Applied(guard.snapshot()))
        }
        None => {
            tracing::info!(
                user_id = %principal.user_id,
                organisation_id = %current.organisation_id,
                "membership lost; reselecting tenant context"
            );
            guard.selection = None;
            guard.state = ContextState::Uninitialized;
            guard.clear_overlay();
            drop(guard);
            initialise_fresh(ctx, source).await
        }
    }
}

async fn initialise_fresh(ctx: &Mutex<TenantContext>, source: &dyn ContextSource) -> AppResult<SwitchOutcome> {
    {
        let mut guard = ctx.lock().await;
        if guard.state == ContextState::NoAccess {
            guard.state = ContextState::Uninitialized;
        }
    }
    initialise(ctx, source).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::project::ProjectStatus;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn org_membership(user_id: Uuid, organisation_id: Uuid, org_role: OrgRole, is_default: bool) -> OrgMembership {
        OrgMembership {
            id: Uuid::new_v4(),
            organisation_id,
            user_id,
            org_role,
            is_active: true,
            is_default,
            invited_at: None,
            accepted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn project(organisation_id: Uuid, name: &str) -> Project {
        Project {
            id: Uuid::new_v4(),
            organisation_id,
            name: name.to_string(),
            reference: name.to_uppercase(),
            status: ProjectStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn project_membership(user_id: Uuid, project_id: Uuid, project_role: ProjectRole, is_default: bool) -> ProjectMembership {
        ProjectMembership {
            id: Uuid::new_v4(),
            project_id,
            user_id,
            project_role,
            is_active: true,
            is_default,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct FakeSource {
        orgs: Vec<OrgMembership>,
        projects: HashMap<Uuid, Vec<Project>>,
        project_memberships: Vec<ProjectMembership>,
        preference: std::sync::Mutex<ContextPreference>,
        saved: std::sync::Mutex<Vec<ContextPreference>>,
        /// When set, `accessible_projects` for this organisation waits for the notify.
        gate: Option<(Uuid, Arc<Notify>)>,
    }

    #[async_trait]
    impl ContextSource for FakeSource {
        async fn org_memberships(&self, _user_id: Uuid) -> AppResult<Vec<OrgMembership>> {
            Ok(self.orgs.clone())
        }

        async fn accessible_projects(&self, _principal: &Principal, organisation_id: Uuid) -> AppResult<Vec<Project>> {
            if let Some((gated, notify)) = &self.gate {
                if *gated == organisation_id {
                    notify.notified().await;
                }
            }
            Ok(self.projects.get(&organisation_id).cloned().unwrap_or_default())
        }

        async fn project_memberships(&self, _user_id: Uuid, organisation_id: Uuid) -> AppResult<Vec<ProjectMembership>> {
            let ids: Vec<Uuid> = self
                .projects
                .get(&organisation_id)
                .map(|ps| ps.iter().map(|p| p.id).collect())
                .unwrap_or_default();
            Ok(self
                .project_memberships
                .iter()
                .filter(|m| ids.contains(&m.project_id))
                .cloned()
                .collect())
        }

        async fn load_preference(&self, _user_id: Uuid) -> AppResult<ContextPreference> {
            Ok(*self.preference.lock().unwrap())
        }

        async fn save_preference(&self, _user_id: Uuid, preference: ContextPreference) -> AppResult<()> {
            *self.preference.lock().unwrap() = preference;
            self.saved.lock().unwrap().push(preference);
            Ok(())
        }
    }

    fn applied(outcome: SwitchOutcome) -> ContextSnapshot {
        match outcome {
            SwitchOutcome::Applied(snapshot) => snapshot,
            SwitchOutcome::Superseded => panic!("unexpectedly superseded"),
        }
    }

    #[test]
    fn organisation_priority_is_persisted_then_default_then_first() {
        let user = Uuid::new_v4();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let memberships = vec![
            org_membership(user, a, OrgRole::Member, false),
            org_membership(user, b, OrgRole::Member, true),
            org_membership(user, c, OrgRole::Member, false),
        ];

        assert_eq!(select_organisation(&memberships, Some(c)).unwrap().organisation_id, c);
        assert_eq!(select_organisation(&memberships, Some(Uuid::new_v4())).unwrap().organisation_id, b);
        assert_eq!(select_organisation(&memberships[..1], None).unwrap().organisation_id, a);
        assert!(select_organisation(&[], None).is_none());
    }

    #[test]
    fn member_projects_win_over_visible_ones() {
        let user = Uuid::new_v4();
        let org = Uuid::new_v4();
        let alpha = project(org, "alpha");
        let beta = project(org, "beta");
        let memberships = vec![project_membership(user, beta.id, ProjectRole::Viewer, false)];
        let projects = vec![alpha.clone(), beta.clone()];

        // owner, member of beta only: persisted alpha is ignored
        let chosen = select_project(&projects, &memberships, OrgRole::Owner, Some(alpha.id));
        assert_eq!(chosen, Some((beta.id, Some(ProjectRole::Viewer))));
    }

    #[test]
    fn org_admin_without_memberships_falls_back_to_visible() {
        let org = Uuid::new_v4();
        let projects = vec![project(org, "alpha"), project(org, "beta")];

        assert_eq!(select_project(&projects, &[], OrgRole::Admin, None), Some((projects[0].id, None)));
        assert_eq!(
            select_project(&projects, &[], OrgRole::Admin, Some(projects[1].id)),
            Some((projects[1].id, None))
        );
        assert_eq!(select_project(&projects, &[], OrgRole::Member, None), None);
    }

    #[tokio::test]
    async fn no_memberships_means_no_access() {
        let principal = Principal::new(Uuid::new_v4());
        let ctx = Mutex::new(TenantContext::new(principal));
        let snapshot = applied(initialise(&ctx, &FakeSource::default()).await.unwrap());
        assert_eq!(snapshot.status, ContextStatus::NoAccess);
        assert!(snapshot.organisation_id.is_none());
    }

    #[tokio::test]
    async fn switching_organisation_clears_project_and_overlay() {
        let principal = Principal::new(Uuid::new_v4());
        let (org_a, org_b) = (Uuid::new_v4(), Uuid::new_v4());
        let p1 = project(org_a, "p1");
        let source = FakeSource {
            orgs: vec![
                org_membership(principal.user_id, org_a, OrgRole::Owner, true),
                org_membership(principal.user_id, org_b, OrgRole::Member, false),
            ],
            projects: HashMap::from([(org_a, vec![p1.clone()])]),
            ..FakeSource::default()
        };
        let ctx = Mutex::new(TenantContext::new(principal));

        let first = applied(initialise(&ctx, &source).await.unwrap());
        assert_eq!(first.organisation_id, Some(org_a));
        assert_eq!(first.project_id, Some(p1.id));

        ctx.lock()
            .await
            .set_overlay(ImpersonationOverlay::new(Some(OrgRole::Member), Some(ProjectRole::Viewer)))
            .unwrap();

        let switched = applied(switch_organisation(&ctx, &source, org_b).await.unwrap());
        assert_eq!(switched.organisation_id, Some(org_b));
        assert_eq!(switched.project_id, None);
        assert!(!switched.overlay.is_active());
        assert_eq!(source.preference.lock().unwrap().project_id, None);
    }

    #[tokio::test]
    async fn switching_organisation_never_carries_the_old_project() {
        let principal = Principal::new(Uuid::new_v4());
        let user = principal.user_id;
        let (org_a, org_b) = (Uuid::new_v4(), Uuid::new_v4());
        let p1 = project(org_a, "p1");
        let (q1, q2) = (project(org_b, "q1"), project(org_b, "q2"));
        let source = FakeSource {
            orgs: vec![
                org_membership(user, org_a, OrgRole::Member, true),
                org_membership(user, org_b, OrgRole::Admin, false),
            ],
            projects: HashMap::from([(org_a, vec![p1.clone()]), (org_b, vec![q1.clone(), q2.clone()])]),
            project_memberships: vec![
                project_membership(user, p1.id, ProjectRole::Admin, true),
                project_membership(user, q2.id, ProjectRole::Contributor, false),
            ],
            preference: std::sync::Mutex::new(ContextPreference {
                organisation_id: Some(org_a),
                project_id: Some(p1.id),
            }),
            ..FakeSource::default()
        };
        let ctx = Mutex::new(TenantContext::new(principal));

        let first = applied(initialise(&ctx, &source).await.unwrap());
        assert_eq!(first.project_id, Some(p1.id));
        source.saved.lock().unwrap().clear();

        let switched = applied(switch_organisation(&ctx, &source, org_b).await.unwrap());
        assert_eq!(switched.organisation_id, Some(org_b));
        // reselected inside the new organisation: the member project wins over q1
        assert_eq!(switched.project_id, Some(q2.id));
        assert_eq!(switched.project_role, Some(ProjectRole::Contributor));

        let saved = source.saved.lock().unwrap().clone();
        assert_eq!(
            saved,
            vec![ContextPreference {
                organisation_id: Some(org_b),
                project_id: Some(q2.id),
            }]
        );
        assert!(saved.iter().all(|p| p.project_id != Some(p1.id)));
    }

    #[tokio::test]
    async fn invalid_switch_keeps_previous_context() {
        let principal = Principal::new(Uuid::new_v4());
        let org = Uuid::new_v4();
        let source = FakeSource {
            orgs: vec![org_membership(principal.user_id, org, OrgRole::Member, false)],
            ..FakeSource::default()
        };
        let ctx = Mutex::new(TenantContext::new(principal));
        applied(initialise(&ctx, &source).await.unwrap());

        let err = switch_organisation(&ctx, &source, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTenantSelection(_)));
        assert_eq!(ctx.lock().await.snapshot().organisation_id, Some(org));

        let err = switch_project(&ctx, &source, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTenantSelection(_)));
    }

    #[tokio::test]
    async fn project_switch_clears_only_project_overlay() {
        let principal = Principal::new(Uuid::new_v4());
        let org = Uuid::new_v4();
        let (p1, p2) = (project(org, "p1"), project(org, "p2"));
        let source = FakeSource {
            orgs: vec![org_membership(principal.user_id, org, OrgRole::Owner, false)],
            projects: HashMap::from([(org, vec![p1.clone(), p2.clone()])]),
            ..FakeSource::default()
        };
        let ctx = Mutex::new(TenantContext::new(principal));
        applied(initialise(&ctx, &source).await.unwrap());
        ctx.lock()
            .await
            .set_overlay(ImpersonationOverlay::new(Some(OrgRole::Admin), Some(ProjectRole::Viewer)))
            .unwrap();

        let switched = applied(switch_project(&ctx, &source, p2.id).await.unwrap());
        assert_eq!(switched.project_id, Some(p2.id));
        assert_eq!(switched.overlay, ImpersonationOverlay::new(Some(OrgRole::Admin), None));
        assert_eq!(switched.effective_org_role, Some(OrgRole::Admin));
    }

    #[tokio::test]
    async fn older_switch_is_discarded_when_newer_completes_first() {
        let principal = Principal::new(Uuid::new_v4());
        let (slow_org, fast_org) = (Uuid::new_v4(), Uuid::new_v4());
        let release = Arc::new(Notify::new());
        let source = Arc::new(FakeSource {
            orgs: vec![
                org_membership(principal.user_id, slow_org, OrgRole::Owner, false),
                org_membership(principal.user_id, fast_org, OrgRole::Owner, false),
            ],
            gate: Some((slow_org, release.clone())),
            ..FakeSource::default()
        });
        let ctx = Arc::new(Mutex::new(TenantContext::new(principal)));

        let slow = {
            let ctx = ctx.clone();
            let source = source.clone();
            tokio::spawn(async move { switch_organisation(&ctx, source.as_ref(), slow_org).await })
        };
        // let the slow switch take its ticket and park on the gate
        while ctx.lock().await.generation == 0 {
            tokio::task::yield_now().await;
        }

        let fast = applied(switch_organisation(&ctx, source.as_ref(), fast_org).await.unwrap());
        assert_eq!(fast.organisation_id, Some(fast_org));

        release.notify_one();
        let outcome = slow.await.unwrap().unwrap();
        assert!(matches!(outcome, SwitchOutcome::Superseded));
        assert_eq!(ctx.lock().await.snapshot().organisation_id, Some(fast_org));
    }

    #[tokio::test]
    async fn refresh_drops_overlay_after_demotion() {
        let principal = Principal::new(Uuid::new_v4());
        let org = Uuid::new_v4();
        let mut source = FakeSource {
            orgs: vec![org_membership(principal.user_id, org, OrgRole::Admin, false)],
            ..FakeSource::default()
        };
        let ctx = Mutex::new(TenantContext::new(principal));
        applied(initialise(&ctx, &source).await.unwrap());
        ctx.lock()
            .await
            .set_overlay(ImpersonationOverlay::new(Some(OrgRole::Member), None))
            .unwrap();

        source.orgs = vec![org_membership(principal.user_id, org, OrgRole::Member, false)];
        let refreshed = applied(refresh(&ctx, &source).await.unwrap());
        assert_eq!(refreshed.org_role, Some(OrgRole::Member));
        assert!(!refreshed.overlay.is_active());
    }
}
