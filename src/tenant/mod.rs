//! Session-scoped tenant state: the selected organisation and project, and the view-as overlay.

pub mod context;
pub mod overlay;
pub mod session;

pub use context::{
    initialise, refresh, select_organisation, select_project, switch_organisation, switch_project, ContextSnapshot,
    ContextSource, ContextState, ContextStatus, SwitchOutcome, TenantContext, TenantSelection,
};
pub use overlay::{gate, ImpersonationOverlay, OverlayRejection, RealRoles};
pub use session::{SessionConfig, SessionRegistry, SharedContext, StoreSource};
