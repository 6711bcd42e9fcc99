pub mod access;
pub mod admin;
pub mod auth;
pub mod context;
pub mod health;
pub mod invitations;
pub mod members;
pub mod organisations;
pub mod projects;

use crate::app::AppState;
use crate::authz::{Access, PolicyEvaluator, Principal, ResourceContext};
use crate::errors::{AppError, AppResult};

/// Read check: a denied read is indistinguishable from a missing record.
pub(crate) async fn ensure_visible(
    state: &AppState,
    principal: &Principal,
    ctx: &ResourceContext,
    access: Access,
    what: &str,
) -> AppResult<()> {
    if state.authz.decide(principal, ctx, access).await?.is_allow() {
        Ok(())
    } else {
        Err(AppError::not_found(format!("{what} not found")))
    }
}
