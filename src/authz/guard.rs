//! Entry points for entity services.
//!
//! Reads filter: a denied row is absent, not an error. Writes require: a denied
//! write is [`AppError::Denied`].

use super::evaluator::PolicyEvaluator;
use super::principal::{Access, Principal, ResourceContext};
use crate::errors::{AppError, AppResult};

pub async fn require<E>(evaluator: &E, principal: &Principal, ctx: &ResourceContext, access: Access) -> AppResult<()>
where
    E: PolicyEvaluator + ?Sized,
{
    if evaluator.decide(principal, ctx, access).await?.is_allow() {
        Ok(())
    } else {
        tracing::info!(
            user_id = %principal.user_id,
            organisation_id = %ctx.organisation_id,
            access = %access.label(),
            "write denied"
        );
        Err(AppError::denied(access.label()))
    }
}

/// Passes when any one of `accesses` is allowed.
pub async fn require_any<E>(
    evaluator: &E,
    principal: &Principal,
    ctx: &ResourceContext,
    accesses: &[Access],
) -> AppResult<()>
where
    E: PolicyEvaluator + ?Sized,
{
    for access in accesses {
        if evaluator.decide(principal, ctx, *access).await?.is_allow() {
            return Ok(());
        }
    }

    let labels: Vec<String> = accesses.iter().map(Access::label).collect();
    Err(AppError::denied(labels.join(" | ")))
}

/// Keeps the items whose context is allowed; order is preserved.
pub async fn filter_visible<E, T, F>(
    evaluator: &E,
    principal: &Principal,
    items: Vec<T>,
    access: Access,
    ctx_of: F,
) -> AppResult<Vec<T>>
where
    E: PolicyEvaluator + ?Sized,
    F: Fn(&T) -> ResourceContext,
{
    let mut visible = Vec::with_capacity(items.len());
    for item in items {
        if evaluator.decide(principal, &ctx_of(&item), access).await?.is_allow() {
            visible.push(item);
        }
    }
    Ok(visible)
}
