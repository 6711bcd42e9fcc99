use async_trait::async_trait;
use serde_json::json;
use sqlx::{Row, SqlitePool};

use super::decision::decide;
use super::predicate::decision_query;
use super::principal::{Access, Decision, Principal, ResourceContext};
use super::ParityMode;
use crate::cache::TenantCache;
use crate::errors::{AppError, AppResult};
use crate::events::{self, AuditEvent, EventBus, Severity};

/// Policy evaluator trait for pluggable authorization logic
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Decide whether the principal may perform `access` in the given tenant coordinates
    async fn decide(&self, principal: &Principal, ctx: &ResourceContext, access: Access) -> AppResult<Decision>;
}

/// Evaluates the decision procedure as a single SQL statement.
///
/// Authoritative: every write path and every filtered read goes through here.
#[derive(Debug, Clone)]
pub struct DataStoreEvaluator {
    pool: SqlitePool,
}

impl DataStoreEvaluator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyEvaluator for DataStoreEvaluator {
    async fn decide(&self, principal: &Principal, ctx: &ResourceContext, access: Access) -> AppResult<Decision> {
        let predicate = decision_query(principal.user_id, ctx.organisation_id, ctx.project_id, access);

        let mut query = sqlx::query(&predicate.sql);
        for value in &predicate.binds {
            query = query.bind(value.clone());
        }

        // no row: the user is gone
        let allowed = match query.fetch_optional(&self.pool).await? {
            Some(row) => row.try_get::<i64, _>("allowed")? != 0,
            None => false,
        };

        Ok(Decision::from_bool(allowed))
    }
}

/// Evaluates the decision procedure in process over cached membership facts.
#[derive(Clone)]
pub struct MirrorEvaluator {
    pool: SqlitePool,
    cache: TenantCache,
}

impl MirrorEvaluator {
    pub fn new(pool: SqlitePool, cache: TenantCache) -> Self {
        Self { pool, cache }
    }
}

#[async_trait]
impl PolicyEvaluator for MirrorEvaluator {
    async fn decide(&self, principal: &Principal, ctx: &ResourceContext, access: Access) -> AppResult<Decision> {
        if principal.is_system_admin() {
            return Ok(Decision::Allow);
        }
        let facts = self.cache.facts(&self.pool, principal.user_id, ctx).await?;
        Ok(decide(principal, &facts, access))
    }
}

/// Runs the data-store evaluator and cross-checks it against the mirror.
///
/// The data-store answer is always the one returned.
pub struct Authorizer {
    data_store: DataStoreEvaluator,
    mirror: MirrorEvaluator,
    parity: ParityMode,
    event_bus: Option<EventBus>,
}

impl Authorizer {
    pub fn new(pool: SqlitePool, cache: TenantCache, parity: ParityMode) -> Self {
        Self {
            data_store: DataStoreEvaluator::new(pool.clone()),
            mirror: MirrorEvaluator::new(pool, cache),
            parity,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn parity(&self) -> ParityMode {
        self.parity
    }

    fn report_divergence(
        &self,
        principal: &Principal,
        ctx: &ResourceContext,
        access: Access,
        data_store: Decision,
        mirror: Decision,
    ) {
        tracing::error!(
            user_id = %principal.user_id,
            organisation_id = %ctx.organisation_id,
            project_id = ?ctx.project_id,
            access = %access.label(),
            data_store = ?data_store,
            mirror = ?mirror,
            "authorization divergence between data store and mirror"
        );

        if let Some(bus) = &self.event_bus {
            let event = AuditEvent::new(
                "authz.divergence",
                Some(principal.user_id),
                json!({
                    "access": access.label(),
                    "project_id": ctx.project_id,
                    "data_store": data_store,
                    "mirror": mirror,
                    "parity": self.parity.as_str(),
                }),
            )
            .with_organisation(Some(ctx.organisation_id))
            .with_severity(Severity::Critical);
            events::publish(bus, event);
        }
    }
}

#[async_trait]
impl PolicyEvaluator for Authorizer {
    async fn decide(&self, principal: &Principal, ctx: &ResourceContext, access: Access) -> AppResult<Decision> {
        let authoritative = self.data_store.decide(principal, ctx, access).await?;

        tracing::debug!(
            user_id = %principal.user_id,
            organisation_id = %ctx.organisation_id,
            access = %access.label(),
            decision = ?authoritative,
            "authorization decision"
        );

        if self.parity == ParityMode::Off {
            return Ok(authoritative);
        }

        let mirrored = match self.mirror.decide(principal, ctx, access).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, "mirror evaluation failed; parity check skipped");
                return Ok(authoritative);
            }
        };

        if mirrored != authoritative {
            self.report_divergence(principal, ctx, access, authoritative, mirrored);
            if self.parity == ParityMode::Strict {
                return Err(AppError::internal("authorization divergence"));
            }
        }

        Ok(authoritative)
    }
}
