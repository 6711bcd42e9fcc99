use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::context::{ContextSource, TenantContext};
use super::overlay::ImpersonationOverlay;
use crate::authz::Principal;
use crate::cache::TenantCache;
use crate::errors::AppResult;
use crate::events::{self, AuditEvent, EventBus, Severity};
use crate::models::membership::{OrgMembership, ProjectMembership};
use crate::models::project::Project;
use crate::store::{self, sessions::ContextPreference};

pub type SharedContext = Arc<Mutex<TenantContext>>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub max_sessions: u64,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let minutes = std::env::var("SESSION_IDLE_MINUTES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|m| *m > 0)
            .unwrap_or(60);

        Self {
            idle_timeout: Duration::from_secs(minutes * 60),
            max_sessions: 100_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60 * 60),
            max_sessions: 100_000,
        }
    }
}

/// Live tenant contexts, one per login session.
///
/// An idle session's context is evicted and rebuilt from the persisted
/// preference on its next request; the overlay does not survive eviction.
#[derive(Clone)]
pub struct SessionRegistry {
    contexts: Cache<Uuid, SharedContext>,
}

impl SessionRegistry {
    pub fn new(config: &SessionConfig) -> Self {
        let contexts = Cache::builder()
            .max_capacity(config.max_sessions)
            .time_to_idle(config.idle_timeout)
            .build();
        Self { contexts }
    }

    /// Context for `session_id`, with the principal refreshed from this request.
    pub async fn get_or_create(&self, session_id: Uuid, principal: Principal) -> SharedContext {
        let shared = self
            .contexts
            .get_with(session_id, async move { Arc::new(Mutex::new(TenantContext::new(principal))) })
            .await;
        shared.lock().await.set_principal(principal);
        shared
    }

    /// Context of a session that has already made a context request.
    pub async fn get(&self, session_id: Uuid) -> Option<SharedContext> {
        self.contexts.get(&session_id).await
    }

    pub async fn remove(&self, session_id: Uuid) {
        self.contexts.invalidate(&session_id).await;
    }
}

/// [`ContextSource`] backed by the store, reading through the tenant cache.
pub struct StoreSource {
    pool: SqlitePool,
    cache: TenantCache,
    event_bus: EventBus,
}

impl StoreSource {
    pub fn new(pool: SqlitePool, cache: TenantCache, event_bus: EventBus) -> Self {
        Self { pool, cache, event_bus }
    }
}

#[async_trait]
impl ContextSource for StoreSource {
    async fn org_memberships(&self, user_id: Uuid) -> AppResult<Vec<OrgMembership>> {
        let rows = self.cache.org_memberships(&self.pool, user_id).await?;
        Ok(rows.as_ref().clone())
    }

    async fn accessible_projects(&self, principal: &Principal, organisation_id: Uuid) -> AppResult<Vec<Project>> {
        let rows = self
            .cache
            .accessible_projects(&self.pool, principal, organisation_id)
            .await?;
        Ok(rows.as_ref().clone())
    }

    async fn project_memberships(&self, user_id: Uuid, organisation_id: Uuid) -> AppResult<Vec<ProjectMembership>> {
        store::memberships::list_project_memberships_in(&self.pool, user_id, organisation_id).await
    }

    async fn load_preference(&self, user_id: Uuid) -> AppResult<ContextPreference> {
        store::sessions::load_preference(&self.pool, user_id).await
    }

    async fn save_preference(&self, user_id: Uuid, preference: ContextPreference) -> AppResult<()> {
        store::sessions::save_preference(&self.pool, user_id, preference).await
    }

    fn on_switch(&self, user_id: Uuid) {
        self.cache.invalidate_subject(user_id);
    }

    fn on_stale_overlay(&self, user_id: Uuid, organisation_id: Uuid, overlay: ImpersonationOverlay) {
        let event = AuditEvent::new(
            "impersonation.cleared",
            Some(user_id),
            json!({ "reason": "stale", "overlay": overlay }),
        )
        .with_organisation(Some(organisation_id))
        .with_subject(user_id)
        .with_severity(Severity::Important);
        events::publish(&self.event_bus, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_session_shares_one_context() {
        let registry = SessionRegistry::new(&SessionConfig::default());
        let session_id = Uuid::new_v4();
        let principal = Principal::new(Uuid::new_v4());

        let first = registry.get_or_create(session_id, principal).await;
        let second = registry.get_or_create(session_id, principal).await;
        assert!(Arc::ptr_eq(&first, &second));

        registry.remove(session_id).await;
        let third = registry.get_or_create(session_id, principal).await;
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
