//! Tenant-scoped cache for membership facts and derived lists.
//!
//! Every key carries the subject's and the organisation's epoch as read when
//! the key was built. Invalidation bumps the epoch first, so an entry inserted
//! late by a fetch that started before the bump sits under a key no reader
//! will ever build again.
//!
//! The epoch maps hold at most `max_capacity` ids between them. Past that the
//! cache rolls to a new generation: both maps are cleared and every entry is
//! dropped, so keys built under the old generation are never built again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use moka::future::Cache;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::authz::{Decision, MembershipFacts, OrgRole, Principal, ProjectFacts, ResourceContext};
use crate::errors::{AppError, AppResult};
use crate::models::membership::OrgMembership;
use crate::models::project::Project;
use crate::store;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_capacity: u64,
    pub ttl: Duration,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let max_capacity = std::env::var("CACHE_MAX_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10_000);
        let ttl_seconds = std::env::var("CACHE_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(300);

        Self {
            max_capacity,
            ttl: Duration::from_secs(ttl_seconds),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    OrgMemberships,
    ProjectMemberships,
    AccessibleProjects,
    Decisions,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: Namespace,
    pub organisation_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub subject_id: Uuid,
    pub detail: String,
    generation: u64,
    subject_epoch: u64,
    organisation_epoch: u64,
}

#[derive(Debug, Clone)]
pub enum CachedValue {
    OrgMemberships(Arc<Vec<OrgMembership>>),
    OrgRole(Option<OrgRole>),
    ProjectFacts(ProjectFacts),
    Projects(Arc<Vec<Project>>),
    Decision(Decision),
}

#[derive(Debug)]
struct Epochs {
    generation: u64,
    limit: usize,
    subjects: HashMap<Uuid, u64>,
    organisations: HashMap<Uuid, u64>,
}

impl Epochs {
    fn new(limit: usize) -> Self {
        Self {
            generation: 0,
            limit: limit.max(1),
            subjects: HashMap::new(),
            organisations: HashMap::new(),
        }
    }

    fn tracked(&self) -> usize {
        self.subjects.len() + self.organisations.len()
    }

    /// Returns true when the bump rolled the generation instead.
    fn bump(&mut self, subject: Option<Uuid>, organisation: Option<Uuid>) -> bool {
        let grows = subject.is_some_and(|id| !self.subjects.contains_key(&id))
            || organisation.is_some_and(|id| !self.organisations.contains_key(&id));
        if grows && self.tracked() >= self.limit {
            self.generation += 1;
            self.subjects.clear();
            self.organisations.clear();
            return true;
        }
        if let Some(id) = subject {
            *self.subjects.entry(id).or_insert(0) += 1;
        }
        if let Some(id) = organisation {
            *self.organisations.entry(id).or_insert(0) += 1;
        }
        false
    }
}

#[derive(Clone)]
pub struct TenantCache {
    entries: Cache<CacheKey, CachedValue>,
    epochs: Arc<Mutex<Epochs>>,
}

impl TenantCache {
    pub fn new(config: &CacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl)
            .support_invalidation_closures()
            .build();

        Self {
            entries,
            epochs: Arc::new(Mutex::new(Epochs::new(
                usize::try_from(config.max_capacity).unwrap_or(usize::MAX),
            ))),
        }
    }

    fn epochs(&self) -> std::sync::MutexGuard<'_, Epochs> {
        // the map holds plain counters; a poisoned guard is still consistent
        self.epochs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key(
        &self,
        namespace: Namespace,
        subject_id: Uuid,
        organisation_id: Option<Uuid>,
        project_id: Option<Uuid>,
        detail: impl Into<String>,
    ) -> CacheKey {
        let epochs = self.epochs();
        CacheKey {
            namespace,
            organisation_id,
            project_id,
            subject_id,
            detail: detail.into(),
            generation: epochs.generation,
            subject_epoch: epochs.subjects.get(&subject_id).copied().unwrap_or(0),
            organisation_epoch: organisation_id
                .and_then(|org| epochs.organisations.get(&org).copied())
                .unwrap_or(0),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        self.entries.get(key).await
    }

    /// Returns the cached value for `key`, loading and storing it on a miss.
    ///
    /// The key must be built before the load starts.
    pub async fn get_or_load<F, Fut>(&self, key: CacheKey, load: F) -> AppResult<CachedValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<CachedValue>>,
    {
        if let Some(value) = self.entries.get(&key).await {
            return Ok(value);
        }
        let value = load().await?;
        self.entries.insert(key, value.clone()).await;
        Ok(value)
    }

    fn roll(&self) {
        self.entries.invalidate_all();
        tracing::info!("tenant cache epochs rolled to a new generation");
    }

    /// Context switch, logout or role change of one subject.
    pub fn invalidate_subject(&self, subject_id: Uuid) {
        if self.epochs().bump(Some(subject_id), None) {
            return self.roll();
        }
        if let Err(e) = self.entries.invalidate_entries_if(move |key, _| key.subject_id == subject_id) {
            tracing::warn!(subject_id = %subject_id, error = %e, "cache sweep not scheduled");
        }
        tracing::debug!(subject_id = %subject_id, "tenant cache invalidated for subject");
    }

    /// Membership, organisation or project write inside one organisation.
    pub fn invalidate_organisation(&self, organisation_id: Uuid) {
        if self.epochs().bump(None, Some(organisation_id)) {
            return self.roll();
        }
        if let Err(e) = self
            .entries
            .invalidate_entries_if(move |key, _| key.organisation_id == Some(organisation_id))
        {
            tracing::warn!(organisation_id = %organisation_id, error = %e, "cache sweep not scheduled");
        }
        tracing::debug!(organisation_id = %organisation_id, "tenant cache invalidated for organisation");
    }

    /// The organisation itself went away or was deactivated: its own keys and
    /// every member's organisation list are stale.
    pub fn invalidate_tenant(&self, organisation_id: Uuid, member_ids: &[Uuid]) {
        self.invalidate_organisation(organisation_id);
        for member_id in member_ids {
            self.invalidate_subject(*member_id);
        }
    }

    /// A membership write touches both the tenant and the member's own lists.
    pub fn invalidate_membership(&self, organisation_id: Uuid, subject_id: Uuid) {
        self.invalidate_organisation(organisation_id);
        self.invalidate_subject(subject_id);
    }

    pub async fn org_memberships(&self, pool: &SqlitePool, subject_id: Uuid) -> AppResult<Arc<Vec<OrgMembership>>> {
        let key = self.key(Namespace::OrgMemberships, subject_id, None, None, "list");
        let value = self
            .get_or_load(key, || async move {
                let rows = store::memberships::list_orgs_for(pool, subject_id).await?;
                Ok(CachedValue::OrgMemberships(Arc::new(rows)))
            })
            .await?;

        match value {
            CachedValue::OrgMemberships(rows) => Ok(rows),
            _ => Err(mismatch(Namespace::OrgMemberships)),
        }
    }

    pub async fn org_role(&self, pool: &SqlitePool, subject_id: Uuid, organisation_id: Uuid) -> AppResult<Option<OrgRole>> {
        let key = self.key(Namespace::OrgMemberships, subject_id, Some(organisation_id), None, "role");
        let value = self
            .get_or_load(key, || async move {
                let role = store::memberships::active_org_role(pool, subject_id, organisation_id).await?;
                Ok(CachedValue::OrgRole(role))
            })
            .await?;

        match value {
            CachedValue::OrgRole(role) => Ok(role),
            _ => Err(mismatch(Namespace::OrgMemberships)),
        }
    }

    pub async fn project_facts(
        &self,
        pool: &SqlitePool,
        subject_id: Uuid,
        organisation_id: Uuid,
        project_id: Uuid,
    ) -> AppResult<ProjectFacts> {
        let key = self.key(
            Namespace::ProjectMemberships,
            subject_id,
            Some(organisation_id),
            Some(project_id),
            "facts",
        );
        let value = self
            .get_or_load(key, || async move {
                let facts = store::memberships::project_facts(pool, subject_id, organisation_id, project_id).await?;
                Ok(CachedValue::ProjectFacts(facts))
            })
            .await?;

        match value {
            CachedValue::ProjectFacts(facts) => Ok(facts),
            _ => Err(mismatch(Namespace::ProjectMemberships)),
        }
    }

    /// Membership facts for one decision tuple.
    pub async fn facts(&self, pool: &SqlitePool, subject_id: Uuid, ctx: &ResourceContext) -> AppResult<MembershipFacts> {
        let org_role = self.org_role(pool, subject_id, ctx.organisation_id).await?;
        let mut facts = MembershipFacts::org(org_role);
        if let Some(project_id) = ctx.project_id {
            let project = self
                .project_facts(pool, subject_id, ctx.organisation_id, project_id)
                .await?;
            facts = facts.with_project(project.in_organisation, project.role);
        }
        Ok(facts)
    }

    pub async fn accessible_projects(
        &self,
        pool: &SqlitePool,
        principal: &Principal,
        organisation_id: Uuid,
    ) -> AppResult<Arc<Vec<Project>>> {
        let key = self.key(
            Namespace::AccessibleProjects,
            principal.user_id,
            Some(organisation_id),
            None,
            principal.system_role.as_str(),
        );
        let value = self
            .get_or_load(key, || async move {
                let projects = store::projects::list_org_accessible_projects(pool, organisation_id, principal).await?;
                Ok(CachedValue::Projects(Arc::new(projects)))
            })
            .await?;

        match value {
            CachedValue::Projects(projects) => Ok(projects),
            _ => Err(mismatch(Namespace::AccessibleProjects)),
        }
    }

    /// Memoised capability decision. `detail` must identify both the access and
    /// the role set it was evaluated under.
    pub async fn decision<F, Fut>(
        &self,
        subject_id: Uuid,
        ctx: &ResourceContext,
        detail: String,
        load: F,
    ) -> AppResult<Decision>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<Decision>>,
    {
        let key = self.key(Namespace::Decisions, subject_id, Some(ctx.organisation_id), ctx.project_id, detail);
        let value = self
            .get_or_load(key, || async move { Ok(CachedValue::Decision(load().await?)) })
            .await?;

        match value {
            CachedValue::Decision(decision) => Ok(decision),
            _ => Err(mismatch(Namespace::Decisions)),
        }
    }
}

fn mismatch(namespace: Namespace) -> AppError {
    AppError::internal(format!("cache entry type mismatch in {:?}", namespace))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TenantCache {
        TenantCache::new(&CacheConfig::default())
    }

    #[tokio::test]
    async fn subject_invalidation_changes_the_key() {
        let cache = cache();
        let subject = Uuid::new_v4();
        let org = Uuid::new_v4();

        let before = cache.key(Namespace::OrgMemberships, subject, Some(org), None, "role");
        cache.entries.insert(before.clone(), CachedValue::OrgRole(Some(OrgRole::Owner))).await;
        assert!(cache.get(&before).await.is_some());

        cache.invalidate_subject(subject);

        let after = cache.key(Namespace::OrgMemberships, subject, Some(org), None, "role");
        assert_ne!(before, after);
        assert!(cache.get(&after).await.is_none());
    }

    #[tokio::test]
    async fn late_insert_after_invalidation_is_unreachable() {
        let cache = cache();
        let subject = Uuid::new_v4();
        let org = Uuid::new_v4();

        // a fetch builds its key, then the membership changes before it finishes
        let stale_key = cache.key(Namespace::OrgMemberships, subject, Some(org), None, "role");
        cache.invalidate_organisation(org);
        cache.entries.insert(stale_key, CachedValue::OrgRole(Some(OrgRole::Admin))).await;

        let fresh_key = cache.key(Namespace::OrgMemberships, subject, Some(org), None, "role");
        let loaded = cache
            .get_or_load(fresh_key, || async { Ok(CachedValue::OrgRole(None)) })
            .await
            .unwrap();
        assert!(matches!(loaded, CachedValue::OrgRole(None)));
    }

    #[tokio::test]
    async fn organisation_invalidation_leaves_other_tenants() {
        let cache = cache();
        let subject = Uuid::new_v4();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();

        let key_b = cache.key(Namespace::OrgMemberships, subject, Some(org_b), None, "role");
        cache.entries.insert(key_b.clone(), CachedValue::OrgRole(Some(OrgRole::Member))).await;

        cache.invalidate_organisation(org_a);

        let again_b = cache.key(Namespace::OrgMemberships, subject, Some(org_b), None, "role");
        assert_eq!(key_b, again_b);
        assert!(cache.get(&again_b).await.is_some());
    }

    #[tokio::test]
    async fn tenant_invalidation_reaches_member_lists() {
        let cache = cache();
        let member = Uuid::new_v4();
        let org = Uuid::new_v4();

        let list = cache.key(Namespace::OrgMemberships, member, None, None, "list");
        cache.entries.insert(list.clone(), CachedValue::OrgMemberships(Arc::new(Vec::new()))).await;

        cache.invalidate_organisation(org);
        assert_eq!(list, cache.key(Namespace::OrgMemberships, member, None, None, "list"));

        cache.invalidate_tenant(org, &[member]);
        let fresh = cache.key(Namespace::OrgMemberships, member, None, None, "list");
        assert_ne!(list, fresh);
        assert!(cache.get(&fresh).await.is_none());
    }

    #[tokio::test]
    async fn epoch_maps_stay_within_capacity() {
        let cache = TenantCache::new(&CacheConfig {
            max_capacity: 4,
            ttl: Duration::from_secs(60),
        });
        let first = Uuid::new_v4();
        let stale = cache.key(Namespace::OrgMemberships, first, None, None, "list");
        cache.invalidate_subject(first);

        for _ in 0..20 {
            cache.invalidate_subject(Uuid::new_v4());
            assert!(cache.epochs().tracked() <= 4);
        }

        // after a roll the pre-bump key is still never rebuilt
        assert!(cache.epochs().generation > 0);
        assert_ne!(stale, cache.key(Namespace::OrgMemberships, first, None, None, "list"));
    }

    #[tokio::test]
    async fn decision_loader_runs_once_per_key() {
        let cache = cache();
        let subject = Uuid::new_v4();
        let ctx = ResourceContext::organisation(Uuid::new_v4());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let decision = cache
                .decision(subject, &ctx, "org:billing.view".to_string(), || async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(Decision::Allow)
                })
                .await
                .unwrap();
            assert_eq!(decision, Decision::Allow);
        }

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
