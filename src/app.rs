use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::authz::{sync_grant_tables, Authorizer, ParityMode};
use crate::cache::{CacheConfig, TenantCache};
use crate::errors::{AppError, AppResult};
use crate::events::{self, AuditEvent, EventBus, Severity};
use crate::jwt::{AuthUser, JwtConfig};
use crate::routes::{access, admin, auth, context, health, invitations, members, organisations, projects};
use crate::store;
use crate::tenant::{self, ContextState, SessionConfig, SessionRegistry, SharedContext, StoreSource};

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Any principal may create an organisation; otherwise system admins only.
    pub org_self_service: bool,
    pub invitation_ttl: chrono::Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let org_self_service = std::env::var("ORG_SELF_SERVICE")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Self {
            org_self_service,
            invitation_ttl: store::invitations::ttl_from_env(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub jwt: Arc<JwtConfig>,
    pub authz: Arc<Authorizer>,
    pub cache: TenantCache,
    pub sessions: SessionRegistry,
    pub event_bus: EventBus,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn context_source(&self) -> StoreSource {
        StoreSource::new(self.pool.clone(), self.cache.clone(), self.event_bus.clone())
    }

    /// The caller's tenant context, loaded on first use in the session.
    pub async fn tenant(&self, auth: &AuthUser) -> AppResult<SharedContext> {
        let shared = self.sessions.get_or_create(auth.session_id, auth.principal()).await;
        let needs_load = matches!(
            shared.lock().await.state(),
            ContextState::Uninitialized | ContextState::Failed(_)
        );
        if needs_load {
            tenant::initialise(&shared, &self.context_source()).await?;
        }
        Ok(shared)
    }
}

pub async fn create_app(pool: SqlitePool) -> Result<Router, AppError> {
    let jwt_config = JwtConfig::from_env()?;

    sync_grant_tables(&pool).await?;

    let (event_bus, audit_rx) = events::init_event_bus();
    tokio::spawn(events::start_audit_listener(audit_rx, pool.clone()));

    let cache = TenantCache::new(&CacheConfig::from_env());
    let parity = ParityMode::from_env();
    tracing::info!(parity = ?parity, "authorization parity mode");
    let authz = Authorizer::new(pool.clone(), cache.clone(), parity).with_event_bus(event_bus.clone());

    let state = AppState {
        pool,
        jwt: Arc::new(jwt_config),
        authz: Arc::new(authz),
        cache,
        sessions: SessionRegistry::new(&SessionConfig::from_env()),
        event_bus,
        config: Arc::new(AppConfig::from_env()),
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/api/health", get(health::health))
        .nest("/auth", auth::routes())
        .nest("/context", context::routes())
        .nest("/access", access::routes())
        .nest("/admin", admin::routes())
        .nest("/organisations", organisations::routes())
        .nest("/organisations/:org_id/members", members::org_routes())
        .nest("/organisations/:org_id/invitations", invitations::org_routes())
        .nest("/invitations", invitations::routes())
        .nest("/organisations/:org_id/projects", projects::routes())
        .nest("/organisations/:org_id/projects/:project_id/members", members::project_routes())
        .layer(middleware::from_fn_with_state(state.clone(), audit_impersonated_access))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    Ok(router)
}

/// Appends `impersonation.access` for every request served while the
/// session's view-as overlay is active.
async fn audit_impersonated_access(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let session = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .and_then(|token| state.jwt.decode(token).ok());

    if let Some(claims) = session {
        if let Some(shared) = state.sessions.get(claims.sid).await {
            let (overlay, organisation_id) = {
                let ctx = shared.lock().await;
                (ctx.overlay(), ctx.selection().map(|s| s.organisation_id))
            };
            if overlay.is_active() {
                let event = AuditEvent::new(
                    "impersonation.access",
                    Some(claims.sub),
                    json!({
                        "method": request.method().as_str(),
                        "path": request.uri().path(),
                        "overlay": overlay,
                    }),
                )
                .with_organisation(organisation_id)
                .with_subject(claims.sub)
                .with_severity(Severity::Important);
                events::publish(&state.event_bus, event);
            }
        }
    }

    next.run(request).await
}
