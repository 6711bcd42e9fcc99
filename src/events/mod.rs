//! Audit trail.
//!
//! Handlers publish entries on a broadcast bus without awaiting persistence;
//! [`start_audit_listener`] appends them to `audit_log`, chaining each row to
//! the previous one with SHA-256.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::utils::db_time;

pub mod loggable;
pub use loggable::{Loggable, Severity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
    pub actor_id: Option<Uuid>,
    pub organisation_id: Option<Uuid>,
    pub subject_id: Option<Uuid>,
    pub severity: Severity,
    pub payload: Value,
}

impl AuditEvent {
    pub fn new(name: impl Into<String>, actor_id: Option<Uuid>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            occurred_at: Utc::now(),
            actor_id,
            organisation_id: None,
            subject_id: None,
            severity: Severity::Important,
            payload,
        }
    }

    pub fn with_organisation(mut self, organisation_id: Option<Uuid>) -> Self {
        self.organisation_id = organisation_id;
        self
    }

    pub fn with_subject(mut self, subject_id: Uuid) -> Self {
        self.subject_id = Some(subject_id);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

pub type EventBus = broadcast::Sender<AuditEvent>;

pub fn init_event_bus() -> (EventBus, broadcast::Receiver<AuditEvent>) {
    broadcast::channel(1024)
}

/// Request context for audit entries (IP, User-Agent, etc.)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Extract context from Axum request headers
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        let ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            });

        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Self { ip, user_agent }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPayload {
    /// The current/new state of the entity
    #[serde(rename = "new")]
    pub current: Value,
    /// The previous state (for update/delete operations)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<RequestContext>,
}

/// Publishes an administrative action on `entity`.
///
/// # Arguments
/// * `action` - The action performed (e.g., "created", "removed", "role_changed").
/// * `actor_id` - The user who performed the action.
/// * `old_entity` - Optional previous entity state (for updates/removals).
pub fn log_audit<T: Loggable>(
    event_bus: &EventBus,
    action: &str,
    actor_id: Option<Uuid>,
    entity: &T,
    old_entity: Option<&T>,
    context: Option<RequestContext>,
) {
    let payload = AuditPayload {
        current: serde_json::to_value(entity).unwrap_or_default(),
        old: old_entity.map(|e| serde_json::to_value(e).unwrap_or_default()),
        context,
    };

    let event = AuditEvent::new(
        format!("{}.{}", T::entity_type(), action),
        actor_id,
        serde_json::to_value(&payload).unwrap_or_default(),
    )
    .with_organisation(entity.organisation_id())
    .with_subject(entity.subject_id())
    .with_severity(entity.severity_for_action(action));

    publish(event_bus, event);
}

/// Publishes a free-form entry (impersonated access, enforcement divergence).
pub fn publish(event_bus: &EventBus, event: AuditEvent) {
    // no receiver only happens during shutdown; auditing must not fail the request
    if event_bus.send(event).is_err() {
        tracing::warn!("audit event dropped: no listener");
    }
}

fn describe(name: &str) -> &'static str {
    match name {
        "organisation.created" => "Organisation created",
        "organisation.updated" => "Organisation updated",
        "organisation.deleted" => "Organisation deleted",
        "organisation_member.added" => "Organisation member added",
        "organisation_member.removed" => "Organisation member removed",
        "organisation_member.role_changed" => "Organisation role changed",
        "invitation.created" => "Invitation sent",
        "invitation.accepted" => "Invitation accepted",
        "invitation.revoked" => "Invitation revoked",
        "project.created" => "Project created",
        "project.updated" => "Project updated",
        "project.deleted" => "Project deleted",
        "project_member.added" => "Project member added",
        "project_member.removed" => "Project member removed",
        "project_member.role_changed" => "Project role changed",
        "user.system_role_changed" => "System role changed",
        "impersonation.set" => "View-as overlay set",
        "impersonation.rejected" => "View-as overlay rejected",
        "impersonation.cleared" => "View-as overlay cleared",
        "impersonation.access" => "Access under view-as overlay",
        "authz.divergence" => "Authorization enforcement divergence",
        _ => "Audit event",
    }
}

pub async fn start_audit_listener(mut rx: broadcast::Receiver<AuditEvent>, pool: SqlitePool) {
    tracing::info!("Audit listener started");
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::error!(skipped, "audit listener lagged; entries lost");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if let Err(e) = append(&pool, &event).await {
            tracing::error!(event = %event.name, "Failed to append audit entry: {}", e);
        }
    }
    tracing::info!("Audit listener stopped");
}

async fn append(pool: &SqlitePool, event: &AuditEvent) -> Result<(), sqlx::Error> {
    let payload_str = serde_json::to_string(&event.payload).unwrap_or_default();
    let mut tx = pool.begin().await?;

    let prev = sqlx::query("SELECT seq, hash FROM audit_log ORDER BY seq DESC LIMIT 1")
        .fetch_optional(&mut *tx)
        .await?;
    let (prev_seq, prev_hash): (i64, Option<String>) = match prev {
        Some(row) => (row.try_get("seq")?, Some(row.try_get("hash")?)),
        None => (0, None),
    };

    // SHA256(prev_hash || name || payload)
    let mut hasher = Sha256::new();
    if let Some(ref ph) = prev_hash {
        hasher.update(ph.as_bytes());
    }
    hasher.update(event.name.as_bytes());
    hasher.update(payload_str.as_bytes());
    let hash = hex::encode(hasher.finalize());

    sqlx::query(
        r#"
        INSERT INTO audit_log (id, seq, event_name, description, actor_id, organisation_id, subject_id, occurred_at, payload, severity, prev_hash, hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.id.to_string())
    .bind(prev_seq + 1)
    .bind(&event.name)
    .bind(describe(&event.name))
    .bind(event.actor_id.map(|u| u.to_string()))
    .bind(event.organisation_id.map(|u| u.to_string()))
    .bind(event.subject_id.map(|u| u.to_string()))
    .bind(db_time(event.occurred_at))
    .bind(&payload_str)
    .bind(event.severity.as_str())
    .bind(&prev_hash)
    .bind(&hash)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Recomputes the chain; returns the sequence number of the first broken link.
pub async fn verify_chain(pool: &SqlitePool) -> Result<Option<i64>, sqlx::Error> {
    let rows = sqlx::query("SELECT seq, event_name, payload, prev_hash, hash FROM audit_log ORDER BY seq")
        .fetch_all(pool)
        .await?;

    let mut expected_prev: Option<String> = None;
    for row in rows {
        let seq: i64 = row.try_get("seq")?;
        let name: String = row.try_get("event_name")?;
        let payload: String = row.try_get("payload")?;
        let prev_hash: Option<String> = row.try_get("prev_hash")?;
        let hash: String = row.try_get("hash")?;

        let mut hasher = Sha256::new();
        if let Some(ref ph) = prev_hash {
            hasher.update(ph.as_bytes());
        }
        hasher.update(name.as_bytes());
        hasher.update(payload.as_bytes());

        if prev_hash != expected_prev || hex::encode(hasher.finalize()) != hash {
            return Ok(Some(seq));
        }
        expected_prev = Some(hash);
    }

    Ok(None)
}
