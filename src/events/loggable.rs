use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity levels for audit entries.
/// Controls retention policies and log filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Critical events: long-term retention, never auto-delete
    Critical,
    /// Important events: medium-term retention (default)
    Important,
    /// Noise events: aggressively trimmed (e.g., 7 days)
    Noise,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Important => "important",
            Severity::Noise => "noise",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Important
    }
}

/// Trait for entities that can be written to the audit log.
pub trait Loggable: Serialize + Send + Sync {
    /// The entity type name (e.g., "organisation", "project_member")
    /// This becomes the prefix in event names like "organisation.created"
    fn entity_type() -> &'static str;

    /// The subject ID (usually the entity's primary key)
    fn subject_id(&self) -> Uuid;

    /// Tenant the entry belongs to, used to scope audit queries.
    fn organisation_id(&self) -> Option<Uuid> {
        None
    }

    /// Severity level for logs (defaults to Important)
    fn severity(&self) -> Severity {
        Severity::Important
    }

    /// Override severity based on action (e.g., "deleted" -> Critical)
    fn severity_for_action(&self, action: &str) -> Severity {
        match action {
            "deleted" | "removed" | "role_changed" => Severity::Critical,
            "created" | "updated" | "added" => self.severity(),
            _ => Severity::Important,
        }
    }
}
