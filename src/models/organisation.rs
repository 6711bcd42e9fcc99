use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::events::{Loggable, Severity};

/// Tenant root.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Organisation {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub settings: OrganisationSettings,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Loggable for Organisation {
    fn entity_type() -> &'static str { "organisation" }
    fn subject_id(&self) -> Uuid { self.id }
    fn organisation_id(&self) -> Option<Uuid> { Some(self.id) }
    fn severity(&self) -> Severity { Severity::Critical }
}

/// Per-tenant settings bag, stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(default)]
pub struct OrganisationSettings {
    /// Feature toggles keyed by feature name.
    pub features: BTreeMap<String, bool>,
    #[schema(example = "en-GB")]
    pub locale: String,
    #[schema(example = "GBP")]
    pub currency: String,
    pub branding: Branding,
}

impl Default for OrganisationSettings {
    fn default() -> Self {
        Self {
            features: BTreeMap::new(),
            locale: "en-GB".to_string(),
            currency: "GBP".to_string(),
            branding: Branding::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(default)]
pub struct Branding {
    #[schema(example = "#1f6feb")]
    pub primary_colour: Option<String>,
    pub logo_url: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OrganisationCreateRequest {
    #[schema(example = "Acme Consulting")]
    pub name: String,
    /// Derived from the name when omitted.
    #[schema(example = "acme")]
    pub slug: Option<String>,
    pub settings: Option<OrganisationSettings>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OrganisationUpdateRequest {
    pub name: Option<String>,
    pub settings: Option<OrganisationSettings>,
    pub is_active: Option<bool>,
}
