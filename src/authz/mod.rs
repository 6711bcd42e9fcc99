//! Authorization module - role model, permission tables and policy engine
//!
//! This module implements the hierarchical tenancy policy with support for:
//! - System, organisation and project role axes
//! - Static permission tables compiled into the binary and materialised into SQL
//! - Data-store enforcement with an in-process mirror for UI gating
//! - Configurable parity checking between the two (off/advisory/strict)

mod decision;
mod evaluator;
mod guard;
mod predicate;
mod principal;
mod roles;
mod tables;

pub use decision::{decide, decide_for_roles, MembershipFacts, ProjectFacts};
pub use evaluator::{Authorizer, DataStoreEvaluator, MirrorEvaluator, PolicyEvaluator};
pub use guard::{filter_visible, require, require_any};
pub use predicate::{decision_query, project_rows_clause, sync_grant_tables, visible_projects_clause, Predicate};
pub use principal::{Access, Decision, Principal, ResourceContext, UnknownAccess};
pub use roles::{OrgRole, ProjectRole, SystemRole, UnknownRole};
pub use tables::{
    has_org_permission, has_project_permission, org_grants, project_grants, OrgAction, OrgResource,
    ProjectAction, ProjectResource,
};

/// How the in-process mirror is cross-checked against the data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityMode {
    /// Data store only (mirror not consulted)
    Off,
    /// Log and audit divergence, serve the data-store answer
    Advisory,
    /// Fail the request on divergence
    Strict,
}

impl ParityMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "off" => ParityMode::Off,
            "strict" => ParityMode::Strict,
            _ => ParityMode::Advisory,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(&std::env::var("AUTHZ_PARITY").unwrap_or_default())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParityMode::Off => "off",
            ParityMode::Advisory => "advisory",
            ParityMode::Strict => "strict",
        }
    }
}

impl Default for ParityMode {
    fn default() -> Self {
        ParityMode::Advisory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_mode_defaults_to_advisory() {
        assert_eq!(ParityMode::parse(""), ParityMode::Advisory);
        assert_eq!(ParityMode::parse("nonsense"), ParityMode::Advisory);
        assert_eq!(ParityMode::parse(" STRICT "), ParityMode::Strict);
        assert_eq!(ParityMode::parse("off"), ParityMode::Off);
    }
}
