use axum::Router;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::openapi::server::Server;
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::{authz, models, routes, tenant};

#[derive(OpenApi)]
#[openapi(
    paths(
        routes::health::health,
        routes::auth::register,
        routes::auth::login,
        routes::auth::me,
        routes::auth::logout,
        routes::context::get_context,
        routes::context::switch_organisation,
        routes::context::switch_project,
        routes::context::set_view_as,
        routes::context::clear_view_as,
        routes::access::decide,
        routes::access::capabilities,
        routes::admin::set_system_role,
        routes::organisations::list_organisations,
        routes::organisations::create_organisation,
        routes::organisations::get_organisation,
        routes::organisations::update_organisation,
        routes::organisations::delete_organisation,
        routes::organisations::set_default_organisation,
        routes::members::list_org_members,
        routes::members::add_org_member,
        routes::members::change_org_role,
        routes::members::remove_org_member,
        routes::members::list_project_members,
        routes::members::add_project_member,
        routes::members::change_project_role,
        routes::members::remove_project_member,
        routes::invitations::list_invitations,
        routes::invitations::invite_member,
        routes::invitations::revoke_invitation,
        routes::invitations::accept_invitation,
        routes::projects::list_projects,
        routes::projects::create_project,
        routes::projects::get_project,
        routes::projects::update_project,
        routes::projects::delete_project,
        routes::projects::set_default_project,
    ),
    components(
        schemas(
            authz::SystemRole,
            authz::OrgRole,
            authz::ProjectRole,
            authz::OrgResource,
            authz::OrgAction,
            authz::ProjectResource,
            authz::ProjectAction,
            authz::Decision,
            tenant::ImpersonationOverlay,
            tenant::ContextStatus,
            tenant::ContextSnapshot,
            routes::health::HealthResponse,
            routes::auth::MeResponse,
            models::user::User,
            models::user::AuthResponse,
            models::user::LoginRequest,
            models::user::RegisterRequest,
            models::user::SystemRoleUpdateRequest,
            models::organisation::Organisation,
            models::organisation::OrganisationSettings,
            models::organisation::Branding,
            models::organisation::OrganisationCreateRequest,
            models::organisation::OrganisationUpdateRequest,
            models::membership::OrgMembership,
            models::membership::OrgMemberView,
            models::membership::AddOrgMemberRequest,
            models::membership::ChangeOrgRoleRequest,
            models::membership::Invitation,
            models::membership::InviteMemberRequest,
            models::membership::InvitationCreated,
            models::membership::AcceptInvitationRequest,
            models::membership::ProjectMembership,
            models::membership::ProjectMembershipRecord,
            models::membership::ProjectMemberView,
            models::membership::AddProjectMemberRequest,
            models::membership::ChangeProjectRoleRequest,
            models::project::Project,
            models::project::ProjectStatus,
            models::project::ProjectCreateRequest,
            models::project::ProjectUpdateRequest,
            models::context::SwitchOrganisationRequest,
            models::context::SwitchProjectRequest,
            models::context::ViewAsRequest,
            models::context::ViewAsResponse,
            models::access::DecideRequest,
            models::access::DecideResponse,
            models::access::OrgCapability,
            models::access::ProjectCapability,
            models::access::CapabilitiesResponse,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "Health", description = "Liveness and database check"),
        (name = "Auth", description = "Registration, login and sessions"),
        (name = "Context", description = "Tenant selection and view-as preview"),
        (name = "Access", description = "Authorization decisions and capabilities"),
        (name = "Admin", description = "System administration"),
        (name = "Organisations", description = "Organisations and their settings"),
        (name = "Members", description = "Organisation and project rosters"),
        (name = "Invitations", description = "Organisation invitations"),
        (name = "Projects", description = "Projects within an organisation")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearerAuth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn build_openapi(port: u16) -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    doc.servers = Some(vec![Server::new(format!("http://localhost:{port}"))]);
    doc
}

pub fn swagger_routes(doc: utoipa::openapi::OpenApi) -> Router {
    let config = utoipa_swagger_ui::Config::new(["/api-docs/openapi.json"])
        .try_it_out_enabled(true)
        .persist_authorization(true);

    Router::new().merge(
        SwaggerUi::new("/docs")
            .url("/api-docs/openapi.json", doc)
            .config(config),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_carries_bearer_scheme_and_tenant_paths() {
        let doc = build_openapi(8000);
        let components = doc.components.as_ref().expect("components");
        assert!(components.security_schemes.contains_key("bearerAuth"));
        assert!(doc.paths.paths.contains_key("/context/view-as"));
        assert!(doc.paths.paths.contains_key("/organisations/{org_id}/projects/{project_id}/members"));
    }
}
