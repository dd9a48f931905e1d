use std::sync::Arc;

use axum::{routing::get, Json, Router};
use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::openapi::server::Server;
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::authz::ROLE_HEADER;
use crate::{models, policy, reconcile, routes};

#[derive(OpenApi)]
#[openapi(
	paths(
		routes::health::health,
		routes::rbac::list_roles,
		routes::rbac::list_permissions,
		routes::rbac::create_permission,
		routes::rbac::list_grants,
		routes::rbac::create_grant,
		routes::rbac::delete_grant,
		routes::rbac::plan_reconciliation,
		routes::rbac::run_reconciliation,
		routes::rbac::explain_authorization,
		routes::rbac::superuser_audit
	),
	components(
		schemas(
			models::rbac::Role,
			models::rbac::Permission,
			models::rbac::PermissionCreateRequest,
			models::rbac::Grant,
			models::rbac::GrantRequest,
			models::rbac::GrantView,
			models::rbac::GrantSource,
			policy::PolicyFile,
			policy::PolicyEntry,
			reconcile::ReconcileReport,
			reconcile::RoleReport,
			reconcile::ReportTotals,
			reconcile::SuperuserAudit,
			reconcile::LintReport,
			routes::health::HealthResponse,
			routes::rbac::AuthorizationExplanation
		)
	),
	modifiers(&RoleHeaderSecurity),
	tags(
		(name = "Health", description = "Liveness and database reachability"),
		(name = "RBAC", description = "Permission catalog and role grants"),
		(name = "Reconciliation", description = "Converge grants to the declared policy"),
		(name = "Authorization", description = "Decision diagnostics")
	)
)]
pub struct ApiDoc;

/// Callers are identified by the role id header an upstream proxy sets.
struct RoleHeaderSecurity;

impl Modify for RoleHeaderSecurity {
	fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
		let components = openapi.components.get_or_insert_with(Default::default);
		components.add_security_scheme(
			"roleHeader",
			SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(ROLE_HEADER))),
		);
	}
}

pub fn build_openapi(port: u16) -> utoipa::openapi::OpenApi {
	let mut doc = ApiDoc::openapi();
	doc.servers = Some(vec![Server::new(format!("http://localhost:{port}"))]);
	doc
}

pub fn swagger_routes<S>(doc: utoipa::openapi::OpenApi) -> Router<S>
where
	S: Clone + Send + Sync + 'static,
{
	let swagger_config = utoipa_swagger_ui::Config::new(["/api-docs/openapi.json"])
		.try_it_out_enabled(true)
		.persist_authorization(true);

	let doc = Arc::new(doc);
	let json_route = get(move || {
		let doc = Arc::clone(&doc);
		async move { Json((*doc).clone()) }
	});

	Router::new()
		.route("/api-docs/openapi.json", json_route)
		.merge(SwaggerUi::new("/docs").config(swagger_config))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn document_lists_admin_paths_and_role_header_scheme() {
		let doc = serde_json::to_value(build_openapi(8000)).unwrap();

		for path in ["/api/health", "/api/grants", "/api/grants/{role_id}/{permission_id}", "/api/reconciliations"] {
			assert!(doc["paths"].get(path).is_some(), "{path} missing");
		}
		assert_eq!(doc["components"]["securitySchemes"]["roleHeader"]["name"], ROLE_HEADER);
		assert_eq!(doc["servers"][0]["url"], "http://localhost:8000");
	}
}
