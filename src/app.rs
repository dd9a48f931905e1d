use std::sync::Arc;

use axum::http::Method;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get};
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::authz::middleware::require_permission;
use crate::authz::{AuthorizationGate, GrantGate};
use crate::events::EventBus;
use crate::policy::PolicyDeclaration;
use crate::reconcile::Reconciler;
use crate::routes::{health, rbac};
use crate::store::{GrantStore, SqliteGrantStore};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub store: Arc<dyn GrantStore>,
    pub gate: Arc<dyn AuthorizationGate>,
    pub reconciler: Arc<Reconciler>,
    pub event_bus: EventBus,
    /// Declaration used when a reconciliation request carries no policy body.
    pub policy: Arc<PolicyDeclaration>,
    pub reconcile_max_attempts: u32,
}

impl AppState {
    pub fn new(pool: SqlitePool, policy: PolicyDeclaration, event_bus: EventBus) -> Self {
        let store: Arc<dyn GrantStore> = Arc::new(SqliteGrantStore::new(pool.clone()));
        let gate: Arc<dyn AuthorizationGate> = Arc::new(GrantGate::new(Arc::clone(&store)));
        let reconciler = Reconciler::new(Arc::clone(&store)).with_events(event_bus.clone());

        Self {
            pool,
            store,
            gate,
            reconciler: Arc::new(reconciler),
            event_bus,
            policy: Arc::new(policy),
            reconcile_max_attempts: 3,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.reconcile_max_attempts = attempts;
        self
    }
}

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers(Any);

    // Everything added before `route_layer` is gated on the permission
    // derived from method + path; health is added after and stays open.
    let api_routes = Router::new()
        .route("/roles", get(rbac::list_roles))
        .route("/permissions", get(rbac::list_permissions).post(rbac::create_permission))
        .route("/grants", get(rbac::list_grants).post(rbac::create_grant))
        .route("/grants/:role_id/:permission_id", delete(rbac::delete_grant))
        .route(
            "/reconciliations",
            get(rbac::plan_reconciliation).post(rbac::run_reconciliation),
        )
        .route("/authorizations", get(rbac::explain_authorization))
        .route("/audits", get(rbac::superuser_audit))
        .route_layer(from_fn_with_state(state.clone(), require_permission))
        .route("/health", get(health::health));

    Router::new()
        .nest("/api", api_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
