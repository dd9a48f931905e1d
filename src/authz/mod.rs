//! Authorization core: permission derivation and the allow/deny gate.
//!
//! The routing layer calls
//! `authorize(principal.role_id, derive(method, path))` and rejects the
//! request on deny. [`authorize_request`] is that composition; the axum
//! middleware in [`middleware`] wraps it for routers in this crate.
//!
//! Decisions fail closed: an empty derived code, an unknown role, an unknown
//! code, or a store error is a deny.

mod deriver;
mod gate;
pub mod middleware;
mod principal;

pub use deriver::{derive, derive_code, resource_token, singularize, Action};
pub use gate::{AllowReason, AuthorizationGate, Decision, DenyReason, GrantGate};
pub use principal::{Principal, ROLE_HEADER};

/// Derive the code for `method path` and decide it for `role_id`.
pub async fn authorize_request(
    gate: &dyn AuthorizationGate,
    role_id: i64,
    method: &str,
    path: &str,
) -> (String, Decision) {
    let code = derive(method, path);
    let decision = gate.authorize(role_id, &code).await;
    (code, decision)
}
