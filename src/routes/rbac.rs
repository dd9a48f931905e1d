//! Admin API over the permission catalog, role grants and reconciliation.
//!
//! Every handler here sits behind the derive -> authorize middleware, so the
//! route shape decides the permission it needs (`POST /grants` needs
//! `grant.create`). Grant changes are published to the audit log with
//! Critical severity.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::app::AppState;
use crate::authz::{authorize_request, Decision, Principal};
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity, RequestContext};
use crate::models::rbac::*;
use crate::policy::PolicyDeclaration;
use crate::reconcile::{ReconcileReport, SuperuserAudit};

// =============================================================================
// ROLES & PERMISSIONS
// =============================================================================

/// List all roles
#[utoipa::path(
    get,
    path = "/api/roles",
    tag = "RBAC",
    responses(
        (status = 200, description = "List of roles", body = Vec<Role>),
        (status = 403, description = "Missing role.view"),
    ),
    security(("roleHeader" = []))
)]
pub async fn list_roles(State(state): State<AppState>) -> AppResult<Json<Vec<Role>>> {
    Ok(Json(state.store.list_roles().await?))
}

/// List the permission catalog
#[utoipa::path(
    get,
    path = "/api/permissions",
    tag = "RBAC",
    responses(
        (status = 200, description = "Permission catalog", body = Vec<Permission>),
        (status = 403, description = "Missing permission.view"),
    ),
    security(("roleHeader" = []))
)]
pub async fn list_permissions(State(state): State<AppState>) -> AppResult<Json<Vec<Permission>>> {
    Ok(Json(state.store.list_permissions().await?))
}

/// Add a permission to the catalog (insert-if-absent)
#[utoipa::path(
    post,
    path = "/api/permissions",
    tag = "RBAC",
    request_body = PermissionCreateRequest,
    responses(
        (status = 201, description = "Permission created", body = Permission),
        (status = 200, description = "Permission already existed", body = Permission),
        (status = 400, description = "Malformed permission code"),
    ),
    security(("roleHeader" = []))
)]
pub async fn create_permission(
    State(state): State<AppState>,
    principal: Principal,
    headers: HeaderMap,
    Json(req): Json<PermissionCreateRequest>,
) -> AppResult<(StatusCode, Json<Permission>)> {
    let code = PermissionCode::parse(req.code.trim())?;

    if let Some(existing) = state.store.find_permission(code.as_str()).await? {
        return Ok((StatusCode::OK, Json(existing)));
    }

    let permission = state
        .store
        .insert_permission(NewPermission {
            code,
            description: req.description,
        })
        .await?;

    log_activity(
        &state.event_bus,
        "created",
        Some(principal.role_id),
        &permission,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(permission)))
}

// =============================================================================
// GRANTS
// =============================================================================

/// List grants, optionally for one role
#[utoipa::path(
    get,
    path = "/api/grants",
    tag = "RBAC",
    params(GrantQuery),
    responses(
        (status = 200, description = "Grants", body = Vec<GrantView>),
        (status = 404, description = "Role not found"),
    ),
    security(("roleHeader" = []))
)]
pub async fn list_grants(
    State(state): State<AppState>,
    Query(query): Query<GrantQuery>,
) -> AppResult<Json<Vec<GrantView>>> {
    if let Some(role_id) = query.role_id {
        state.store.find_role(role_id).await?.ok_or(AppError::UnknownRole(role_id))?;
    }

    let codes: HashMap<i64, String> = state
        .store
        .list_permissions()
        .await?
        .into_iter()
        .map(|p| (p.id, p.code))
        .collect();

    let grants = state
        .store
        .list_grants()
        .await?
        .into_iter()
        .filter(|g| query.role_id.map_or(true, |role_id| g.role_id == role_id))
        .map(|g| GrantView {
            role_id: g.role_id,
            permission_id: g.permission_id,
            code: codes.get(&g.permission_id).cloned().unwrap_or_default(),
        })
        .collect();

    Ok(Json(grants))
}

/// Grant a permission to a role outside of reconciliation
#[utoipa::path(
    post,
    path = "/api/grants",
    tag = "RBAC",
    request_body = GrantRequest,
    responses(
        (status = 201, description = "Grant added", body = GrantView),
        (status = 200, description = "Grant already present", body = GrantView),
        (status = 404, description = "Unknown role or permission"),
    ),
    security(("roleHeader" = []))
)]
pub async fn create_grant(
    State(state): State<AppState>,
    principal: Principal,
    headers: HeaderMap,
    Json(req): Json<GrantRequest>,
) -> AppResult<(StatusCode, Json<GrantView>)> {
    let permission = state
        .store
        .find_permission(&req.permission_code)
        .await?
        .ok_or_else(|| AppError::UnknownPermission(req.permission_code.clone()))?;

    let inserted = state.store.grant(req.role_id, permission.id).await?;

    let view = GrantView {
        role_id: req.role_id,
        permission_id: permission.id,
        code: permission.code,
    };

    if !inserted {
        return Ok((StatusCode::OK, Json(view)));
    }

    let change = GrantChange {
        role_id: view.role_id,
        permission_id: view.permission_id,
        code: view.code.clone(),
        source: GrantSource::Manual,
    };
    log_activity(
        &state.event_bus,
        "added",
        Some(principal.role_id),
        &change,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(view)))
}

/// Revoke a permission from a role outside of reconciliation
#[utoipa::path(
    delete,
    path = "/api/grants/{role_id}/{permission_id}",
    tag = "RBAC",
    params(
        ("role_id" = i64, Path, description = "Role ID"),
        ("permission_id" = i64, Path, description = "Permission ID"),
    ),
    responses(
        (status = 204, description = "Grant revoked"),
        (status = 404, description = "No such grant"),
        (status = 409, description = "Grants of the superuser role cannot be revoked"),
    ),
    security(("roleHeader" = []))
)]
pub async fn delete_grant(
    State(state): State<AppState>,
    principal: Principal,
    headers: HeaderMap,
    Path((role_id, permission_id)): Path<(i64, i64)>,
) -> AppResult<StatusCode> {
    let role = state.store.find_role(role_id).await?.ok_or(AppError::UnknownRole(role_id))?;
    if role.is_superuser {
        return Err(AppError::conflict("the superuser role keeps every permission"));
    }

    let code = state
        .store
        .list_permissions()
        .await?
        .into_iter()
        .find(|p| p.id == permission_id)
        .map(|p| p.code)
        .ok_or_else(|| AppError::not_found(format!("permission id {permission_id}")))?;

    if !state.store.revoke(role_id, permission_id).await? {
        return Err(AppError::not_found(format!("role {role_id} does not hold {code}")));
    }

    let change = GrantChange {
        role_id,
        permission_id,
        code,
        source: GrantSource::Manual,
    };
    log_activity(
        &state.event_bus,
        "removed",
        Some(principal.role_id),
        &change,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// RECONCILIATION
// =============================================================================

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ReconcileParams {
    /// Compute the diff without writing it
    #[serde(default)]
    pub dry_run: bool,
}

/// Preview reconciliation of the configured policy
#[utoipa::path(
    get,
    path = "/api/reconciliations",
    tag = "Reconciliation",
    responses((status = 200, description = "Planned diff per role", body = ReconcileReport)),
    security(("roleHeader" = []))
)]
pub async fn plan_reconciliation(State(state): State<AppState>) -> AppResult<Json<ReconcileReport>> {
    Ok(Json(state.reconciler.plan(&state.policy).await?))
}

/// Reconcile stored grants to a policy
///
/// The body is an optional policy file; without one the configured policy is used.
#[utoipa::path(
    post,
    path = "/api/reconciliations",
    tag = "Reconciliation",
    params(ReconcileParams),
    request_body(content = crate::policy::PolicyFile, description = "Policy to apply instead of the configured one"),
    responses(
        (status = 200, description = "Per-role report", body = ReconcileReport),
        (status = 422, description = "Invalid policy"),
    ),
    security(("roleHeader" = []))
)]
pub async fn run_reconciliation(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<ReconcileParams>,
    body: Bytes,
) -> AppResult<Json<ReconcileReport>> {
    let supplied = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        let raw = std::str::from_utf8(&body).map_err(|_| AppError::bad_request("policy body must be UTF-8"))?;
        Some(PolicyDeclaration::from_json_str(raw)?)
    };
    let policy = supplied.as_ref().unwrap_or(state.policy.as_ref());

    tracing::info!(
        actor_role_id = principal.role_id,
        roles = policy.role_ids().len(),
        dry_run = params.dry_run,
        custom_policy = supplied.is_some(),
        "reconciliation requested"
    );

    let report = if params.dry_run {
        state.reconciler.plan(policy).await?
    } else {
        state.reconciler.reconcile_with_retry(policy, state.reconcile_max_attempts).await?
    };

    Ok(Json(report))
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

#[derive(Debug, Deserialize, IntoParams)]
pub struct AuthorizationQuery {
    pub role_id: i64,
    #[param(example = "POST")]
    pub method: String,
    #[param(example = "/workorders/42")]
    pub path: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthorizationExplanation {
    pub role_id: i64,
    pub method: String,
    pub path: String,
    /// Derived code; empty when nothing could be derived.
    pub permission: String,
    #[schema(value_type = Object, example = json!({"decision": "deny", "reason": "no_grant"}))]
    pub decision: Decision,
}

/// Explain how a request would be decided
#[utoipa::path(
    get,
    path = "/api/authorizations",
    tag = "Authorization",
    params(AuthorizationQuery),
    responses((status = 200, description = "Derived permission and decision", body = AuthorizationExplanation)),
    security(("roleHeader" = []))
)]
pub async fn explain_authorization(
    State(state): State<AppState>,
    Query(query): Query<AuthorizationQuery>,
) -> Json<AuthorizationExplanation> {
    let (permission, decision) =
        authorize_request(state.gate.as_ref(), query.role_id, &query.method, &query.path).await;

    Json(AuthorizationExplanation {
        role_id: query.role_id,
        method: query.method,
        path: query.path,
        permission,
        decision,
    })
}

/// Check that the superuser role holds the whole catalog
#[utoipa::path(
    get,
    path = "/api/audits",
    tag = "Reconciliation",
    responses((status = 200, description = "Superuser completeness", body = SuperuserAudit)),
    security(("roleHeader" = []))
)]
pub async fn superuser_audit(State(state): State<AppState>) -> AppResult<Json<SuperuserAudit>> {
    Ok(Json(state.reconciler.verify_superuser().await?))
}
