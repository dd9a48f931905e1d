use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::store::GrantStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    Superuser,
    Grant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Nothing could be derived from the request.
    NoRequirement,
    UnknownRole,
    /// Includes codes that are not in the catalog.
    NoGrant,
    StoreUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow(AllowReason),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

/// Request-time allow/deny decision.
///
/// Implementations never fail: every error degrades to a deny.
#[async_trait]
pub trait AuthorizationGate: Send + Sync {
    async fn authorize(&self, role_id: i64, permission_code: &str) -> Decision;
}

/// Gate backed by the stored grant relation.
///
/// Evaluation order:
/// 1. empty code -> deny
/// 2. unknown role -> deny
/// 3. superuser role -> allow
/// 4. grant for (role, code) -> allow
/// 5. deny
#[derive(Clone)]
pub struct GrantGate {
    store: Arc<dyn GrantStore>,
}

impl GrantGate {
    pub fn new(store: Arc<dyn GrantStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuthorizationGate for GrantGate {
    async fn authorize(&self, role_id: i64, permission_code: &str) -> Decision {
        if permission_code.is_empty() {
            tracing::debug!(role_id, "no derivable permission; denying");
            return Decision::Deny(DenyReason::NoRequirement);
        }

        let role = match self.store.find_role(role_id).await {
            Ok(Some(role)) => role,
            Ok(None) => {
                tracing::debug!(role_id, permission = %permission_code, "unknown role; denying");
                return Decision::Deny(DenyReason::UnknownRole);
            }
            Err(e) => {
                tracing::warn!(role_id, permission = %permission_code, error = %e, "role lookup failed; denying");
                return Decision::Deny(DenyReason::StoreUnavailable);
            }
        };

        if role.is_superuser {
            tracing::debug!(role_id, permission = %permission_code, "superuser bypass");
            return Decision::Allow(AllowReason::Superuser);
        }

        match self.store.has_grant(role_id, permission_code).await {
            Ok(true) => Decision::Allow(AllowReason::Grant),
            Ok(false) => {
                tracing::debug!(role_id, permission = %permission_code, "permission denied");
                Decision::Deny(DenyReason::NoGrant)
            }
            Err(e) => {
                tracing::warn!(role_id, permission = %permission_code, error = %e, "grant lookup failed; denying");
                Decision::Deny(DenyReason::StoreUnavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{AppError, AppResult};
    use crate::models::rbac::{Grant, NewPermission, NewRole, Permission, Role};
    use crate::store::{GrantDiff, MemoryGrantStore, RoleGrants};

    async fn gate_with_grants() -> GrantGate {
        let store = MemoryGrantStore::new();
        store.insert_role(NewRole::new(1, "Owner").superuser()).await.unwrap();
        store.insert_role(NewRole::new(2, "Accountant")).await.unwrap();
        let invoice_view = store
            .insert_permission(NewPermission::new("invoice.view", "View invoices").unwrap())
            .await
            .unwrap();
        store
            .insert_permission(NewPermission::new("order.view", "View orders").unwrap())
            .await
            .unwrap();
        store.grant(2, invoice_view.id).await.unwrap();
        GrantGate::new(Arc::new(store))
    }

    #[tokio::test]
    async fn empty_code_is_denied_even_for_superuser() {
        let gate = gate_with_grants().await;
        assert_eq!(gate.authorize(1, "").await, Decision::Deny(DenyReason::NoRequirement));
        assert_eq!(gate.authorize(2, "").await, Decision::Deny(DenyReason::NoRequirement));
    }

    #[tokio::test]
    async fn superuser_is_allowed_without_explicit_grant() {
        let gate = gate_with_grants().await;
        assert_eq!(gate.authorize(1, "order.view").await, Decision::Allow(AllowReason::Superuser));
    }

    #[tokio::test]
    async fn grants_decide_for_ordinary_roles() {
        let gate = gate_with_grants().await;
        assert!(gate.authorize(2, "invoice.view").await.is_allowed());
        assert_eq!(gate.authorize(2, "order.view").await, Decision::Deny(DenyReason::NoGrant));
        assert_eq!(gate.authorize(2, "po.cancel").await, Decision::Deny(DenyReason::NoGrant));
    }

    #[tokio::test]
    async fn unknown_role_is_denied() {
        let gate = gate_with_grants().await;
        assert_eq!(gate.authorize(42, "invoice.view").await, Decision::Deny(DenyReason::UnknownRole));
    }

    struct BrokenStore;

    #[async_trait]
    impl GrantStore for BrokenStore {
        async fn list_permissions(&self) -> AppResult<Vec<Permission>> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
        async fn find_permission(&self, _: &str) -> AppResult<Option<Permission>> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
        async fn insert_permission(&self, _: NewPermission) -> AppResult<Permission> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
        async fn list_roles(&self) -> AppResult<Vec<Role>> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
        async fn find_role(&self, _: i64) -> AppResult<Option<Role>> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
        async fn insert_role(&self, _: NewRole) -> AppResult<Role> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
        async fn role_grants(&self, _: i64) -> AppResult<RoleGrants> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
        async fn list_grants(&self) -> AppResult<Vec<Grant>> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
        async fn has_grant(&self, _: i64, _: &str) -> AppResult<bool> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
        async fn apply_grant_diff(&self, _: i64, _: &GrantDiff) -> AppResult<i64> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
        async fn grant(&self, _: i64, _: i64) -> AppResult<bool> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
        async fn revoke(&self, _: i64, _: i64) -> AppResult<bool> { Err(AppError::Database(sqlx::Error::PoolClosed)) }
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let gate = GrantGate::new(Arc::new(BrokenStore));
        assert_eq!(gate.authorize(1, "order.view").await, Decision::Deny(DenyReason::StoreUnavailable));
    }

    #[tokio::test]
    async fn concurrent_decisions_agree() {
        let gate = Arc::new(gate_with_grants().await);
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    let code = if i % 2 == 0 { "invoice.view" } else { "order.view" };
                    (i, gate.authorize(2, code).await)
                })
            })
            .collect();

        for handle in handles {
            let (i, decision) = handle.await.unwrap();
            assert_eq!(decision.is_allowed(), i % 2 == 0);
        }
    }
}
