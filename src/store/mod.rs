//! Access to the permission catalog, the role registry and the grant relation.
//!
//! The grant relation is the only mutable shared state. Every mutation of a
//! role's grants bumps that role's `grant_revision`, which reconciliation uses
//! as a compare-and-swap token.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::errors::AppResult;
use crate::models::rbac::{Grant, NewPermission, NewRole, Permission, Role};

mod memory;
mod sqlite;

pub use memory::MemoryGrantStore;
pub use sqlite::SqliteGrantStore;

/// Snapshot of one role's grants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleGrants {
    pub revision: i64,
    pub permission_ids: BTreeSet<i64>,
}

/// Inserts and deletes for one role, computed against `expected_revision`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantDiff {
    pub expected_revision: i64,
    pub add: BTreeSet<i64>,
    pub remove: BTreeSet<i64>,
}

impl GrantDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn list_permissions(&self) -> AppResult<Vec<Permission>>;

    async fn find_permission(&self, code: &str) -> AppResult<Option<Permission>>;

    /// Insert-if-absent: an existing code is returned unchanged.
    async fn insert_permission(&self, permission: NewPermission) -> AppResult<Permission>;

    async fn list_roles(&self) -> AppResult<Vec<Role>>;

    async fn find_role(&self, role_id: i64) -> AppResult<Option<Role>>;

    /// Fails with `Conflict` on a duplicate id or name, or a second superuser.
    async fn insert_role(&self, role: NewRole) -> AppResult<Role>;

    /// Fails with `UnknownRole` when the role is not registered.
    async fn role_grants(&self, role_id: i64) -> AppResult<RoleGrants>;

    async fn list_grants(&self) -> AppResult<Vec<Grant>>;

    /// Unknown codes and unknown roles are simply `false`.
    async fn has_grant(&self, role_id: i64, code: &str) -> AppResult<bool>;

    /// Apply `diff` atomically. Fails with `ReconcileConflict` and writes
    /// nothing when the role's revision is no longer `diff.expected_revision`.
    /// Returns the new revision.
    async fn apply_grant_diff(&self, role_id: i64, diff: &GrantDiff) -> AppResult<i64>;

    /// One-off grant; returns whether a row was inserted.
    async fn grant(&self, role_id: i64, permission_id: i64) -> AppResult<bool>;

    /// One-off revoke; returns whether a row was deleted.
    async fn revoke(&self, role_id: i64, permission_id: i64) -> AppResult<bool>;
}

/// The registered superuser role, if any.
pub async fn superuser_role(store: &dyn GrantStore) -> AppResult<Option<Role>> {
    Ok(store.list_roles().await?.into_iter().find(|role| role.is_superuser))
}
