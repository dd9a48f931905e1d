use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{GrantDiff, GrantStore, RoleGrants};
use crate::errors::{AppError, AppResult};
use crate::models::rbac::{Grant, NewPermission, NewRole, Permission, Role};

#[derive(Debug, Default)]
struct State {
    permissions: BTreeMap<i64, Permission>,
    roles: BTreeMap<i64, Role>,
    grants: BTreeSet<Grant>,
    next_permission_id: i64,
}

impl State {
    fn permission_by_code(&self, code: &str) -> Option<&Permission> {
        self.permissions.values().find(|p| p.code == code)
    }

    fn bump(&mut self, role_id: i64) -> AppResult<i64> {
        let role = self.roles.get_mut(&role_id).ok_or(AppError::UnknownRole(role_id))?;
        role.grant_revision += 1;
        role.updated_at = Utc::now();
        Ok(role.grant_revision)
    }
}

/// In-process store with the same semantics as the SQLite one.
#[derive(Debug, Default)]
pub struct MemoryGrantStore {
    state: RwLock<State>,
}

impl MemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn list_permissions(&self) -> AppResult<Vec<Permission>> {
        let state = self.state.read().await;
        let mut permissions: Vec<Permission> = state.permissions.values().cloned().collect();
        permissions.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(permissions)
    }

    async fn find_permission(&self, code: &str) -> AppResult<Option<Permission>> {
        Ok(self.state.read().await.permission_by_code(code).cloned())
    }

    async fn insert_permission(&self, permission: NewPermission) -> AppResult<Permission> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.permission_by_code(permission.code.as_str()) {
            return Ok(existing.clone());
        }

        state.next_permission_id += 1;
        let now = Utc::now();
        let created = Permission {
            id: state.next_permission_id,
            code: permission.code.into(),
            description: permission.description,
            created_at: now,
            updated_at: now,
        };
        state.permissions.insert(created.id, created.clone());
        Ok(created)
    }

    async fn list_roles(&self) -> AppResult<Vec<Role>> {
        Ok(self.state.read().await.roles.values().cloned().collect())
    }

    async fn find_role(&self, role_id: i64) -> AppResult<Option<Role>> {
        Ok(self.state.read().await.roles.get(&role_id).cloned())
    }

    async fn insert_role(&self, role: NewRole) -> AppResult<Role> {
        let mut state = self.state.write().await;
        let collides = state.roles.values().any(|existing| {
            existing.id == role.id || existing.name == role.name || (role.is_superuser && existing.is_superuser)
        });
        if collides {
            return Err(AppError::conflict(format!(
                "role {} ({}) collides with an existing id, name or superuser",
                role.id, role.name
            )));
        }

        let now = Utc::now();
        let created = Role {
            id: role.id,
            name: role.name,
            description: role.description,
            is_superuser: role.is_superuser,
            grant_revision: 0,
            created_at: now,
            updated_at: now,
        };
        state.roles.insert(created.id, created.clone());
        Ok(created)
    }

    async fn role_grants(&self, role_id: i64) -> AppResult<RoleGrants> {
        let state = self.state.read().await;
        let role = state.roles.get(&role_id).ok_or(AppError::UnknownRole(role_id))?;
        Ok(RoleGrants {
            revision: role.grant_revision,
            permission_ids: state
                .grants
                .iter()
                .filter(|g| g.role_id == role_id)
                .map(|g| g.permission_id)
                .collect(),
        })
    }

    async fn list_grants(&self) -> AppResult<Vec<Grant>> {
        Ok(self.state.read().await.grants.iter().copied().collect())
    }

    async fn has_grant(&self, role_id: i64, code: &str) -> AppResult<bool> {
        let state = self.state.read().await;
        Ok(state
            .permission_by_code(code)
            .map(|p| state.grants.contains(&Grant { role_id, permission_id: p.id }))
            .unwrap_or(false))
    }

    async fn apply_grant_diff(&self, role_id: i64, diff: &GrantDiff) -> AppResult<i64> {
        let mut state = self.state.write().await;
        let current = state.roles.get(&role_id).ok_or(AppError::UnknownRole(role_id))?.grant_revision;
        if current != diff.expected_revision {
            return Err(AppError::ReconcileConflict { role_id });
        }
        if let Some(missing) = diff.add.iter().find(|id| !state.permissions.contains_key(*id)) {
            return Err(AppError::internal(format!("permission id {missing} is not in the catalog")));
        }

        for permission_id in &diff.add {
            state.grants.insert(Grant { role_id, permission_id: *permission_id });
        }
        for permission_id in &diff.remove {
            state.grants.remove(&Grant { role_id, permission_id: *permission_id });
        }
        state.bump(role_id)
    }

    async fn grant(&self, role_id: i64, permission_id: i64) -> AppResult<bool> {
        let mut state = self.state.write().await;
        if !state.roles.contains_key(&role_id) {
            return Err(AppError::UnknownRole(role_id));
        }
        if !state.permissions.contains_key(&permission_id) {
            return Err(AppError::not_found(format!("permission id {permission_id}")));
        }
        let inserted = state.grants.insert(Grant { role_id, permission_id });
        if inserted {
            state.bump(role_id)?;
        }
        Ok(inserted)
    }

    async fn revoke(&self, role_id: i64, permission_id: i64) -> AppResult<bool> {
        let mut state = self.state.write().await;
        if !state.roles.contains_key(&role_id) {
            return Err(AppError::UnknownRole(role_id));
        }
        let removed = state.grants.remove(&Grant { role_id, permission_id });
        if removed {
            state.bump(role_id)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> MemoryGrantStore {
        let store = MemoryGrantStore::new();
        store.insert_role(NewRole::new(1, "Owner").superuser()).await.unwrap();
        store.insert_role(NewRole::new(7, "Technician")).await.unwrap();
        store
            .insert_permission(NewPermission::new("workorder.view", "View work orders").unwrap())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn insert_permission_is_insert_if_absent() {
        let store = seeded().await;
        let again = store
            .insert_permission(NewPermission::new("workorder.view", "different text").unwrap())
            .await
            .unwrap();
        assert_eq!(again.description.as_deref(), Some("View work orders"));
        assert_eq!(store.list_permissions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_duplicate_roles_and_second_superuser() {
        let store = seeded().await;
        assert!(matches!(store.insert_role(NewRole::new(7, "Other")).await, Err(AppError::Conflict(_))));
        assert!(matches!(store.insert_role(NewRole::new(8, "Technician")).await, Err(AppError::Conflict(_))));
        assert!(matches!(
            store.insert_role(NewRole::new(9, "Root").superuser()).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn stale_revision_is_a_conflict_and_writes_nothing() {
        let store = seeded().await;
        let perm = store.find_permission("workorder.view").await.unwrap().unwrap();

        let diff = GrantDiff {
            expected_revision: 0,
            add: BTreeSet::from([perm.id]),
            remove: BTreeSet::new(),
        };
        assert_eq!(store.apply_grant_diff(7, &diff).await.unwrap(), 1);

        let stale = GrantDiff {
            expected_revision: 0,
            add: BTreeSet::new(),
            remove: BTreeSet::from([perm.id]),
        };
        assert!(matches!(
            store.apply_grant_diff(7, &stale).await,
            Err(AppError::ReconcileConflict { role_id: 7 })
        ));
        assert!(store.has_grant(7, "workorder.view").await.unwrap());
    }

    #[tokio::test]
    async fn one_off_grant_and_revoke_bump_revision_only_on_change() {
        let store = seeded().await;
        let perm = store.find_permission("workorder.view").await.unwrap().unwrap();

        assert!(store.grant(7, perm.id).await.unwrap());
        assert!(!store.grant(7, perm.id).await.unwrap());
        assert_eq!(store.role_grants(7).await.unwrap().revision, 1);

        assert!(store.revoke(7, perm.id).await.unwrap());
        assert!(!store.revoke(7, perm.id).await.unwrap());
        assert_eq!(store.role_grants(7).await.unwrap().revision, 2);

        assert!(matches!(store.grant(99, perm.id).await, Err(AppError::UnknownRole(99))));
    }
}
