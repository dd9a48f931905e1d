use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use super::{GrantDiff, GrantStore, RoleGrants};
use crate::db::row_parsers::{permission_from_row, role_from_row};
use crate::errors::{AppError, AppResult};
use crate::models::rbac::{Grant, NewPermission, NewRole, Permission, Role};

const ROLE_COLUMNS: &str = "id, name, description, is_superuser, grant_revision, created_at, updated_at";
const PERMISSION_COLUMNS: &str = "id, code, description, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct SqliteGrantStore {
    pool: SqlitePool,
}

impl SqliteGrantStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn role_exists(&self, role_id: i64) -> AppResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM roles WHERE id = ?")
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Single-row grant change that bumps the role revision in the same transaction.
    async fn mutate_one(&self, role_id: i64, permission_id: i64, insert: bool) -> AppResult<bool> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query("UPDATE roles SET grant_revision = grant_revision + 1, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        if bumped.rows_affected() == 0 {
            return Err(AppError::UnknownRole(role_id));
        }

        let changed = if insert {
            sqlx::query("INSERT OR IGNORE INTO role_permissions (role_id, permission_id, created_at) VALUES (?, ?, ?)")
                .bind(role_id)
                .bind(permission_id)
                .bind(&now)
                .execute(&mut *tx)
                .await?
        } else {
            sqlx::query("DELETE FROM role_permissions WHERE role_id = ? AND permission_id = ?")
                .bind(role_id)
                .bind(permission_id)
                .execute(&mut *tx)
                .await?
        };

        // Nothing changed: leave the revision where it was.
        if changed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }
}

/// Rowid primary keys report their own extended code, so match the message too.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db)
        if db.is_unique_violation() || db.message().contains("UNIQUE constraint failed"))
}

#[async_trait]
impl GrantStore for SqliteGrantStore {
    async fn list_permissions(&self) -> AppResult<Vec<Permission>> {
        let rows = sqlx::query(&format!("SELECT {PERMISSION_COLUMNS} FROM permissions ORDER BY code"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(permission_from_row).collect()
    }

    async fn find_permission(&self, code: &str) -> AppResult<Option<Permission>> {
        let row = sqlx::query(&format!("SELECT {PERMISSION_COLUMNS} FROM permissions WHERE code = ?"))
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(permission_from_row).transpose()
    }

    async fn insert_permission(&self, permission: NewPermission) -> AppResult<Permission> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO permissions (code, description, created_at, updated_at) VALUES (?, ?, ?, ?) ON CONFLICT (code) DO NOTHING",
        )
        .bind(permission.code.as_str())
        .bind(&permission.description)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.find_permission(permission.code.as_str())
            .await?
            .ok_or_else(|| AppError::internal(format!("permission {} vanished after insert", permission.code)))
    }

    async fn list_roles(&self) -> AppResult<Vec<Role>> {
        let rows = sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM roles ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(role_from_row).collect()
    }

    async fn find_role(&self, role_id: i64) -> AppResult<Option<Role>> {
        let row = sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE id = ?"))
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(role_from_row).transpose()
    }

    async fn insert_role(&self, role: NewRole) -> AppResult<Role> {
        let now = Utc::now().to_rfc3339();

        let inserted = sqlx::query(
            "INSERT INTO roles (id, name, description, is_superuser, grant_revision, created_at, updated_at) VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(role.id)
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.is_superuser)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(AppError::conflict(format!(
                    "role {} ({}) collides with an existing id, name or superuser",
                    role.id, role.name
                )));
            }
            Err(e) => return Err(e.into()),
        }

        self.find_role(role.id)
            .await?
            .ok_or_else(|| AppError::internal(format!("role {} vanished after insert", role.id)))
    }

    async fn role_grants(&self, role_id: i64) -> AppResult<RoleGrants> {
        // One read transaction so the revision matches the id set.
        let mut tx = self.pool.begin().await?;

        let revision: Option<i64> = sqlx::query_scalar("SELECT grant_revision FROM roles WHERE id = ?")
            .bind(role_id)
            .fetch_optional(&mut *tx)
            .await?;
        let revision = revision.ok_or(AppError::UnknownRole(role_id))?;

        let permission_ids: BTreeSet<i64> = sqlx::query_scalar("SELECT permission_id FROM role_permissions WHERE role_id = ?")
            .bind(role_id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();

        tx.commit().await?;
        Ok(RoleGrants { revision, permission_ids })
    }

    async fn list_grants(&self) -> AppResult<Vec<Grant>> {
        let rows = sqlx::query("SELECT role_id, permission_id FROM role_permissions ORDER BY role_id, permission_id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|r| Grant {
                role_id: r.get("role_id"),
                permission_id: r.get("permission_id"),
            })
            .collect())
    }

    async fn has_grant(&self, role_id: i64, code: &str) -> AppResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT 1
            FROM role_permissions rp
            INNER JOIN permissions p ON p.id = rp.permission_id
            WHERE rp.role_id = ? AND p.code = ?
            "#,
        )
        .bind(role_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    async fn apply_grant_diff(&self, role_id: i64, diff: &GrantDiff) -> AppResult<i64> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        // The CAS write comes first so the transaction takes the write lock
        // before any grant row is touched.
        let swapped = sqlx::query(
            "UPDATE roles SET grant_revision = grant_revision + 1, updated_at = ? WHERE id = ? AND grant_revision = ?",
        )
        .bind(&now)
        .bind(role_id)
        .bind(diff.expected_revision)
        .execute(&mut *tx)
        .await?;

        if swapped.rows_affected() == 0 {
            tx.rollback().await?;
            return if self.role_exists(role_id).await? {
                Err(AppError::ReconcileConflict { role_id })
            } else {
                Err(AppError::UnknownRole(role_id))
            };
        }

        for permission_id in &diff.add {
            sqlx::query("INSERT OR IGNORE INTO role_permissions (role_id, permission_id, created_at) VALUES (?, ?, ?)")
                .bind(role_id)
                .bind(permission_id)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }

        for permission_id in &diff.remove {
            sqlx::query("DELETE FROM role_permissions WHERE role_id = ? AND permission_id = ?")
                .bind(role_id)
                .bind(permission_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(diff.expected_revision + 1)
    }

    async fn grant(&self, role_id: i64, permission_id: i64) -> AppResult<bool> {
        self.mutate_one(role_id, permission_id, true).await
    }

    async fn revoke(&self, role_id: i64, permission_id: i64) -> AppResult<bool> {
        self.mutate_one(role_id, permission_id, false).await
    }
}
