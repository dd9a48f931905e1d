//! Converges stored grants to a [`PolicyDeclaration`].
//!
//! Roles are processed one at a time. Each role's diff is computed against a
//! revisioned snapshot of its grants and applied as one atomic compare-and-swap
//! write, so an interrupted run leaves every finished role converged and every
//! unfinished role untouched.
//!
//! Failure isolation:
//! - an unknown role fails that role only;
//! - an unknown permission code is skipped and reported, the rest of the
//!   role's diff still applies;
//! - a stale snapshot is reported as `Conflict` and must be retried;
//! - losing the store connection aborts the run.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::errors::{AppError, AppResult};
use crate::events::{log_activity, EventBus};
use crate::models::rbac::{GrantChange, GrantSource, Permission};
use crate::policy::{DesiredGrants, PolicyDeclaration};
use crate::store::{superuser_role, GrantDiff, GrantStore};

mod lint;
mod report;

pub use lint::{lint, LintReport};
pub use report::{ReconcileReport, ReportTotals, RoleOutcome, RoleReport};

static WHOLE_CATALOG: DesiredGrants = DesiredGrants::All;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Apply,
    Plan,
}

/// Superuser completeness check.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SuperuserAudit {
    pub role_id: Option<i64>,
    pub missing: Vec<String>,
    pub complete: bool,
}

/// Per-role async locks so concurrent runs inside one process queue up
/// instead of conflicting.
#[derive(Default)]
struct RoleLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl RoleLocks {
    async fn for_role(&self, role_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.inner.lock().await;
        Arc::clone(locks.entry(role_id).or_default())
    }
}

pub struct Reconciler {
    store: Arc<dyn GrantStore>,
    events: Option<EventBus>,
    locks: RoleLocks,
}

impl Reconciler {
    pub fn new(store: Arc<dyn GrantStore>) -> Self {
        Self {
            store,
            events: None,
            locks: RoleLocks::default(),
        }
    }

    /// Publish every applied add/remove on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub async fn reconcile(&self, policy: &PolicyDeclaration) -> AppResult<ReconcileReport> {
        self.run(policy, Mode::Apply).await
    }

    /// Dry run: report the diff without writing it.
    pub async fn plan(&self, policy: &PolicyDeclaration) -> AppResult<ReconcileReport> {
        self.run(policy, Mode::Plan).await
    }

    /// Reconcile, then re-run only the roles that hit a conflict, up to
    /// `max_attempts` runs in total. Conflicts left after the last attempt stay
    /// in the report.
    pub async fn reconcile_with_retry(
        &self,
        policy: &PolicyDeclaration,
        max_attempts: u32,
    ) -> AppResult<ReconcileReport> {
        let mut report = self.reconcile(policy).await?;

        while report.attempts < max_attempts.max(1) {
            let conflicted = report.conflicted_role_ids();
            if conflicted.is_empty() {
                break;
            }
            tracing::info!(attempt = report.attempts + 1, roles = ?conflicted, "retrying conflicted roles");
            let retry = self.reconcile(&policy.restricted_to(&conflicted)).await?;
            report.merge_retry(retry);
            report.attempts += 1;
        }

        Ok(report)
    }

    pub async fn verify_superuser(&self) -> AppResult<SuperuserAudit> {
        let catalog = self.store.list_permissions().await?;

        let Some(role) = superuser_role(self.store.as_ref()).await? else {
            return Ok(SuperuserAudit {
                role_id: None,
                missing: catalog.into_iter().map(|p| p.code).collect(),
                complete: false,
            });
        };

        let held = self.store.role_grants(role.id).await?.permission_ids;
        let missing: Vec<String> = catalog
            .into_iter()
            .filter(|p| !held.contains(&p.id))
            .map(|p| p.code)
            .collect();

        Ok(SuperuserAudit {
            role_id: Some(role.id),
            complete: missing.is_empty(),
            missing,
        })
    }

    async fn run(&self, policy: &PolicyDeclaration, mode: Mode) -> AppResult<ReconcileReport> {
        let started_at = Utc::now();
        let mut roles = Vec::new();

        // A wildcard pointing at the wrong role fails that entry, but the
        // registered superuser still gets the whole catalog.
        let undeclared_superuser = match policy.superuser_role_id() {
            Some(declared) => superuser_role(self.store.as_ref())
                .await?
                .map(|role| role.id)
                .filter(|id| *id != declared && policy.get(*id).is_none()),
            None => None,
        };
        if let Some(role_id) = undeclared_superuser {
            tracing::warn!(role_id, "policy wildcard names another role; reconciling the registered superuser anyway");
        }
        let entries = policy
            .entries()
            .chain(undeclared_superuser.map(|role_id| (role_id, &WHOLE_CATALOG)));

        for (role_id, desired) in entries {
            let role_report = match self.reconcile_role(role_id, desired, mode).await {
                Ok(report) => report,
                Err(e) if e.is_fatal() => {
                    tracing::error!(role_id, error = %e, "store failure; aborting reconciliation");
                    return Err(e);
                }
                Err(e) => RoleReport::new(role_id).fail(&e),
            };

            tracing::info!(
                role_id,
                added = role_report.added.len(),
                removed = role_report.removed.len(),
                skipped_missing = role_report.skipped_missing.len(),
                outcome = ?role_report.outcome,
                dry_run = mode == Mode::Plan,
                "role reconciled"
            );
            roles.push(role_report);
        }

        Ok(ReconcileReport {
            dry_run: mode == Mode::Plan,
            attempts: 1,
            started_at,
            finished_at: Utc::now(),
            roles,
        })
    }

    async fn reconcile_role(&self, role_id: i64, desired: &DesiredGrants, mode: Mode) -> AppResult<RoleReport> {
        let role = self.store.find_role(role_id).await?.ok_or(AppError::UnknownRole(role_id))?;

        let lock = self.locks.for_role(role_id).await;
        let _guard = lock.lock().await;

        let mut report = RoleReport::new(role_id);
        report.role_name = Some(role.name.clone());
        report.superuser = role.is_superuser;

        let catalog = self.store.list_permissions().await?;
        let by_code: HashMap<&str, &Permission> = catalog.iter().map(|p| (p.code.as_str(), p)).collect();
        let code_of = |id: i64| {
            catalog
                .iter()
                .find(|p| p.id == id)
                .map(|p| p.code.clone())
                .unwrap_or_else(|| format!("#{id}"))
        };

        let desired_ids: BTreeSet<i64> = match (desired, role.is_superuser) {
            (DesiredGrants::All, true) => catalog.iter().map(|p| p.id).collect(),
            (DesiredGrants::All, false) => {
                return Err(AppError::invalid_policy(format!(
                    "role {role_id} is declared with \"*\" but is not the registered superuser"
                )));
            }
            (DesiredGrants::Codes(_), true) => {
                return Err(AppError::invalid_policy(format!(
                    "superuser role {role_id} must be declared with \"*\""
                )));
            }
            (DesiredGrants::Codes(codes), false) => {
                let mut ids = BTreeSet::new();
                for code in codes {
                    match by_code.get(code.as_str()) {
                        Some(permission) => {
                            ids.insert(permission.id);
                        }
                        None => {
                            tracing::warn!(role_id, permission = %code, "declared permission not in catalog; skipping");
                            report.skipped_missing.push(code.clone());
                        }
                    }
                }
                ids
            }
        };

        let current = self.store.role_grants(role_id).await?;
        let add: BTreeSet<i64> = desired_ids.difference(&current.permission_ids).copied().collect();
        // The superuser set only ever grows.
        let remove: BTreeSet<i64> = if role.is_superuser {
            BTreeSet::new()
        } else {
            current.permission_ids.difference(&desired_ids).copied().collect()
        };

        report.added = add.iter().map(|id| code_of(*id)).collect();
        report.removed = remove.iter().map(|id| code_of(*id)).collect();
        report.added.sort();
        report.removed.sort();

        let diff = GrantDiff {
            expected_revision: current.revision,
            add,
            remove,
        };

        if diff.is_empty() {
            report.outcome = RoleOutcome::Unchanged;
            return Ok(report);
        }

        if mode == Mode::Plan {
            report.outcome = RoleOutcome::Planned;
            return Ok(report);
        }

        match self.store.apply_grant_diff(role_id, &diff).await {
            Ok(_) => {
                report.outcome = RoleOutcome::Converged;
                self.publish(role_id, &diff, &code_of);
            }
            Err(AppError::ReconcileConflict { .. }) => {
                tracing::warn!(role_id, "grants changed during reconciliation; nothing applied");
                report.added.clear();
                report.removed.clear();
                report.outcome = RoleOutcome::Conflict;
            }
            Err(e) => return Err(e),
        }

        Ok(report)
    }

    fn publish(&self, role_id: i64, diff: &GrantDiff, code_of: &dyn Fn(i64) -> String) {
        let Some(bus) = &self.events else {
            return;
        };

        let changes = diff
            .add
            .iter()
            .map(|id| ("added", *id))
            .chain(diff.remove.iter().map(|id| ("removed", *id)));

        for (action, permission_id) in changes {
            let change = GrantChange {
                role_id,
                permission_id,
                code: code_of(permission_id),
                source: GrantSource::Reconcile,
            };
            log_activity(bus, action, None, &change, None);
        }
    }
}
