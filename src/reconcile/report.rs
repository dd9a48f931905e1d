use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoleOutcome {
    /// Actual grants already matched the declaration.
    Unchanged,
    /// The diff was applied.
    Converged,
    /// Dry run: the diff was computed but not applied.
    Planned,
    /// Grants changed underneath the run; nothing was written. Retry.
    Conflict,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoleReport {
    pub role_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
    pub superuser: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Declared codes with no catalog entry; those grants were skipped.
    pub skipped_missing: Vec<String>,
    #[schema(value_type = Object)]
    pub outcome: RoleOutcome,
}

impl RoleReport {
    pub fn new(role_id: i64) -> Self {
        Self {
            role_id,
            role_name: None,
            superuser: false,
            added: Vec::new(),
            removed: Vec::new(),
            skipped_missing: Vec::new(),
            outcome: RoleOutcome::Unchanged,
        }
    }

    pub fn fail(mut self, err: &AppError) -> Self {
        self.added.clear();
        self.removed.clear();
        self.outcome = RoleOutcome::Failed { reason: err.to_string() };
        self
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, RoleOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ReportTotals {
    pub roles: usize,
    pub added: usize,
    pub removed: usize,
    pub skipped_missing: usize,
    pub failed: usize,
    pub conflicted: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReconcileReport {
    pub dry_run: bool,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub roles: Vec<RoleReport>,
}

impl ReconcileReport {
    pub fn role(&self, role_id: i64) -> Option<&RoleReport> {
        self.roles.iter().find(|r| r.role_id == role_id)
    }

    pub fn totals(&self) -> ReportTotals {
        self.roles.iter().fold(
            ReportTotals {
                roles: self.roles.len(),
                ..ReportTotals::default()
            },
            |mut totals, role| {
                totals.added += role.added.len();
                totals.removed += role.removed.len();
                totals.skipped_missing += role.skipped_missing.len();
                match role.outcome {
                    RoleOutcome::Failed { .. } => totals.failed += 1,
                    RoleOutcome::Conflict => totals.conflicted += 1,
                    _ => {}
                }
                totals
            },
        )
    }

    pub fn conflicted_role_ids(&self) -> Vec<i64> {
        self.roles
            .iter()
            .filter(|r| r.outcome == RoleOutcome::Conflict)
            .map(|r| r.role_id)
            .collect()
    }

    /// No adds or removes were needed (or made).
    pub fn is_empty_diff(&self) -> bool {
        self.roles.iter().all(|r| r.added.is_empty() && r.removed.is_empty())
    }

    /// Every role converged or was already converged, with nothing skipped.
    pub fn is_clean(&self) -> bool {
        self.roles.iter().all(|r| {
            r.skipped_missing.is_empty() && matches!(r.outcome, RoleOutcome::Unchanged | RoleOutcome::Converged)
        })
    }

    /// Replace role entries with those from a retry run.
    pub fn merge_retry(&mut self, retry: ReconcileReport) {
        for role in retry.roles {
            match self.roles.iter_mut().find(|r| r.role_id == role.role_id) {
                Some(slot) => *slot = role,
                None => self.roles.push(role),
            }
        }
        self.finished_at = retry.finished_at;
    }
}
