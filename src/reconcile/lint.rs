use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use utoipa::ToSchema;

use crate::authz::Action;
use crate::errors::AppResult;
use crate::models::rbac::PermissionCode;
use crate::policy::PolicyDeclaration;
use crate::store::GrantStore;

/// Catalog and policy hygiene findings. None of them block reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct LintReport {
    /// Catalog codes no ordinary role holds; only the superuser can pass them.
    pub superuser_only: Vec<String>,
    /// Codes the policy declares that the catalog does not contain.
    pub unknown_codes: Vec<String>,
    /// Catalog codes no request can ever derive. They are only reachable
    /// through explicit checks.
    pub non_derivable: Vec<String>,
}

impl LintReport {
    pub fn is_clean(&self) -> bool {
        self.superuser_only.is_empty() && self.unknown_codes.is_empty()
    }
}

fn is_derivable(code: &str) -> bool {
    match PermissionCode::parse(code) {
        Ok(code) => Action::is_derivable(code.action()),
        Err(_) => false,
    }
}

pub async fn lint(store: &dyn GrantStore, policy: Option<&PolicyDeclaration>) -> AppResult<LintReport> {
    let catalog = store.list_permissions().await?;
    let roles = store.list_roles().await?;
    let superusers: BTreeSet<i64> = roles.iter().filter(|r| r.is_superuser).map(|r| r.id).collect();

    let mut holders: HashMap<i64, usize> = HashMap::new();
    for grant in store.list_grants().await? {
        if !superusers.contains(&grant.role_id) {
            *holders.entry(grant.permission_id).or_default() += 1;
        }
    }

    let superuser_only = catalog
        .iter()
        .filter(|p| !holders.contains_key(&p.id))
        .map(|p| p.code.clone())
        .collect();

    let non_derivable = catalog
        .iter()
        .filter(|p| !is_derivable(&p.code))
        .map(|p| p.code.clone())
        .collect();

    let unknown_codes = match policy {
        Some(policy) => {
            let known: BTreeSet<&str> = catalog.iter().map(|p| p.code.as_str()).collect();
            policy
                .declared_codes()
                .into_iter()
                .filter(|code| !known.contains(code))
                .map(String::from)
                .collect()
        }
        None => Vec::new(),
    };

    let report = LintReport {
        superuser_only,
        unknown_codes,
        non_derivable,
    };
    tracing::info!(
        superuser_only = report.superuser_only.len(),
        unknown_codes = report.unknown_codes.len(),
        non_derivable = report.non_derivable.len(),
        "lint finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rbac::{NewPermission, NewRole};
    use crate::store::MemoryGrantStore;

    #[tokio::test]
    async fn reports_each_kind_of_finding() {
        let store = MemoryGrantStore::new();
        store.insert_role(NewRole::new(1, "Owner").superuser()).await.unwrap();
        store.insert_role(NewRole::new(7, "Technician")).await.unwrap();
        let view = store
            .insert_permission(NewPermission::new("workorder.view", "View work orders").unwrap())
            .await
            .unwrap();
        let approve = store
            .insert_permission(NewPermission::new("po.approve", "Approve purchase orders").unwrap())
            .await
            .unwrap();
        store.grant(7, view.id).await.unwrap();
        store.grant(1, approve.id).await.unwrap();

        let policy = PolicyDeclaration::builder()
            .superuser(1)
            .role(7, ["workorder.view", "po.cancel"])
            .build()
            .unwrap();
        let report = lint(&store, Some(&policy)).await.unwrap();

        assert_eq!(report.superuser_only, vec!["po.approve".to_string()]);
        assert_eq!(report.unknown_codes, vec!["po.cancel".to_string()]);
        assert_eq!(report.non_derivable, vec!["po.approve".to_string()]);
        assert!(!report.is_clean());
    }

    #[test]
    fn derivable_codes_have_two_segments_and_a_mapped_action() {
        assert!(is_derivable("invoice.view"));
        assert!(is_derivable("po.delete"));
        assert!(!is_derivable("invoice.void"));
        assert!(!is_derivable("report.monthly.view"));
    }
}
