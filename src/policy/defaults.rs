//! Built-in catalog, roles and policy for the print shop back office.

use serde::Serialize;

use super::PolicyDeclaration;
use crate::errors::AppResult;
use crate::models::rbac::{NewPermission, NewRole};
use crate::store::GrantStore;

/// Well-known role ids
pub mod roles {
    pub const OWNER: i64 = 1;
    pub const ACCOUNTANT: i64 = 2;
    pub const MARKETING: i64 = 3;
    pub const DESIGNER: i64 = 4;
    pub const PRODUCTION_MANAGER: i64 = 5;
    pub const WAREHOUSE: i64 = 6;
    pub const TECHNICIAN: i64 = 7;
    pub const STOREFRONT: i64 = 8;
}

/// Resources with the four derivable actions: (resource, plural label).
const CRUD_RESOURCES: &[(&str, &str)] = &[
    ("order", "orders"),
    ("invoice", "invoices"),
    ("payment", "payments"),
    ("expense", "expenses"),
    ("campaign", "marketing campaigns"),
    ("lead", "sales leads"),
    ("customer", "customers"),
    ("product", "storefront products"),
    ("inventory", "inventory records"),
    ("material", "production materials"),
    ("workorder", "work orders"),
    ("supplier", "suppliers"),
    ("po", "purchase orders"),
];

/// Everything else: admin resources and actions only reachable through
/// explicit capability checks.
const EXTRA_PERMISSIONS: &[(&str, &str)] = &[
    ("report.view", "View financial and production reports"),
    ("role.view", "View roles"),
    ("permission.view", "View the permission catalog"),
    ("permission.create", "Add permissions to the catalog"),
    ("grant.view", "View role grants"),
    ("grant.create", "Grant a permission to a role"),
    ("grant.delete", "Revoke a permission from a role"),
    ("reconciliation.view", "Preview policy reconciliation"),
    ("reconciliation.create", "Run policy reconciliation"),
    ("authorization.view", "Explain authorization decisions"),
    ("audit.view", "View superuser completeness audits"),
    ("po.approve", "Approve purchase orders"),
    ("invoice.void", "Void issued invoices"),
];

fn verb(action: &str) -> &'static str {
    match action {
        "view" => "View",
        "create" => "Create",
        "update" => "Update",
        _ => "Delete",
    }
}

pub fn default_catalog() -> AppResult<Vec<NewPermission>> {
    let mut catalog = Vec::new();
    for (resource, label) in CRUD_RESOURCES {
        for action in ["view", "create", "update", "delete"] {
            catalog.push(NewPermission::new(
                &format!("{resource}.{action}"),
                &format!("{} {label}", verb(action)),
            )?);
        }
    }
    for (code, description) in EXTRA_PERMISSIONS {
        catalog.push(NewPermission::new(code, description)?);
    }
    Ok(catalog)
}

pub fn default_roles() -> Vec<NewRole> {
    vec![
        NewRole::new(roles::OWNER, "Owner").describe("Business owner; holds every permission").superuser(),
        NewRole::new(roles::ACCOUNTANT, "Accountant").describe("Invoices, payments and expenses"),
        NewRole::new(roles::MARKETING, "Marketing").describe("Campaigns, leads and customers"),
        NewRole::new(roles::DESIGNER, "Designer").describe("Artwork for customer orders"),
        NewRole::new(roles::PRODUCTION_MANAGER, "Production Manager").describe("Plans work orders and materials"),
        NewRole::new(roles::WAREHOUSE, "Warehouse").describe("Stock and purchase order receiving"),
        NewRole::new(roles::TECHNICIAN, "Technician").describe("Runs work orders on the shop floor"),
        NewRole::new(roles::STOREFRONT, "Storefront").describe("Online store integration"),
    ]
}

fn crud(resource: &str) -> [String; 4] {
    ["view", "create", "update", "delete"].map(|action| format!("{resource}.{action}"))
}

pub fn default_policy() -> AppResult<PolicyDeclaration> {
    let accountant = [crud("invoice"), crud("payment"), crud("expense")]
        .concat()
        .into_iter()
        .chain(
            ["invoice.void", "report.view", "order.view", "customer.view", "po.view", "supplier.view"]
                .map(String::from),
        );

    let marketing = [crud("campaign"), crud("lead")].concat().into_iter().chain(
        ["customer.view", "customer.create", "customer.update", "product.view", "report.view"].map(String::from),
    );

    let production = [crud("workorder"), crud("material")].concat().into_iter().chain(
        [
            "order.view",
            "order.update",
            "inventory.view",
            "po.view",
            "po.create",
            "po.approve",
            "supplier.view",
            "report.view",
        ]
        .map(String::from),
    );

    let warehouse = crud("inventory").into_iter().chain(
        ["material.view", "material.update", "po.view", "po.update", "supplier.view"].map(String::from),
    );

    PolicyDeclaration::builder()
        .superuser(roles::OWNER)
        .role(roles::ACCOUNTANT, accountant)
        .role(roles::MARKETING, marketing)
        .role(
            roles::DESIGNER,
            ["order.view", "order.update", "product.view", "material.view", "workorder.view"],
        )
        .role(roles::PRODUCTION_MANAGER, production)
        .role(roles::WAREHOUSE, warehouse)
        .role(roles::TECHNICIAN, ["workorder.view", "workorder.update", "material.view"])
        .role(
            roles::STOREFRONT,
            ["product.view", "order.view", "order.create", "customer.view", "customer.create", "payment.create"],
        )
        .build()
}

#[derive(Debug, Default, Serialize)]
pub struct BootstrapSummary {
    pub permissions_created: usize,
    pub roles_created: usize,
    pub roles_skipped: Vec<i64>,
}

/// Provision the built-in catalog and roles. Safe to run repeatedly.
pub async fn bootstrap(store: &dyn GrantStore) -> AppResult<BootstrapSummary> {
    let mut summary = BootstrapSummary::default();

    for permission in default_catalog()? {
        if store.find_permission(permission.code.as_str()).await?.is_none() {
            summary.permissions_created += 1;
        }
        store.insert_permission(permission).await?;
    }

    for role in default_roles() {
        match store.find_role(role.id).await? {
            Some(existing) if existing.name != role.name => {
                tracing::warn!(role_id = role.id, existing = %existing.name, wanted = %role.name, "role id already taken");
                summary.roles_skipped.push(role.id);
            }
            Some(_) => {}
            None => {
                store.insert_role(role).await?;
                summary.roles_created += 1;
            }
        }
    }

    tracing::info!(
        permissions_created = summary.permissions_created,
        roles_created = summary.roles_created,
        "bootstrap complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGrantStore;

    #[test]
    fn default_policy_only_references_catalog_codes() {
        let catalog: Vec<String> = default_catalog().unwrap().into_iter().map(|p| p.code.into()).collect();
        let policy = default_policy().unwrap();
        for code in policy.declared_codes() {
            assert!(catalog.iter().any(|c| c == code), "{code} missing from catalog");
        }
        assert_eq!(policy.superuser_role_id(), Some(roles::OWNER));
    }

    #[test]
    fn every_default_role_is_declared() {
        let policy = default_policy().unwrap();
        for role in default_roles() {
            assert!(policy.get(role.id).is_some(), "role {} undeclared", role.id);
        }
    }

    #[tokio::test]
    async fn bootstrap_is_repeatable() {
        let store = MemoryGrantStore::new();
        let first = bootstrap(&store).await.unwrap();
        assert_eq!(first.roles_created, default_roles().len());
        assert_eq!(first.permissions_created, default_catalog().unwrap().len());

        let second = bootstrap(&store).await.unwrap();
        assert_eq!(second.roles_created, 0);
        assert_eq!(second.permissions_created, 0);
    }
}
