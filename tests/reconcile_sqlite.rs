use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tempfile::{tempdir, TempDir};

use printshop_authz::authz::{authorize_request, AllowReason, Decision, DenyReason, GrantGate};
use printshop_authz::policy::defaults::{bootstrap, default_policy, roles};
use printshop_authz::policy::PolicyDeclaration;
use printshop_authz::reconcile::{Reconciler, RoleOutcome};
use printshop_authz::store::{GrantDiff, GrantStore, SqliteGrantStore};
use printshop_authz::AppError;

async fn setup() -> Result<(TempDir, Arc<SqliteGrantStore>)> {
    let dir = tempdir().context("failed to create tempdir")?;
    let db_path = dir.path().join("test.db");

    use sqlx::sqlite::SqliteConnectOptions;
    let opts = SqliteConnectOptions::new()
        .filename(db_path.as_path())
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(opts).await?;

    let migrator = sqlx::migrate::Migrator::new(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"))
        .await?;
    migrator.run(&pool).await?;

    let store = Arc::new(SqliteGrantStore::new(pool));
    bootstrap(store.as_ref()).await?;
    Ok((dir, store))
}

async fn held(store: &dyn GrantStore, role_id: i64) -> Result<BTreeSet<String>> {
    let ids = store.role_grants(role_id).await?.permission_ids;
    Ok(store
        .list_permissions()
        .await?
        .into_iter()
        .filter(|p| ids.contains(&p.id))
        .map(|p| p.code)
        .collect())
}

fn set(codes: &[&str]) -> BTreeSet<String> {
    codes.iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
async fn technician_converges_and_second_run_is_empty() -> Result<()> {
    let (_dir, store) = setup().await?;
    let view = store.find_permission("workorder.view").await?.context("workorder.view")?;
    let material = store.find_permission("material.view").await?.context("material.view")?;
    store.grant(roles::TECHNICIAN, view.id).await?;
    store.grant(roles::TECHNICIAN, material.id).await?;

    let policy = PolicyDeclaration::builder()
        .superuser(roles::OWNER)
        .role(roles::TECHNICIAN, ["workorder.view", "workorder.create"])
        .build()?;
    let reconciler = Reconciler::new(store.clone());

    let report = reconciler.reconcile(&policy).await?;
    let technician = report.role(roles::TECHNICIAN).context("technician")?;
    assert_eq!(technician.added, vec!["workorder.create".to_string()]);
    assert_eq!(technician.removed, vec!["material.view".to_string()]);
    assert_eq!(held(store.as_ref(), roles::TECHNICIAN).await?, set(&["workorder.create", "workorder.view"]));

    let again = reconciler.reconcile(&policy).await?;
    assert!(again.is_empty_diff());
    assert!(again.is_clean());

    Ok(())
}

#[tokio::test]
async fn stale_revision_writes_nothing() -> Result<()> {
    let (_dir, store) = setup().await?;
    let view = store.find_permission("workorder.view").await?.context("workorder.view")?;

    let snapshot = store.role_grants(roles::TECHNICIAN).await?;
    store.grant(roles::TECHNICIAN, view.id).await?;

    let create = store.find_permission("workorder.create").await?.context("workorder.create")?;
    let diff = GrantDiff {
        expected_revision: snapshot.revision,
        add: BTreeSet::from([create.id]),
        remove: BTreeSet::from([view.id]),
    };
    let err = store.apply_grant_diff(roles::TECHNICIAN, &diff).await.unwrap_err();
    assert!(matches!(err, AppError::ReconcileConflict { role_id } if role_id == roles::TECHNICIAN));
    assert_eq!(held(store.as_ref(), roles::TECHNICIAN).await?, set(&["workorder.view"]));

    let err = store.apply_grant_diff(404, &GrantDiff::default()).await.unwrap_err();
    assert!(matches!(err, AppError::UnknownRole(404)));

    Ok(())
}

#[tokio::test]
async fn independent_reconcilers_converge_to_the_same_state() -> Result<()> {
    let (_dir, store) = setup().await?;
    let policy = Arc::new(default_policy()?);

    // Separate reconcilers share no in-process locks, like two CLI invocations.
    let runs: Vec<_> = (0..3)
        .map(|_| {
            let reconciler = Reconciler::new(store.clone());
            let policy = Arc::clone(&policy);
            tokio::spawn(async move { reconciler.reconcile_with_retry(&policy, 5).await })
        })
        .collect();

    let mut converged_owner = 0;
    for run in runs {
        let report = run.await??;
        let totals = report.totals();
        assert_eq!(totals.failed, 0, "{report:?}");
        assert_eq!(totals.conflicted, 0, "{report:?}");
        if report.role(roles::OWNER).map(|r| &r.outcome) == Some(&RoleOutcome::Converged) {
            converged_owner += 1;
        }
    }
    assert_eq!(converged_owner, 1);

    assert_eq!(
        held(store.as_ref(), roles::TECHNICIAN).await?,
        set(&["material.view", "workorder.update", "workorder.view"])
    );
    assert!(Reconciler::new(store.clone()).verify_superuser().await?.complete);

    Ok(())
}

#[tokio::test]
async fn gate_decides_from_reconciled_grants() -> Result<()> {
    let (_dir, store) = setup().await?;
    Reconciler::new(store.clone()).reconcile(&default_policy()?).await?;
    let gate = GrantGate::new(store.clone());

    let (code, decision) = authorize_request(&gate, roles::TECHNICIAN, "PUT", "/workorders/42").await;
    assert_eq!(code, "workorder.update");
    assert_eq!(decision, Decision::Allow(AllowReason::Grant));

    let (_, decision) = authorize_request(&gate, roles::TECHNICIAN, "DELETE", "/workorders/42").await;
    assert_eq!(decision, Decision::Deny(DenyReason::NoGrant));

    let (_, decision) = authorize_request(&gate, roles::OWNER, "DELETE", "/workorders/42").await;
    assert_eq!(decision, Decision::Allow(AllowReason::Superuser));

    let (code, decision) = authorize_request(&gate, roles::OWNER, "TRACE", "/workorders").await;
    assert_eq!(code, "");
    assert_eq!(decision, Decision::Deny(DenyReason::NoRequirement));

    let (_, decision) = authorize_request(&gate, 404, "GET", "/orders").await;
    assert_eq!(decision, Decision::Deny(DenyReason::UnknownRole));

    Ok(())
}

#[tokio::test]
async fn second_superuser_and_duplicate_roles_are_rejected() -> Result<()> {
    use printshop_authz::models::rbac::NewRole;

    let (_dir, store) = setup().await?;

    let err = store.insert_role(NewRole::new(50, "Co-owner").superuser()).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "{err}");

    let err = store.insert_role(NewRole::new(roles::TECHNICIAN, "Night shift")).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)), "{err}");

    Ok(())
}
