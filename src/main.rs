use std::net::SocketAddr;

use anyhow::Context;
use printshop_authz::config::AppConfig;
use printshop_authz::policy::defaults::bootstrap;
use printshop_authz::{create_app, db, docs, events, init_tracing, load_env, load_policy, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let config = AppConfig::from_env()?;
    let pool = db::init(&config.database_url).await?;
    let policy = load_policy(config.policy_path.as_deref())?;

    let (event_bus, event_rx) = events::init_event_bus();
    tokio::spawn(events::start_audit_listener(event_rx, pool.clone()));

    let state = AppState::new(pool, policy, event_bus).with_max_attempts(config.reconcile_max_attempts);

    if config.reconcile_on_start {
        let summary = bootstrap(state.store.as_ref()).await.context("bootstrap failed")?;
        if !summary.roles_skipped.is_empty() {
            tracing::warn!(roles = ?summary.roles_skipped, "built-in roles skipped; ids taken by other roles");
        }

        let report = state
            .reconciler
            .reconcile_with_retry(&state.policy, config.reconcile_max_attempts)
            .await
            .context("start-up reconciliation failed")?;
        let totals = report.totals();
        tracing::info!(
            added = totals.added,
            removed = totals.removed,
            skipped_missing = totals.skipped_missing,
            failed = totals.failed,
            conflicted = totals.conflicted,
            "start-up reconciliation finished"
        );
    }

    let app = create_app(state).merge(docs::swagger_routes(docs::build_openapi(config.port)));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
