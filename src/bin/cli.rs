use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::SqlitePool;

use printshop_authz::authz::{authorize_request, derive, GrantGate};
use printshop_authz::config::AppConfig;
use printshop_authz::policy::defaults::bootstrap;
use printshop_authz::reconcile::{lint, Reconciler};
use printshop_authz::store::{GrantStore, SqliteGrantStore};
use printshop_authz::{db, load_env, load_policy};

#[derive(Parser, Debug)]
#[command(author, version, about = "print shop authorization admin tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations
    MigrateRun,
    /// Show migration status against the current database
    MigrateStatus,
    /// Provision the built-in permission catalog and roles
    Bootstrap,
    /// Converge stored grants to a policy and print the report
    Reconcile {
        /// Policy file; defaults to POLICY_PATH, then the built-in policy
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Print the diff without writing it
        #[arg(long)]
        dry_run: bool,
        /// Runs allowed for roles that hit a conflict
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// List catalog permissions the superuser role does not hold
    VerifySuperuser,
    /// Report catalog and policy hygiene findings
    Lint {
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Print the permission code derived for a request
    Derive { method: String, path: String },
    /// Decide a request for a role against the stored grants
    Check { role_id: i64, method: String, path: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::MigrateRun => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            migrator.run(&pool).await?;
            println!("Migrations applied");
        }
        Commands::MigrateStatus => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            print_status(&pool, &migrator).await?;
        }
        Commands::Bootstrap => {
            let store = get_store().await?;
            let summary = bootstrap(store.as_ref()).await?;
            print_json(&summary)?;
        }
        Commands::Reconcile { policy, dry_run, max_attempts } => {
            let config = AppConfig::from_env()?;
            let policy = load_policy(policy.as_deref().or(config.policy_path.as_deref()))?;
            let reconciler = Reconciler::new(get_store().await?);
            let max_attempts = max_attempts.unwrap_or(config.reconcile_max_attempts);

            let run = async {
                if dry_run {
                    reconciler.plan(&policy).await
                } else {
                    reconciler.reconcile_with_retry(&policy, max_attempts).await
                }
            };

            // Dropping the run between roles is safe: each role is applied atomically.
            let report = tokio::select! {
                report = run => report?,
                _ = tokio::signal::ctrl_c() => {
                    anyhow::bail!("interrupted; roles finished before the interrupt stay converged");
                }
            };

            print_json(&report)?;
            let totals = report.totals();
            if totals.failed > 0 || totals.conflicted > 0 {
                anyhow::bail!("{} role(s) failed, {} role(s) still conflicted", totals.failed, totals.conflicted);
            }
        }
        Commands::VerifySuperuser => {
            let audit = Reconciler::new(get_store().await?).verify_superuser().await?;
            print_json(&audit)?;
            if !audit.complete {
                anyhow::bail!("superuser role is missing {} permission(s)", audit.missing.len());
            }
        }
        Commands::Lint { policy } => {
            let policy = match policy {
                Some(path) => Some(load_policy(Some(path.as_path()))?),
                None => None,
            };
            let store = get_store().await?;
            let report = lint(store.as_ref(), policy.as_ref()).await?;
            print_json(&report)?;
        }
        Commands::Derive { method, path } => {
            let code = derive(&method, &path);
            if code.is_empty() {
                anyhow::bail!("no permission derivable for {method} {path}");
            }
            println!("{code}");
        }
        Commands::Check { role_id, method, path } => {
            let gate = GrantGate::new(get_store().await?);
            let (permission, decision) = authorize_request(&gate, role_id, &method, &path).await;
            print_json(&serde_json::json!({
                "role_id": role_id,
                "permission": permission,
                "decision": decision,
            }))?;
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout stays machine readable.
fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn get_pool() -> anyhow::Result<SqlitePool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    db::connect(&database_url).await
}

/// Store over a migrated database.
async fn get_store() -> anyhow::Result<Arc<dyn GrantStore>> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let pool = db::init(&database_url).await?;
    Ok(Arc::new(SqliteGrantStore::new(pool)))
}

async fn print_status(pool: &SqlitePool, migrator: &sqlx::migrate::Migrator) -> anyhow::Result<()> {
    // If the migrations table doesn't exist, nothing is applied yet
    let table: Option<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' AND name='_sqlx_migrations'")
            .fetch_optional(pool)
            .await?;
    let applied_versions: HashSet<i64> = if table.is_some() {
        sqlx::query_scalar::<_, i64>("SELECT version FROM _sqlx_migrations WHERE success = 1")
            .fetch_all(pool)
            .await?
            .into_iter()
            .collect()
    } else {
        HashSet::new()
    };

    println!("{:<8} {:<20} {}", "Status", "Version", "Name");
    for migration in migrator.iter() {
        let status = if applied_versions.contains(&migration.version) { "applied" } else { "pending" };
        let desc = migration.description.trim();
        let name = if desc.is_empty() { "unknown" } else { desc };
        println!("{:<8} {:<20} {}", status, migration.version, name);
    }

    Ok(())
}

async fn get_migrator() -> anyhow::Result<sqlx::migrate::Migrator> {
    // ./migrations when run from the repo root, else the crate's own.
    let local = Path::new("./migrations");
    let migrator_path = if local.exists() {
        local.to_path_buf()
    } else {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")
    };

    let display = migrator_path.display().to_string();
    sqlx::migrate::Migrator::new(migrator_path)
        .await
        .with_context(|| format!("failed to load migrations from {display}"))
}
