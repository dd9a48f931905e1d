pub mod app;
pub mod authz;
pub mod config;
pub mod db;
pub mod docs;
pub mod errors;
pub mod events;
pub mod models;
pub mod policy;
pub mod reconcile;
pub mod routes;
pub mod store;

// Re-export commonly used items for tests
pub use app::{create_app, AppState};
pub use errors::{AppError, AppResult};

/// Load `.env` from the working directory, falling back to the crate's own.
pub fn load_env() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    let _ = dotenvy::from_path(crate_env);
}

pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

/// Policy from `POLICY_PATH`, or the built-in print shop policy.
pub fn load_policy(path: Option<&std::path::Path>) -> anyhow::Result<policy::PolicyDeclaration> {
    match path {
        Some(path) => policy::PolicyDeclaration::load(path),
        None => Ok(policy::defaults::default_policy()?),
    }
}
