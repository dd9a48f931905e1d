use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::AppError;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    /// JSON policy file; the built-in print shop policy when unset.
    pub policy_path: Option<PathBuf>,
    pub reconcile_on_start: bool,
    pub reconcile_max_attempts: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| AppError::configuration("DATABASE_URL not set"))?;

        Ok(Self {
            database_url,
            port: parse_var("APP_PORT", 8000)?,
            policy_path: std::env::var("POLICY_PATH").ok().filter(|p| !p.is_empty()).map(PathBuf::from),
            reconcile_on_start: parse_var("RECONCILE_ON_START", false)?,
            reconcile_max_attempts: parse_var("RECONCILE_MAX_ATTEMPTS", 3)?,
        })
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::configuration(format!("{name} has an invalid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}
