use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::errors::AppError;

/// Header carrying the authenticated role id. Set by the upstream
/// authentication layer; this crate never sees tokens.
pub const ROLE_HEADER: &str = "x-role-id";

/// An already-authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub role_id: i64,
}

impl Principal {
    pub fn new(role_id: i64) -> Self {
        Self { role_id }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(principal) = parts.extensions.get::<Principal>() {
            return Ok(*principal);
        }

        let role_id = parts
            .headers
            .get(ROLE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("principal missing"))?
            .trim()
            .parse::<i64>()
            .map_err(|_| AppError::unauthorized("principal role id must be an integer"))?;

        Ok(Principal { role_id })
    }
}
