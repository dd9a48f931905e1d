use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use super::{authorize_request, Principal};
use crate::app::AppState;
use crate::errors::AppError;

/// Code the gate checked for the current request, for handlers that log it.
#[derive(Debug, Clone)]
pub struct RequiredPermission(pub String);

/// Gate every request of the wrapped router on the permission derived from its
/// method and path. Mount it on a nested router so the path it sees starts at
/// the resource segment.
pub async fn require_permission(
    State(state): State<AppState>,
    principal: Principal,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let method = request.method().as_str().to_owned();
    let path = request.uri().path().to_owned();

    let (code, decision) = authorize_request(state.gate.as_ref(), principal.role_id, &method, &path).await;

    if !decision.is_allowed() {
        tracing::info!(
            role_id = principal.role_id,
            method = %method,
            path = %path,
            permission = %code,
            decision = ?decision,
            "request denied"
        );
        return Err(AppError::forbidden("insufficient permissions"));
    }

    request.extensions_mut().insert(principal);
    request.extensions_mut().insert(RequiredPermission(code));
    Ok(next.run(request).await)
}
