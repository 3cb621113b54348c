//! services/api/src/web/middleware.rs
//!
//! Authentication middleware for protecting routes.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::{error, warn};

use crate::booking::AuthContext;
use crate::error::BookingError;
use crate::web::{identity::resolve_client, state::AppState};

/// Reads the auth session id out of the `Cookie` header.
pub fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())?
        .split(';')
        .find_map(|c| c.trim().strip_prefix("session="))
        .filter(|id| !id.is_empty())
}

/// Middleware that validates the auth session cookie and resolves who is calling.
///
/// If valid, inserts an `AuthContext` into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, BookingError> {
    // 1. Parse session ID from cookie
    let auth_session_id = session_cookie(req.headers()).ok_or(BookingError::Unauthenticated)?;

    // 2. Validate auth session in database
    let user = state
        .db
        .validate_auth_session(auth_session_id)
        .await
        .map_err(|e| {
            warn!("Rejected auth session: {:?}", e);
            BookingError::Unauthenticated
        })?;

    // 3. Resolve the client and psychologist profiles behind the account
    let client = resolve_client(state.db.as_ref(), &user, None)
        .await
        .map_err(|e| {
            error!(user_id = %user.user_id, "Failed to resolve client: {:?}", e);
            BookingError::from(e)
        })?;
    let psychologist = state.db.find_psychologist_by_user(user.user_id).await?;

    let context = AuthContext {
        user_id: user.user_id,
        email: user.email,
        role: user.role,
        client_id: client.map(|c| c.id),
        psychologist_id: psychologist.map(|p| p.id),
    };

    // 4. Insert the context into request extensions
    req.extensions_mut().insert(context);

    // 5. Continue to the handler
    Ok(next.run(req).await)
}
