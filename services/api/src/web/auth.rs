//! services/api/src/web/auth.rs
//!
//! Authentication endpoints for client signup, login, and logout.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use booking_core::domain::{NewClient, Role, User};
use chrono::{Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::BookingError;
use crate::web::{identity::resolve_client, middleware::session_cookie, state::AppState};

const SESSION_DAYS: i64 = 30;

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid pattern"));

//=========================================================================================
// Request/Response Types
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
}

fn session_cookie_header(auth_session_id: &str, max_age: i64) -> String {
    format!(
        "session={}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age={}",
        auth_session_id, max_age
    )
}

/// Stores a fresh 30-day auth session and returns its `Set-Cookie` value.
async fn start_auth_session(state: &AppState, user_id: Uuid) -> Result<String, BookingError> {
    let auth_session_id = Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::days(SESSION_DAYS);
    state
        .db
        .create_auth_session(&auth_session_id, user_id, expires_at)
        .await
        .map_err(|e| {
            error!("Failed to create auth session: {:?}", e);
            BookingError::Internal("Failed to create session".to_string())
        })?;
    Ok(session_cookie_header(
        &auth_session_id,
        Duration::days(SESSION_DAYS).num_seconds(),
    ))
}

fn validate_signup(req: &SignupRequest) -> Result<(), BookingError> {
    if !EMAIL.is_match(req.email.trim()) {
        return Err(BookingError::Validation("Please enter a valid email address".to_string()));
    }
    if req.password.chars().count() < 8 {
        return Err(BookingError::Validation(
            "Password must be at least 8 characters".to_string(),
        ));
    }
    if req.name.trim().is_empty() {
        return Err(BookingError::Validation("Name is required".to_string()));
    }
    Ok(())
}

//=========================================================================================
// Handlers
//=========================================================================================

/// POST /auth/signup - Create a client account
#[utoipa::path(
    post,
    path = "/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 201, description = "User created successfully", body = AuthResponse),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Email already registered"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn signup_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, BookingError> {
    validate_signup(&req)?;
    let email = req.email.trim().to_lowercase();

    // 1. Hash the password
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| {
            error!("Failed to hash password: {:?}", e);
            BookingError::Internal("Failed to hash password".to_string())
        })?
        .to_string();

    // 2. Create the user
    let user = state
        .db
        .create_user_with_email(&email, &password_hash, Role::Client)
        .await?;

    // 3. Attach a client profile, reusing one booked under the same email or phone
    let client = match resolve_client(state.db.as_ref(), &user, req.phone.as_deref()).await? {
        Some(existing) if existing.user_id.is_none() => {
            state.db.link_client_user(existing.id, user.user_id).await?
        }
        Some(existing) if existing.user_id == Some(user.user_id) => existing,
        _ => {
            state
                .db
                .create_client(NewClient {
                    user_id: Some(user.user_id),
                    name: req.name.trim().to_string(),
                    email: Some(email.clone()),
                    phone: req.phone.clone().filter(|p| !p.trim().is_empty()),
                })
                .await?
        }
    };
    info!(user_id = %user.user_id, client_id = %client.id, "Client account created");

    // 4. Log the new user in
    let cookie = start_auth_session(&state, user.user_id).await?;
    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, cookie)],
        Json(auth_response(&user)),
    ))
}

fn auth_response(user: &User) -> AuthResponse {
    AuthResponse {
        user_id: user.user_id,
        email: user.email.clone(),
        role: user.role.as_str().to_string(),
    }
}

/// POST /auth/login - Login with existing account
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, BookingError> {
    // 1. Get user by email
    let creds = state
        .db
        .get_user_by_email(req.email.trim())
        .await
        .map_err(|_| BookingError::Unauthenticated)?;

    // 2. Verify password
    let parsed_hash = PasswordHash::new(&creds.hashed_password).map_err(|e| {
        error!("Failed to parse password hash: {:?}", e);
        BookingError::Internal("Authentication error".to_string())
    })?;
    if Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .is_err()
    {
        return Err(BookingError::Unauthenticated);
    }

    // 3. Start the auth session
    let cookie = start_auth_session(&state, creds.user_id).await?;
    let user = User {
        user_id: creds.user_id,
        email: creds.email,
        role: creds.role,
    };
    Ok((StatusCode::OK, [(header::SET_COOKIE, cookie)], Json(auth_response(&user))))
}

/// POST /auth/logout - Logout and invalidate session
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logout successful"),
        (status = 401, description = "No active session")
    )
)]
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, BookingError> {
    let auth_session_id = session_cookie(&headers).ok_or(BookingError::Unauthenticated)?;
    state.db.delete_auth_session(auth_session_id).await?;
    Ok((StatusCode::OK, [(header::SET_COOKIE, session_cookie_header("", 0))]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signup(email: &str, password: &str, name: &str) -> SignupRequest {
        SignupRequest {
            email: email.to_string(),
            password: password.to_string(),
            name: name.to_string(),
            phone: None,
        }
    }

    #[test]
    fn signup_requires_a_plausible_email_and_password() {
        assert!(validate_signup(&signup("asha@example.com", "long enough", "Asha")).is_ok());
        assert!(validate_signup(&signup("asha.example.com", "long enough", "Asha")).is_err());
        assert!(validate_signup(&signup("asha@example.com", "short", "Asha")).is_err());
        assert!(validate_signup(&signup("asha@example.com", "long enough", "  ")).is_err());
    }

    #[test]
    fn logout_cookie_expires_immediately() {
        assert!(session_cookie_header("", 0).contains("Max-Age=0"));
    }
}
