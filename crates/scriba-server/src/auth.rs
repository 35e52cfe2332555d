// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signup, token issuance, and the bearer-auth extractor.
//!
//! Successful auth yields an owner id; everything downstream scopes reads
//! and writes by it. Passwords are hashed with argon2; tokens are HS256
//! JWTs carrying the owner id in `sub`.

use crate::{ApiError, AppState};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::Json;
use axum::extract::{FromRequestParts, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use scriba_error::{ErrorKind, ServiceError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// JWT signing and verification keys derived from `jwt_secret`.
#[derive(Clone)]
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiration_minutes: u64,
}

impl AuthKeys {
    /// Derive keys from the configured secret.
    #[must_use]
    pub fn new(secret: &str, expiration_minutes: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiration_minutes,
        }
    }

    /// Issue a token for `owner`.
    pub fn issue(&self, owner: Uuid) -> Result<String, ApiError> {
        let claims = Claims {
            sub: owner,
            exp: (chrono::Utc::now()
                + chrono::Duration::minutes(self.expiration_minutes as i64))
            .timestamp() as usize,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError(ServiceError::internal("token signing failed").with_source(e)))
    }

    /// Verify a token, returning the owner id.
    pub fn verify(&self, token: &str) -> Result<Uuid, ApiError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|_| ApiError::new(ErrorKind::Auth, "invalid or expired token"))?;
        Ok(data.claims.sub)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    exp: usize,
}

/// The authenticated owner extracted from the `Authorization` header.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub Uuid);

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::new(ErrorKind::Auth, "missing bearer token"))?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or_else(|| ApiError::new(ErrorKind::Auth, "malformed authorization header"))?;
        Ok(CurrentUser(state.auth.verify(token)?))
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Signup payload.
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    /// Email address; unique per account.
    pub email: String,
    /// Plaintext password, hashed before storage.
    pub password: String,
}

/// Signup response.
#[derive(Debug, Serialize)]
pub struct SignupResponse {
    /// New account id.
    pub user_id: Uuid,
    /// Normalized email.
    pub email: String,
}

/// `POST /auth/signup`
pub async fn signup(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignupRequest>,
) -> Result<(StatusCode, Json<SignupResponse>), ApiError> {
    let email = request.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::new(ErrorKind::Validation, "invalid email address"));
    }
    if request.password.len() < 8 {
        return Err(ApiError::new(
            ErrorKind::Validation,
            "password must be at least 8 characters",
        ));
    }

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(request.password.as_bytes(), &salt)
        .map_err(|e| {
            ApiError(ServiceError::internal(format!("password hashing failed: {e}")))
        })?
        .to_string();

    let user = state.catalog.create_user(&email, &hash).await?;
    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            user_id: user.id,
            email: user.email,
        }),
    ))
}

/// Token request payload.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    /// Account email.
    pub email: String,
    /// Plaintext password.
    pub password: String,
}

/// Token response.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    /// The signed JWT.
    pub access_token: String,
    /// Always `bearer`.
    pub token_type: &'static str,
}

/// `POST /auth/token`
pub async fn token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let invalid = || ApiError::new(ErrorKind::Auth, "invalid credentials");

    let user = state
        .catalog
        .fetch_user_by_email(request.email.trim())
        .await?
        .ok_or_else(invalid)?;
    if !user.is_active {
        return Err(invalid());
    }

    let parsed = PasswordHash::new(&user.password_hash).map_err(|_| invalid())?;
    Argon2::default()
        .verify_password(request.password.as_bytes(), &parsed)
        .map_err(|_| invalid())?;

    let access_token = state.auth.issue(user.id)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
    }))
}
