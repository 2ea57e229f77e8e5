use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::attempt::IdentityProvenance;
use crate::services::AppState;

/// Claims of the teacher-dashboard JWT (minted by the account service,
/// validated here).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JwtClaims {
    pub sub: String,  // teacher user id
    pub role: String, // teacher / admin
    pub exp: usize,   // expiration timestamp
    pub iat: usize,   // issued at timestamp
}

/// Claims of the short-lived play-session JWT minted by the session
/// authenticator. `provenance` records how the identity was established
/// and is stamped onto every attempt recorded under this session.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlaySessionClaims {
    pub sub: String, // student email
    pub name: String,
    pub assignment_id: String,
    pub provenance: String,
    pub exp: usize,
    pub iat: usize,
}

impl PlaySessionClaims {
    pub fn provenance(&self) -> IdentityProvenance {
        IdentityProvenance::parse(&self.provenance).unwrap_or(IdentityProvenance::Asserted)
    }
}

#[derive(Debug)]
pub enum AuthError {
    InvalidToken,
    ExpiredToken,
    MissingToken,
    InvalidSignature,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidToken => write!(f, "Invalid token"),
            AuthError::ExpiredToken => write!(f, "Token expired"),
            AuthError::MissingToken => write!(f, "Missing authorization token"),
            AuthError::InvalidSignature => write!(f, "Invalid token signature"),
        }
    }
}

impl std::error::Error for AuthError {}

pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn generate_token(&self, claims: JwtClaims) -> Result<String, AuthError> {
        encode(&Header::default(), &claims, &self.encoding_key).map_err(|_| AuthError::InvalidToken)
    }

    pub fn validate_token(&self, token: &str) -> Result<JwtClaims, AuthError> {
        let validation = Validation::default();

        decode::<JwtClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    pub fn generate_play_token(&self, claims: PlaySessionClaims) -> Result<String, AuthError> {
        encode(&Header::default(), &claims, &self.encoding_key).map_err(|_| AuthError::InvalidToken)
    }

    pub fn validate_play_token(&self, token: &str) -> Result<PlaySessionClaims, AuthError> {
        let validation = Validation::default();

        decode::<PlaySessionClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> AuthError {
    if e.to_string().contains("ExpiredSignature") {
        AuthError::ExpiredToken
    } else if e.to_string().contains("InvalidSignature") {
        AuthError::InvalidSignature
    } else {
        AuthError::InvalidToken
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Middleware для проверки teacher JWT токена
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(&headers).ok_or(StatusCode::UNAUTHORIZED)?;

    let jwt_service = JwtService::new(&state.config.jwt_secret);
    let claims = jwt_service.validate_token(token).map_err(|e| {
        tracing::warn!("JWT validation failed: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    tracing::debug!("Authenticated user: {} (role: {})", claims.sub, claims.role);

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}

/// Guard for the assignment surface: teachers (and admins) only.
pub async fn teacher_guard_middleware(
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let claims = request.extensions().get::<JwtClaims>();
    if let Some(claims) = claims {
        if claims.role == "teacher" || claims.role == "admin" {
            return Ok(next.run(request).await);
        }
    }
    tracing::warn!("Access denied: teacher role required");
    Err(StatusCode::FORBIDDEN)
}

/// Middleware for the play surface: validates the play-session JWT minted
/// by the session authenticator and exposes its claims to handlers.
pub async fn play_session_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(&headers).ok_or(StatusCode::UNAUTHORIZED)?;

    let jwt_service = JwtService::new(&state.config.jwt_secret);
    let claims = jwt_service.validate_play_token(token).map_err(|e| {
        tracing::warn!("Play session validation failed: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    tracing::debug!(
        "Play session: {} on assignment {} ({})",
        claims.sub,
        claims.assignment_id,
        claims.provenance
    );

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
