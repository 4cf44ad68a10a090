//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::jwt::JwtManager;

/// Authenticated user information extracted from the session token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

#[derive(Debug)]
pub enum AuthError {
    MissingAuth,
    InvalidToken,
    InsufficientPermissions,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AuthError::MissingAuth => (
                StatusCode::UNAUTHORIZED,
                "authentication_required",
                "Authentication required",
            ),
            AuthError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "authentication_required",
                "Invalid or expired token",
            ),
            AuthError::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "forbidden", "Forbidden")
            }
        };

        let body = Json(json!({
            "success": false,
            "error": { "code": code, "message": message }
        }));

        (status, body).into_response()
    }
}

fn extract_bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(String::from)
}

fn authenticate(auth_state: &AuthState, request: &Request) -> Result<AuthUser, AuthError> {
    let token = extract_bearer_token(request).ok_or(AuthError::MissingAuth)?;
    let claims = auth_state
        .jwt_manager
        .validate_token(&token)
        .map_err(|_| AuthError::InvalidToken)?;

    Ok(AuthUser {
        user_id: claims.sub,
        role: claims.role,
    })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&auth_state, &request) {
        Ok(auth_user) => {
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %request.uri().path(), error = ?err, "Authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that requires the admin platform role
pub async fn require_admin(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&auth_state, &request) {
        Ok(auth_user) if auth_user.is_admin() => {
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Ok(auth_user) => {
            tracing::warn!(
                path = %request.uri().path(),
                user_id = %auth_user.user_id,
                role = %auth_user.role,
                "Admin route denied for non-admin user"
            );
            AuthError::InsufficientPermissions.into_response()
        }
        Err(err) => err.into_response(),
    }
}
