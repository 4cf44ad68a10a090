//! Middleware-level auth tests using a minimal router

use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{body::Body, middleware, Extension, Router};
use tower::ServiceExt;

use super::jwt::JwtManager;
use super::middleware::{require_admin, require_auth, AuthState, AuthUser};

const SECRET: &str = "a-test-secret-at-least-32-characters";

fn auth_state() -> AuthState {
    AuthState {
        jwt_manager: JwtManager::new(SECRET, 24),
    }
}

async fn whoami(Extension(user): Extension<AuthUser>) -> String {
    format!("{}:{}", user.user_id, user.role)
}

fn authed_router() -> Router {
    Router::new()
        .route("/whoami", get(whoami))
        .layer(middleware::from_fn_with_state(auth_state(), require_auth))
}

fn admin_router() -> Router {
    Router::new()
        .route("/admin", get(whoami))
        .layer(middleware::from_fn_with_state(auth_state(), require_admin))
}

fn get_with_token(path: &str, token: Option<&str>) -> Request<Body> {
    let builder = Request::builder().uri(path);
    let builder = match token {
        Some(token) => builder.header("authorization", format!("Bearer {}", token)),
        None => builder,
    };
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_missing_header_is_unauthorized() {
    let response = authed_router()
        .oneshot(get_with_token("/whoami", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_valid_token_passes() {
    let token = JwtManager::new(SECRET, 24)
        .create_token("user_1", "user")
        .unwrap();
    let response = authed_router()
        .oneshot(get_with_token("/whoami", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_expired_token_is_unauthorized() {
    let token = JwtManager::new(SECRET, -1)
        .create_token("user_1", "user")
        .unwrap();
    let response = authed_router()
        .oneshot(get_with_token("/whoami", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_token_signed_with_other_secret_is_unauthorized() {
    let token = JwtManager::new("another-secret-that-is-32-chars-long", 24)
        .create_token("user_1", "user")
        .unwrap();
    let response = authed_router()
        .oneshot(get_with_token("/whoami", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_non_admin_forbidden_on_admin_route() {
    let token = JwtManager::new(SECRET, 24)
        .create_token("user_1", "user")
        .unwrap();
    let response = admin_router()
        .oneshot(get_with_token("/admin", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admin_passes_admin_route() {
    let token = JwtManager::new(SECRET, 24)
        .create_token("admin_1", "admin")
        .unwrap();
    let response = admin_router()
        .oneshot(get_with_token("/admin", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
