//! Authentication module for Roost

pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{require_admin, require_auth, AuthState, AuthUser};
