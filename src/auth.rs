//! HTTP Basic Authentication for the operator controls

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;

use crate::config::env_string;

/// Operator credentials
#[derive(Debug, Clone, Default)]
pub struct OperatorAuth {
    /// Username for the control routes (None = auth disabled)
    pub username: Option<String>,
    pub password: Option<String>,
}

impl OperatorAuth {
    /// OPERATOR_USERNAME and OPERATOR_PASSWORD must both be set to enable auth
    pub fn from_env() -> Self {
        let username = env_string("OPERATOR_USERNAME");
        let password = env_string("OPERATOR_PASSWORD");

        if username.is_some() && password.is_some() {
            tracing::info!("Operator authentication enabled");
            Self { username, password }
        } else {
            if username.is_some() || password.is_some() {
                tracing::warn!(
                    "OPERATOR_USERNAME and OPERATOR_PASSWORD must both be set to enable authentication"
                );
            }
            tracing::warn!("Operator authentication DISABLED - anyone can control the session!");
            Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn validate(&self, username: &str, password: &str) -> bool {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => {
                constant_time_eq(u.as_bytes(), username.as_bytes())
                    & constant_time_eq(p.as_bytes(), password.as_bytes())
            }
            _ => true,
        }
    }

    /// Check a request's `Authorization: Basic ...` header
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        if !self.is_enabled() {
            return true;
        }
        match basic_credentials(headers) {
            Some((username, password)) => self.validate(&username, &password),
            None => false,
        }
    }
}

/// Constant-time byte comparison
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Decode the username and password of a Basic Authorization header
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Middleware for HTTP Basic Authentication on the control routes
pub async fn operator_auth_middleware(
    State(auth): State<Arc<OperatorAuth>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if auth.authorize(request.headers()) {
        return next.run(request).await;
    }

    tracing::warn!("Rejected unauthenticated request to {}", request.uri().path());
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"zapcast\"")],
        "Unauthorized",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn enabled() -> OperatorAuth {
        OperatorAuth {
            username: Some("admin".to_string()),
            password: Some("secret".to_string()),
        }
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_auth_disabled_when_incomplete() {
        let auth = OperatorAuth::default();
        assert!(!auth.is_enabled());
        assert!(auth.validate("any", "thing"));
        assert!(auth.authorize(&HeaderMap::new()));

        let auth = OperatorAuth {
            username: Some("user".to_string()),
            password: None,
        };
        assert!(!auth.is_enabled());
    }

    #[test]
    fn test_auth_enabled() {
        let auth = enabled();
        assert!(auth.validate("admin", "secret"));
        assert!(!auth.validate("admin", "wrong"));
        assert!(!auth.validate("wrong", "secret"));
        assert!(!auth.validate("", ""));
    }

    #[test]
    fn test_authorize_basic_header() {
        let auth = enabled();
        // "admin:secret"
        assert!(auth.authorize(&headers_with("Basic YWRtaW46c2VjcmV0")));
        // "user:pass"
        assert!(!auth.authorize(&headers_with("Basic dXNlcjpwYXNz")));
        assert!(!auth.authorize(&headers_with("Bearer YWRtaW46c2VjcmV0")));
        assert!(!auth.authorize(&headers_with("Basic !!!")));
        assert!(!auth.authorize(&HeaderMap::new()));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
        assert!(constant_time_eq(b"", b""));
    }
}
