//! HTTP rendering of engine outcomes.
//!
//! Bodies carry only the generic category and public message. The specific
//! cause stays in the server log.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::AuthError;

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let category = self.category();

        if status.is_server_error() {
            tracing::error!(category = %category, error = %self, "authentication request failed");
        } else if self.is_security_event() {
            tracing::warn!(category = %category, error = %self, "authentication request rejected");
        } else {
            tracing::debug!(category = %category, error = %self, "authentication request rejected");
        }

        let body = json!({
            "error": category.as_str(),
            "message": self.public_message(),
        });

        let mut headers = HeaderMap::new();
        match &self {
            AuthError::Locked { remaining } => {
                // Round up so clients never retry a second early.
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                headers.insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
            }
            _ if status == StatusCode::UNAUTHORIZED => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer realm=\"gatehouse\""),
                );
            }
            _ => {}
        }

        (status, headers, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_unauthorized_response() {
        let response =
            AuthError::invalid_credentials("issuer mismatch: https://evil").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let body = body_json(response).await;
        assert_eq!(body["error"], "invalid_credentials");
        assert_eq!(body["message"], "invalid credentials");
        assert!(!body.to_string().contains("evil"));
    }

    #[tokio::test]
    async fn test_locked_response_has_retry_after() {
        let response = AuthError::locked(Duration::from_millis(90_500)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "91");
        assert!(!response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn test_forbidden_and_unavailable() {
        let response = AuthError::forbidden("csrf token mismatch").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["error"], "forbidden");

        let response = AuthError::unavailable("no provider").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_internal_error_is_opaque() {
        let response = AuthError::storage("connection refused to 10.0.0.5").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], "internal error");
        assert!(!body.to_string().contains("10.0.0.5"));
    }
}
