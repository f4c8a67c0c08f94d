//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors produced by the fan-out pipeline and mapped onto HTTP responses.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Authorization header not present on a protected route
    #[error("Authorization header not found")]
    AuthMissing,

    /// Authorization token present but unusable (scheme, base64, JSON,
    /// kind, pubkey format, signature, tag mismatch)
    #[error("Invalid authorization event: {0}")]
    AuthMalformed(String),

    /// Authorization event expiration tag lies in the past
    #[error("Authorization event expired at {expired_at}")]
    AuthExpired { expired_at: u64 },

    /// Valid event, but the pubkey is not in the allow-list
    #[error("Pubkey not in allowed list")]
    AuthForbidden,

    /// Malformed client request (bad digest, missing pubkey, unreadable body)
    #[error("{0}")]
    BadRequest(String),

    /// No peer holds the blob, after discovery
    #[error("Blob not found on any upstream server")]
    NotFound,

    /// Fewer than the required number of peers succeeded
    #[error("only {succeeded} servers succeeded, need at least {required}")]
    QuorumFailed {
        succeeded: usize,
        required: usize,
        /// Minimum upstream status observed across failing peers,
        /// 500 when no peer produced a status code
        status: StatusCode,
        /// First X-Reason provided by a rejecting peer, if any
        reason: Option<String>,
    },

    /// No configured peer advertises the capability the operation needs
    #[error("no upstream servers support the {endpoint} endpoint")]
    CapabilityMissing { endpoint: &'static str },

    /// A single peer answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Upstream { status: StatusCode, message: String },

    /// Anything unexpected
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status this error maps to at the client-facing surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing
            | GatewayError::AuthMalformed(_)
            | GatewayError::AuthExpired { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::AuthForbidden => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::QuorumFailed { status, .. } => *status,
            GatewayError::CapabilityMissing { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Upstream { status, .. } => *status,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Upstream status carried by this error, when one exists.
    /// Transport-level failures carry none.
    pub fn upstream_status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        if let GatewayError::QuorumFailed {
            reason: Some(reason),
            ..
        } = &self
        {
            return (status, [("X-Reason", reason.clone())], message).into_response();
        }
        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::AuthMissing.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::AuthMalformed("bad base64".to_string()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::AuthExpired { expired_at: 1 }.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::AuthForbidden.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::BadRequest("bad digest".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::CapabilityMissing { endpoint: "mirror" }.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Internal("boom".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let quorum = GatewayError::QuorumFailed {
            succeeded: 1,
            required: 2,
            status: StatusCode::PAYLOAD_TOO_LARGE,
            reason: None,
        };
        assert_eq!(quorum.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_upstream_status_only_for_upstream_errors() {
        let upstream = GatewayError::Upstream {
            status: StatusCode::BAD_GATEWAY,
            message: "boom".to_string(),
        };
        assert_eq!(upstream.upstream_status(), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(
            GatewayError::Internal("transport".to_string()).upstream_status(),
            None
        );
        assert_eq!(GatewayError::NotFound.upstream_status(), None);
    }

    #[test]
    fn test_quorum_failure_surfaces_reason_header() {
        let error = GatewayError::QuorumFailed {
            succeeded: 0,
            required: 2,
            status: StatusCode::PAYLOAD_TOO_LARGE,
            reason: Some("blob too large".to_string()),
        };
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            response
                .headers()
                .get("X-Reason")
                .and_then(|v| v.to_str().ok()),
            Some("blob too large")
        );
    }

    #[test]
    fn test_quorum_failure_without_reason_has_no_header() {
        let error = GatewayError::QuorumFailed {
            succeeded: 1,
            required: 2,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            reason: None,
        };
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get("X-Reason").is_none());
    }
}
