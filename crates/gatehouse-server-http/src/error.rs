use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gatehouse_control::ForwardError;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel not found")]
    TunnelNotFound,

    #[error("Not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Request body too large")]
    PayloadTooLarge,

    #[error("Forbidden")]
    Forbidden,

    #[error("Authorization is temporarily unavailable")]
    AuthUnavailable,

    #[error("Login provider is not configured")]
    OidcNotConfigured,

    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::TunnelNotFound | GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::AuthUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::OidcNotConfigured => StatusCode::NOT_IMPLEMENTED,
            GatewayError::Forward(e) => {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Body sent to the public client. Tunnel failures carry no detail.
    fn public_message(&self) -> String {
        match self {
            GatewayError::Io(_) => "Internal server error".to_string(),
            GatewayError::Forward(ForwardError::Timeout | ForwardError::SendTimeout) => {
                "Gateway Timeout".to_string()
            }
            GatewayError::Forward(_) => "Bad Gateway".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        debug!(status = status.as_u16(), error = %self, "Gateway error response");
        (status, self.public_message()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_errors_hide_detail() {
        let err = GatewayError::Forward(ForwardError::Malformed("bad json at 1:1".into()));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.public_message(), "Bad Gateway");

        let err = GatewayError::Forward(ForwardError::Timeout);
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.public_message(), "Gateway Timeout");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::TunnelNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(GatewayError::OidcNotConfigured.status_code(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(GatewayError::PayloadTooLarge.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
