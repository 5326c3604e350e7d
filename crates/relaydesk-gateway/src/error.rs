use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relaydesk_common::Error;
use tracing::error;

/// Error type for HTTP handlers. Library errors map onto status codes in
/// one place; `Forbidden` and `BadRequest` cover checks made by the gateway
/// itself.
#[derive(Debug)]
pub enum ApiError {
    Core(Error),
    Forbidden(String),
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Core(e) => match e {
                Error::TenantNotFound(_) | Error::NotFound(_) | Error::Channel(_) => {
                    StatusCode::NOT_FOUND
                }
                Error::VerificationFailed(_) => StatusCode::FORBIDDEN,
                Error::Authentication(_) => StatusCode::UNAUTHORIZED,
                Error::Delivery { .. } | Error::Generation(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Core(e) => e.to_string(),
            Self::Forbidden(m) | Self::BadRequest(m) => m.clone(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Core(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {}", self.message());
        }
        (status, Json(serde_json::json!({ "error": self.message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_library_errors_to_status_codes() {
        let cases = [
            (Error::tenant_not_found(4), StatusCode::NOT_FOUND),
            (Error::NotFound("conversation 9".into()), StatusCode::NOT_FOUND),
            (Error::VerificationFailed("bad signature".into()), StatusCode::FORBIDDEN),
            (Error::Authentication("expired".into()), StatusCode::UNAUTHORIZED),
            (Error::delivery("telegram", "503", true), StatusCode::BAD_GATEWAY),
            (Error::Generation("timeout".into()), StatusCode::BAD_GATEWAY),
            (Error::Database("locked".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::Provisioning("exists".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn gateway_checks_have_their_own_codes() {
        assert_eq!(ApiError::Forbidden("admin only".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::BadRequest("limit".into()).status(), StatusCode::BAD_REQUEST);
    }
}
