//! Response envelope and error-to-status mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use peerlab_core::{ErrorKind, LabError};
use serde::Serialize;
use tracing::{error, warn};

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

/// A [`LabError`] on its way to the client.
#[derive(Debug)]
pub struct ApiError(pub LabError);

impl From<LabError> for ApiError {
    fn from(err: LabError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        ErrorKind::Unavailable | ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        let message = match kind {
            ErrorKind::Internal => {
                error!(error = %self.0, "request failed");
                "internal error".to_string()
            }
            ErrorKind::Unavailable | ErrorKind::Cancelled => {
                warn!(error = %self.0, "request failed");
                self.0.to_string()
            }
            _ => self.0.to_string(),
        };
        (
            status,
            Json(ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(message),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn internal_details_are_hidden() {
        let resp = ApiError(LabError::Internal("redb: page 42 corrupt".into()).context("list clusters"))
            .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "internal error");
    }

    #[tokio::test]
    async fn client_errors_keep_their_message() {
        let resp = ApiError(LabError::NotFound("cluster c9".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(resp).await["error"], "not found: cluster c9");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_for(ErrorKind::AlreadyExists), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::FailedPrecondition), StatusCode::PRECONDITION_FAILED);
        assert_eq!(status_for(ErrorKind::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::Cancelled), StatusCode::SERVICE_UNAVAILABLE);
    }
}
