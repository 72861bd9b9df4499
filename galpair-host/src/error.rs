use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use galpair_core::PairingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    /// The dispatcher task is gone, usually because the runtime is shutting down.
    #[error("pairing dispatcher is not running")]
    DispatcherClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HostResult<T> = Result<T, HostError>;

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        let status = match &self {
            HostError::Pairing(PairingError::InvalidDevice) => StatusCode::BAD_REQUEST,
            HostError::Pairing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HostError::DispatcherClosed => StatusCode::SERVICE_UNAVAILABLE,
            HostError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}
