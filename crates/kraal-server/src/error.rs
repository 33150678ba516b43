//! API error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error type with OpenAI-style error bodies.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    /// Set for the mid-repair response, which has its own body shape.
    pub repairing_model: Option<String>,
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
            repairing_model: None,
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code,
            message: message.into(),
            repairing_model: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "server_error",
            message: message.into(),
            repairing_model: None,
        }
    }

    /// `202 Accepted`: the model is being repaired, retry later.
    pub fn repairing(model: impl Into<String>) -> Self {
        Self {
            status: StatusCode::ACCEPTED,
            code: "repairing",
            message: "Model is being repaired, please retry later".into(),
            repairing_model: Some(model.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(model) = self.repairing_model {
            let body = Json(json!({
                "status": "repairing",
                "message": self.message,
                "model": model,
            }));
            return (StatusCode::ACCEPTED, body).into_response();
        }

        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": match self.status {
                    StatusCode::BAD_REQUEST => "invalid_request_error",
                    StatusCode::NOT_FOUND => "not_found_error",
                    _ => "server_error",
                },
                "code": self.code,
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<kraal_core::Error> for ApiError {
    fn from(err: kraal_core::Error) -> Self {
        match err {
            kraal_core::Error::Repairing { model } => ApiError::repairing(model),
            kraal_core::Error::ModelNotFound(_) => {
                ApiError::not_found("model_not_found", err.to_string())
            }
            kraal_core::Error::InvalidFormat(_) | kraal_core::Error::Corrupted(_) => {
                ApiError::bad_request("model_corrupt", err.to_string())
            }
            _ => ApiError::internal(err.to_string()),
        }
    }
}
