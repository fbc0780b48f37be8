use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use std::fmt;

use crate::core::error::ComplianceError;

#[derive(Debug)]
pub struct ApiError {
    message: String,
    status_code: StatusCode,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(message: impl Into<String>, status_code: StatusCode) -> Self {
        ApiError {
            message: message.into(),
            status_code,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(message, StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(message, StatusCode::BAD_REQUEST)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message, StatusCode::NOT_FOUND)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let mut body = serde_json::json!({
            "error": self.message,
            "status": self.status_code.as_u16()
        });
        if let Some(details) = &self.details {
            body["details"] = details.clone();
        }
        HttpResponse::build(self.status_code).json(body)
    }

    fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl From<ComplianceError> for ApiError {
    fn from(err: ComplianceError) -> Self {
        let status = match &err {
            ComplianceError::Validation { .. } | ComplianceError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            ComplianceError::ChainIntegrity(_) | ComplianceError::QueueEntry { .. } => StatusCode::CONFLICT,
            ComplianceError::Rejection(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ComplianceError::Network(_) => StatusCode::BAD_GATEWAY,
            ComplianceError::Signing(_) | ComplianceError::Storage(_) | ComplianceError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }

        let api_error = ApiError::new(err.to_string(), status);
        match err {
            ComplianceError::Rejection(rejection) => api_error.with_details(serde_json::json!({
                "reasons": rejection.reasons
            })),
            ComplianceError::Validation { field, .. } => {
                api_error.with_details(serde_json::json!({ "field": field }))
            }
            _ => api_error,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
