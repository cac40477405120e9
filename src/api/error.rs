//! Error taxonomy for the REST surface.
//!
//! Every failure leaves the process as `{code, currentTime, text, version,
//! data: null}` with the HTTP status mirroring `code`. Validation failures
//! additionally carry per-field messages. Transient failures never leak
//! internal error strings.

use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::envelope::API_VERSION;

#[derive(Debug)]
pub enum ApiError {
    /// 400 with per-field messages
    Validation(BTreeMap<String, Vec<String>>),
    /// 401 invalid or missing API key
    PermissionDenied,
    /// 404 entity absent from the static store
    NotFound,
    /// 500; also the historical response for malformed combined IDs
    Internal,
    /// 503 deadline exceeded or store unavailable
    ServiceUnavailable,
}

impl ApiError {
    pub fn validation(field: &str, message: &str) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(field.to_string(), vec![message.to_string()]);
        Self::Validation(errors)
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::PermissionDenied => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn text(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation error",
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "resource not found",
            Self::Internal => "internal server error",
            Self::ServiceUnavailable => "service unavailable",
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: i32,
    pub current_time: i64,
    pub text: String,
    pub version: i32,
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<BTreeMap<String, Vec<String>>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let field_errors = match &self {
            ApiError::Validation(errors) => Some(errors.clone()),
            _ => None,
        };
        let body = ErrorBody {
            code: status.as_u16() as i32,
            current_time: chrono::Utc::now().timestamp_millis(),
            text: self.text().to_string(),
            version: API_VERSION,
            data: None,
            field_errors,
        };
        (status, Json(body)).into_response()
    }
}
