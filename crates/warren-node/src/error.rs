// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use warren_core::Error;

/// Adapter mapping the runtime error taxonomy onto HTTP.
///
/// 4xx for user input problems with `{error}` bodies; 5xx only for true
/// internal failures.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_)
            | Error::Conflict(_)
            | Error::ReadonlyViolation
            | Error::InvalidApproval(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Provider(_) => StatusCode::BAD_GATEWAY,
            Error::Overloaded(_) | Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

// ─── Unit tests ──────────────────────────────────────────────────────────────
