// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use picket_wire::ErrorCode;
use serde::{Deserialize, Serialize};

/// HTTP status for a wire error code, used by the REST endpoints.
pub fn http_status(code: ErrorCode) -> u16 {
    match code {
        ErrorCode::Auth => 401,
        ErrorCode::Unauthorised => 403,
        ErrorCode::AgentOffline => 404,
        ErrorCode::UnknownSession => 404,
        ErrorCode::InvalidMessage => 400,
        ErrorCode::RateLimit => 429,
        ErrorCode::Unavailable => 503,
        ErrorCode::Internal => 500,
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

pub fn to_http_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    let status =
        StatusCode::from_u16(http_status(code)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorResponse {
        error: ErrorBody { code: code.as_str().to_owned(), message: message.into() },
    };
    (status, Json(body))
}
