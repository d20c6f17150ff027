// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use axum::http::StatusCode;
use serde_json::{json, Value};

/// Request-scope error taxonomy.  Tool-scope errors never reach this layer;
/// the agentic loop converts them to tool-result data.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Provider failure after the adapter's single retry.
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "invalid_request_error",
            ApiError::NotFound(_) => "not_found_error",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// OpenAI-style error envelope.  Internal detail is withheld unless
    /// `dev_mode`; the request id is always present so operators can find
    /// the full story in the logs.
    pub fn envelope(&self, request_id: &str, dev_mode: bool) -> Value {
        let message = match self {
            ApiError::Internal(detail) if !dev_mode => {
                format!("internal error (request {request_id})")
            }
            other => other.to_string(),
        };
        json!({
            "error": {
                "message": message,
                "type": self.error_type(),
                "code": self.status().as_u16(),
                "request_id": request_id,
            }
        })
    }
}
