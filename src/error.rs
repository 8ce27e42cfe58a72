//! Error taxonomy shared by the REST JSON envelope and the RPC wire codes.
//!
//! See spec.md §7. The HTTP surface renders [`ApiError`] as
//! `{error, status, code?, message, details?, remediation[], retryable, timestamp}`;
//! the RPC surface maps the same [`ErrorCode`] values to the protocol-level
//! codes listed in spec.md §7.

use chrono::Utc;
use serde::Serialize;

/// Coarse error taxonomy. Each variant carries its own retryability and a
/// static remediation list, filled in from [`ErrorCode::remediation`] when
/// a call site doesn't supply one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Configuration,
    Model,
    Storage,
    Tool,
    Plan,
    Budget,
    Internal,
    InvalidInput,
    NotImplemented,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    FailedPrecondition,
    ResourceExhausted,
    Unavailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Configuration => "configuration",
            ErrorCode::Model => "model",
            ErrorCode::Storage => "storage",
            ErrorCode::Tool => "tool",
            ErrorCode::Plan => "plan",
            ErrorCode::Budget => "budget",
            ErrorCode::Internal => "internal",
            ErrorCode::InvalidInput => "invalid-input",
            ErrorCode::NotImplemented => "not-implemented",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::PermissionDenied => "permission-denied",
            ErrorCode::NotFound => "not-found",
            ErrorCode::FailedPrecondition => "failed-precondition",
            ErrorCode::ResourceExhausted => "resource-exhausted",
            ErrorCode::Unavailable => "unavailable",
        }
    }

    /// HTTP status this code renders as on the REST surface.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::Unauthenticated => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::InvalidInput => 400,
            ErrorCode::FailedPrecondition => 409,
            ErrorCode::ResourceExhausted => 429,
            ErrorCode::NotImplemented => 501,
            ErrorCode::Unavailable => 503,
            ErrorCode::Configuration
            | ErrorCode::Model
            | ErrorCode::Storage
            | ErrorCode::Tool
            | ErrorCode::Plan
            | ErrorCode::Budget
            | ErrorCode::Internal => 500,
        }
    }

    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::ResourceExhausted | ErrorCode::Unavailable | ErrorCode::Storage
        )
    }

    fn remediation(self) -> &'static [&'static str] {
        match self {
            ErrorCode::Unauthenticated => &["Provide a valid bearer token or sign in again."],
            ErrorCode::PermissionDenied => &["Use an account with sufficient scope for this operation."],
            ErrorCode::NotFound => &["Check the resource id and that you have access to it."],
            ErrorCode::ResourceExhausted => &["Wait and retry; you may be rate-limited or at a connection cap."],
            ErrorCode::InvalidInput => &["Check the request body against the documented schema."],
            ErrorCode::Storage => &["Retry the request; if it persists, check daemon logs."],
            ErrorCode::Configuration => &["Fix the daemon's configuration and restart."],
            _ => &[],
        }
    }
}

/// JSON envelope returned by every REST error response (spec.md §7).
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub remediation: Vec<&'static str>,
    pub retryable: bool,
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error: message.clone(),
            status: code.http_status(),
            code: Some(code.as_str()),
            message,
            details: None,
            remediation: code.remediation().to_vec(),
            retryable: code.retryable(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = axum::http::StatusCode::from_u16(self.status)
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(self)).into_response()
    }
}

/// RPC-side error, carrying the protocol-level code and message only —
/// store failures never leak detail on this surface (spec.md §7).
#[derive(Debug, Serialize)]
pub struct RpcErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl RpcErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str(),
            message: message.into(),
        }
    }
}
