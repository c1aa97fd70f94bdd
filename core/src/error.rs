use serde::{Deserialize, Serialize};

/// Cross-cutting error taxonomy every domain error maps onto, independent of which
/// crate raised it. The tool dispatcher (see `citeloom-mcp`) further maps this onto
/// the five-tool error envelope codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    ResourceExhausted,
    DeadlineExceeded,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

/// Implemented by every error enum in the workspace so the mcp dispatcher can map
/// any crate's error onto an envelope code without per-crate knowledge.
pub trait CiteloomError: std::error::Error {
    fn error_code(&self) -> ErrorCode;
}
