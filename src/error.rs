//! Error classification shared by every module.
//!
//! Each module defines its own `thiserror` enum; this trait maps those
//! variants onto the four classes callers branch on, plus a stable
//! machine-readable code for the response envelope.

use serde::Serialize;

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input or a missing precondition. Nothing happened.
    Validation,
    /// The entity is in the wrong state for the request. Nothing happened.
    DomainState,
    /// The external call failed before any local confirmation. Retry later.
    ExternalTransient,
    /// The external action succeeded but local state disagrees.
    Divergence,
    /// Storage or invariant failure inside the local ledger.
    Internal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::ExternalTransient)
    }
}

pub trait ErrorCode {
    /// Stable code surfaced in `{success: false, error, code}` responses.
    fn code(&self) -> &'static str;

    fn class(&self) -> ErrorClass;
}
