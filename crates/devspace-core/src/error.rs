// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error taxonomy for workspace lifecycle operations.
//!
//! Four kinds reach callers of the lifecycle API:
//!
//! | Kind | Retried | Meaning |
//! |------|---------|---------|
//! | [`ValidationError`] | never | malformed environment |
//! | [`InfrastructureError`] | transient backend errors only, inside the infrastructure | backend call failed |
//! | [`RuntimeError::Conflict`] | never | lock contention or already in the requested state |
//! | [`RuntimeError::Forbidden`] | never | permission denied |

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Result type using [`RuntimeError`].
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// An environment failed validation against backend constraints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// Human readable reason.
    pub message: String,
}

impl ValidationError {
    /// Create a validation error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A backend call or a provisioning step failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum InfrastructureError {
    /// The container backend rejected or failed a call.
    #[error("Backend error during {operation}: {message}")]
    Backend {
        /// Backend operation that failed (e.g. `create_container`).
        operation: String,
        /// Error details reported by the backend.
        message: String,
        /// Whether retrying the call may succeed.
        transient: bool,
    },

    /// The operation did not finish before its deadline.
    #[error("Operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// A start was interrupted by a stop request.
    #[error("Start of workspace '{0}' was interrupted")]
    Interrupted(String),

    /// An invariant of the provisioning pipeline or runtime was violated.
    #[error("Internal infrastructure error: {0}")]
    Internal(String),

    /// The infrastructure does not implement the requested capability.
    #[error("Operation '{operation}' is not supported by infrastructure '{infrastructure}'")]
    Unsupported {
        /// Infrastructure name.
        infrastructure: String,
        /// Capability that was requested.
        operation: String,
    },
}

impl InfrastructureError {
    /// Build a backend error.
    pub fn backend(
        operation: impl Into<String>,
        message: impl Into<String>,
        transient: bool,
    ) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
            transient,
        }
    }

    /// Whether the error is worth a bounded retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend { transient: true, .. })
    }
}

/// Errors surfaced by the lifecycle API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The environment is malformed.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The backend failed.
    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),

    /// Lock contention, or the workspace is in a state that forbids the operation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The subject lacks the required permission.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Workspace, environment or infrastructure does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Shared state store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl RuntimeError {
    /// Stable error code, suitable for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Infrastructure(InfrastructureError::Timeout(_)) => "TIMEOUT",
            Self::Infrastructure(_) => "INFRASTRUCTURE_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// Whether this is a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(InfrastructureError::backend("create_container", "503", true).is_transient());
        assert!(!InfrastructureError::backend("create_container", "bad image", false).is_transient());
        assert!(!InfrastructureError::Timeout(Duration::from_secs(5)).is_transient());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RuntimeError::from(ValidationError::new("no machines")).error_code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            RuntimeError::from(InfrastructureError::Timeout(Duration::from_secs(1))).error_code(),
            "TIMEOUT"
        );
        assert_eq!(RuntimeError::Conflict("busy".into()).error_code(), "CONFLICT");
        assert_eq!(RuntimeError::Forbidden("no".into()).error_code(), "FORBIDDEN");
    }

    #[test]
    fn test_display() {
        let err = InfrastructureError::Timeout(Duration::from_secs(300));
        assert_eq!(err.to_string(), "Operation timed out after 300s");
        let err = RuntimeError::Conflict("workspace 'w1' is RUNNING".into());
        assert_eq!(err.to_string(), "Conflict: workspace 'w1' is RUNNING");
    }
}
