//! CSI error types.
//!
//! Errors returned by the Identity, Controller and Node services are
//! represented by the [`CsiError`] enum.  It derives [`thiserror::Error`] and
//! implements [`Serialize`]/[`Deserialize`] so errors can travel across the
//! QUIC transport layer.  Lower layers have their own closed enums
//! ([`BackendError`](crate::backend::BackendError),
//! [`MountError`](crate::mount::MountError)) which are folded into a
//! [`CsiError`] together with the operation and resource they failed on.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status code reported to the orchestrator.
///
/// Only the subset of gRPC codes this plugin ever produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    Internal,
    Unimplemented,
    Unavailable,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// The caller supplied a malformed or incomplete request.  Not retried by
    /// convention.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend or a local mount primitive failed.  The caller is expected
    /// to retry.
    #[error("internal error: {0}")]
    Internal(String),

    /// The RPC is deliberately not supported by this plugin.
    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),
}

impl CsiError {
    /// Create a [`CsiError::InvalidArgument`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn invalid<E: fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Internal error annotated with the failed operation and its target.
    pub fn failed<E: fmt::Display>(operation: &str, resource: &str, e: E) -> Self {
        Self::Internal(format!("{operation} {resource}: {e}"))
    }

    /// Shorthand for an RPC this plugin does not serve.
    pub fn unimplemented(rpc: &str) -> Self {
        Self::Unimplemented(format!("{rpc} is not supported"))
    }

    /// Status code this error is reported with.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::NotFound(_) => StatusCode::NotFound,
            Self::Internal(_) => StatusCode::Internal,
            Self::Unimplemented(_) => StatusCode::Unimplemented,
            Self::TransportError(_) => StatusCode::Unavailable,
        }
    }

    /// Whether the orchestrator should retry the call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code(), StatusCode::Internal | StatusCode::Unavailable)
    }
}

/// Validates that a required request field is present.
///
/// Returns [`CsiError::InvalidArgument`] naming the field otherwise.
pub trait Require<T> {
    fn require(self, name: &str) -> Result<T, CsiError>;
}

impl<'a> Require<&'a str> for &'a str {
    fn require(self, name: &str) -> Result<&'a str, CsiError> {
        if self.is_empty() {
            Err(CsiError::InvalidArgument(format!("{name} is required")))
        } else {
            Ok(self)
        }
    }
}
