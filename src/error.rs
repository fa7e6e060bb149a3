// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for stablehand.
//!
//! Every failure that crosses the public boundary is classified into one of
//! the variants below. Callers can match on the kind to decide whether to
//! retry, report, or ignore; nothing escapes as an unstructured string.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by transport, registry, and probe operations.
///
/// `NotFound` never appears for local show/delete lookups; those surface the
/// absence through their return types (`Option`, [`crate::registry::DeleteOutcome`])
/// because a missing model is an expected outcome, not a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The daemon is unreachable at the connection level.
    Connection(String),
    /// The operation exceeded its deadline.
    Timeout(String),
    /// The daemon answered with a non-success HTTP status.
    Remote { status: u16, body: String },
    /// The requested model does not exist on the remote registry.
    NotFound(String),
    /// The HTTP method is outside the supported set. Raised before any I/O.
    InvalidMethod(String),
    /// Low-level I/O failure while reading a response.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "daemon unreachable: {}", msg),
            Self::Timeout(msg) => write!(f, "operation timed out: {}", msg),
            Self::Remote { status, body } => {
                if body.is_empty() {
                    write!(f, "daemon returned HTTP {}", status)
                } else {
                    write!(f, "daemon returned HTTP {}: {}", status, body)
                }
            }
            Self::NotFound(model) => write!(f, "model not found: {}", model),
            Self::InvalidMethod(method) => write!(f, "unsupported HTTP method: {}", method),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// True for connection-level failures the prober is allowed to retry.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
