//! Error types for the control plane core.
//!
//! Every operation in this crate fails into exactly one of five kinds.
//! Collaborators on the other side of the repository contracts (the
//! persistence engine, the cache) report their own richer errors, but this
//! crate only ever surfaces one of these five across its own API surface.

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The five error kinds this crate's API surface can produce.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "kind", content = "message")]
pub enum Error {
    /// Input failed a domain invariant (bad port range, unknown rule kind,
    /// mutually exclusive fields set together, etc).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced entity (agent, rule, chain, node, resource group,
    /// subscription) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested change conflicts with existing state (port already in
    /// use, duplicate name, stale version).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller does not own, or is not permitted to act on, the target
    /// entity.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Anything else: collaborator failure, bug, unreachable state. Always
    /// logged with full context before being returned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Short machine-readable kind tag, used in structured log fields and in
    /// the REST fallback's error body (§6.3).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Forbidden(_) => "forbidden",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Error::validation("x").kind(), "validation");
        assert_eq!(Error::not_found("x").kind(), "not_found");
        assert_eq!(Error::conflict("x").kind(), "conflict");
        assert_eq!(Error::forbidden("x").kind(), "forbidden");
        assert_eq!(Error::internal("x").kind(), "internal");
    }

    #[test]
    fn display_includes_message() {
        let err = Error::validation("port out of range");
        assert_eq!(err.to_string(), "validation failed: port out of range");
    }
}
