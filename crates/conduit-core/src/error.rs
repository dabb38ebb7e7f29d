//! Error taxonomy shared by every transport.
//!
//! `RpcError` is the one error type that crosses transport boundaries. Every
//! adapter maps the full set of variants onto its own wire status; nothing
//! else is allowed to leak past the dispatch boundary. Anything a handler or
//! dependency provider panics on, or returns as some other error type, is
//! folded into `ServerError` with a fixed, non-leaking message.

use std::collections::BTreeMap;
use std::fmt;

/// The closed set of error kinds a handler, dependency provider, or the
/// dispatch engine itself can surface to a caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The requested resource does not exist.
    #[error("not found")]
    NotFound,

    /// The request failed validation. `field_violations` maps a field path
    /// (dotted, e.g. `"address.zip"`) to a human-readable violation message.
    /// All violations found during construction are reported together, not
    /// just the first one.
    #[error("invalid argument")]
    InvalidArgument {
        field_violations: BTreeMap<String, String>,
    },

    /// A handler-raised application error, with an optional message.
    /// Uncaught failures inside a handler or provider are converted to this
    /// variant with a fixed message (see `ServerError::internal_message`) so
    /// that the raw failure -- and anything it might contain -- never
    /// reaches the caller.
    #[error("server error")]
    ServerError { message: Option<String> },

    /// The request was cancelled by the caller before completion.
    #[error("cancelled")]
    Cancelled,

    /// The caller's deadline passed before a reply was produced.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// No valid authentication credentials were provided.
    #[error("unauthenticated")]
    Unauthenticated,

    /// The caller is authenticated but not permitted to perform this call.
    #[error("permission denied")]
    PermissionDenied,

    /// The service is temporarily unable to handle the request.
    #[error("unavailable")]
    Unavailable,

    /// An internal invariant was violated; never attributable to caller
    /// input.
    #[error("internal")]
    Internal,

    /// A failure that does not fit any other kind.
    #[error("unknown")]
    Unknown,
}

impl RpcError {
    /// The fixed message substituted for any uncaught handler or provider
    /// failure, so internal error text never reaches a caller.
    pub const INTERNAL_SERVER_ERROR_MESSAGE: &'static str = "Internal server error";

    /// Build the canonical "uncaught failure" error.
    pub fn uncaught() -> Self {
        RpcError::ServerError {
            message: Some(Self::INTERNAL_SERVER_ERROR_MESSAGE.to_string()),
        }
    }

    /// Build an `InvalidArgument` from a single field violation.
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut field_violations = BTreeMap::new();
        field_violations.insert(field.into(), message.into());
        RpcError::InvalidArgument { field_violations }
    }

    /// A short, stable name for this error kind, used by transports that
    /// need a wire-level status word distinct from the human message.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RpcError::NotFound => "not_found",
            RpcError::InvalidArgument { .. } => "invalid_argument",
            RpcError::ServerError { .. } => "server_error",
            RpcError::Cancelled => "cancelled",
            RpcError::DeadlineExceeded => "deadline_exceeded",
            RpcError::Unauthenticated => "unauthenticated",
            RpcError::PermissionDenied => "permission_denied",
            RpcError::Unavailable => "unavailable",
            RpcError::Internal => "internal",
            RpcError::Unknown => "unknown",
        }
    }
}

/// Helper for accumulating field violations while constructing a
/// [`crate::model::Model`] from a generic mapping, then converting them into
/// a single `InvalidArgument` at the end.
#[derive(Debug, Default)]
pub struct ViolationSet {
    violations: BTreeMap<String, String>,
}

impl ViolationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.insert(field.into(), message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Consume the set, returning `Ok(())` if empty or the matching
    /// `RpcError::InvalidArgument` otherwise.
    pub fn into_result(self) -> Result<(), RpcError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(RpcError::InvalidArgument {
                field_violations: self.violations,
            })
        }
    }
}

impl fmt::Display for ViolationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (field, message) in &self.violations {
            writeln!(f, "{field}: {message}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncaught_never_leaks_original_message() {
        let err = RpcError::uncaught();
        match err {
            RpcError::ServerError { message } => {
                assert_eq!(message.as_deref(), Some(RpcError::INTERNAL_SERVER_ERROR_MESSAGE));
            }
            _ => panic!("expected ServerError"),
        }
    }

    #[test]
    fn violation_set_collects_all_violations() {
        let mut set = ViolationSet::new();
        set.push("name", "must not be empty");
        set.push("age", "must be non-negative");
        let err = set.into_result().unwrap_err();
        match err {
            RpcError::InvalidArgument { field_violations } => {
                assert_eq!(field_violations.len(), 2);
                assert_eq!(field_violations["name"], "must not be empty");
            }
            _ => panic!("expected InvalidArgument"),
        }
    }

    #[test]
    fn empty_violation_set_is_ok() {
        assert!(ViolationSet::new().into_result().is_ok());
    }

    #[test]
    fn kind_name_is_stable() {
        assert_eq!(RpcError::NotFound.kind_name(), "not_found");
        assert_eq!(RpcError::Unavailable.kind_name(), "unavailable");
    }
}
