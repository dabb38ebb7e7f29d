//! The canonical `Status{code, message, details}` shape the Binary-IDL codec
//! renders every [`RpcError`] into (§4.3 rule 8), independent of whichever
//! transport ultimately carries the bytes.

use std::collections::BTreeMap;

use conduit_core::RpcError;

/// The well-known status codes the Binary-IDL codec maps errors to. A
/// transport that has its own native status mechanism (gRPC, HTTP) may
/// re-derive its wire status directly from the originating `RpcError`
/// instead of parsing this back out of the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    NotFound,
    Internal,
    Cancelled,
    DeadlineExceeded,
    Unauthenticated,
    PermissionDenied,
    Unavailable,
    Unknown,
}

impl StatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Unknown => "UNKNOWN",
        }
    }
}

/// `BadRequest{field_violations}`, attached as `Status::details` only for
/// `InvalidArgument`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BadRequest {
    pub field_violations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
    pub details: Option<BadRequest>,
}

impl From<&RpcError> for Status {
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::NotFound => Status {
                code: StatusCode::NotFound,
                message: "not found".to_string(),
                details: None,
            },
            RpcError::InvalidArgument { field_violations } => Status {
                code: StatusCode::InvalidArgument,
                message: "invalid argument".to_string(),
                details: Some(BadRequest {
                    field_violations: field_violations.clone(),
                }),
            },
            RpcError::ServerError { .. } => Status {
                code: StatusCode::Internal,
                message: RpcError::INTERNAL_SERVER_ERROR_MESSAGE.to_string(),
                details: None,
            },
            RpcError::Cancelled => Status {
                code: StatusCode::Cancelled,
                message: "cancelled".to_string(),
                details: None,
            },
            RpcError::DeadlineExceeded => Status {
                code: StatusCode::DeadlineExceeded,
                message: "deadline exceeded".to_string(),
                details: None,
            },
            RpcError::Unauthenticated => Status {
                code: StatusCode::Unauthenticated,
                message: "unauthenticated".to_string(),
                details: None,
            },
            RpcError::PermissionDenied => Status {
                code: StatusCode::PermissionDenied,
                message: "permission denied".to_string(),
                details: None,
            },
            RpcError::Unavailable => Status {
                code: StatusCode::Unavailable,
                message: "unavailable".to_string(),
                details: None,
            },
            RpcError::Internal => Status {
                code: StatusCode::Internal,
                message: RpcError::INTERNAL_SERVER_ERROR_MESSAGE.to_string(),
                details: None,
            },
            RpcError::Unknown => Status {
                code: StatusCode::Unknown,
                message: "unknown".to_string(),
                details: None,
            },
        }
    }
}

/// `field: message` lines, used when a transport flattens violations into a
/// single text field instead of attaching structured details (§4.7.1).
pub fn flatten_violations(details: &BadRequest) -> String {
    details
        .field_violations
        .iter()
        .map(|(field, message)| format!("{field}: {message}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_carries_field_violations() {
        let err = RpcError::invalid_field("name", "must not be empty");
        let status = Status::from(&err);
        assert_eq!(status.code, StatusCode::InvalidArgument);
        assert_eq!(
            status.details.unwrap().field_violations["name"],
            "must not be empty"
        );
    }

    #[test]
    fn server_error_never_leaks_handler_message() {
        let err = RpcError::ServerError {
            message: Some("raw db connection string leaked here".to_string()),
        };
        let status = Status::from(&err);
        assert_eq!(status.message, RpcError::INTERNAL_SERVER_ERROR_MESSAGE);
    }

    #[test]
    fn flatten_joins_field_message_lines() {
        let mut details = BadRequest::default();
        details.field_violations.insert("a".into(), "bad".into());
        details.field_violations.insert("b".into(), "worse".into());
        assert_eq!(flatten_violations(&details), "a: bad\nb: worse");
    }
}
