//! Maps `RpcError` onto `tonic::Status` per §4.7.1: `NotFound -> NOT_FOUND`,
//! `InvalidArgument -> INVALID_ARGUMENT` (field violations attached as
//! binary details when `error_details` is enabled, otherwise flattened into
//! the message), everything else -> `INTERNAL`.

use conduit_codec::status::{flatten_violations, BadRequest};
use conduit_core::RpcError;
use tonic::{Code, Status};

pub fn grpc_status_for(err: &RpcError, error_details: bool) -> Status {
    match err {
        RpcError::NotFound => Status::new(Code::NotFound, "not found"),
        RpcError::InvalidArgument { field_violations } => {
            let bad_request = BadRequest { field_violations: field_violations.clone() };
            if error_details {
                let details = serde_json::to_vec(field_violations).unwrap_or_default();
                Status::with_details(Code::InvalidArgument, "invalid argument", details.into())
            } else {
                Status::new(Code::InvalidArgument, flatten_violations(&bad_request))
            }
        }
        RpcError::ServerError { message } => {
            Status::new(Code::Internal, message.clone().unwrap_or_else(|| RpcError::INTERNAL_SERVER_ERROR_MESSAGE.to_string()))
        }
        RpcError::Cancelled => Status::new(Code::Cancelled, "cancelled"),
        RpcError::DeadlineExceeded => Status::new(Code::DeadlineExceeded, "deadline exceeded"),
        RpcError::Unauthenticated => Status::new(Code::Unauthenticated, "unauthenticated"),
        RpcError::PermissionDenied => Status::new(Code::PermissionDenied, "permission denied"),
        RpcError::Unavailable => Status::new(Code::Unavailable, "unavailable"),
        RpcError::Internal | RpcError::Unknown => Status::new(Code::Internal, "internal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_not_found_code() {
        assert_eq!(grpc_status_for(&RpcError::NotFound, false).code(), Code::NotFound);
    }

    #[test]
    fn invalid_argument_flattens_violations_without_details() {
        let err = RpcError::invalid_field("name", "must not be empty");
        let status = grpc_status_for(&err, false);
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("name"));
    }
}
