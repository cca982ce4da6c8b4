//! Registry error taxonomy, exit codes and JSON error responses

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::site::SiteState;

/// Exit code for usage errors (matches sysexits EX_USAGE)
pub const EXIT_USAGE: i32 = 64;
/// Exit code for unexpected internal errors
pub const EXIT_INTERNAL: i32 = 1;
/// Exit code when a collaborator step of a workflow failed
pub const EXIT_COLLABORATOR: i32 = 7;
/// Exit code when reconciliation found drift
pub const EXIT_DRIFT: i32 = 8;

/// Errors produced by registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("domain {domain} is already registered on port {port}")]
    AlreadyRegistered { domain: String, port: u16 },

    #[error("domain {domain} is not registered")]
    NotFound { domain: String },

    #[error("domain {domain} is {state}, expected pending")]
    InvalidState { domain: String, state: SiteState },

    #[error("no free port left in range {floor}-{ceiling}")]
    PortExhausted { floor: u16, ceiling: u16 },

    #[error("invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    /// Storage failure; the operation did not commit
    #[error("registry storage failure: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::AlreadyRegistered { .. } => ErrorCode::AlreadyRegistered,
            RegistryError::NotFound { .. } => ErrorCode::NotFound,
            RegistryError::InvalidState { .. } => ErrorCode::InvalidState,
            RegistryError::PortExhausted { .. } => ErrorCode::PortExhausted,
            RegistryError::InvalidDomain { .. } => ErrorCode::InvalidDomain,
            RegistryError::Persistence(_) => ErrorCode::PersistenceFailure,
        }
    }

    /// Process exit code reported by the CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    /// Expected, user-facing conditions (everything but storage failures)
    pub fn is_expected(&self) -> bool {
        !matches!(self, RegistryError::Persistence(_))
    }
}

/// Stable error codes shared by the CLI and the admin API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Domain already has a pending or active site
    AlreadyRegistered,
    /// Domain has no site
    NotFound,
    /// Lifecycle transition not allowed from the current state
    InvalidState,
    /// Configured port range is full
    PortExhausted,
    /// Domain failed validation
    InvalidDomain,
    /// Durable state could not be read or written
    PersistenceFailure,
    /// Missing or wrong bearer token
    Unauthorized,
    /// Malformed request
    BadRequest,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::AlreadyRegistered => StatusCode::CONFLICT,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidState => StatusCode::CONFLICT,
            ErrorCode::PortExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InvalidDomain => StatusCode::BAD_REQUEST,
            ErrorCode::PersistenceFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorCode::NotFound => 2,
            ErrorCode::AlreadyRegistered => 3,
            ErrorCode::PortExhausted => 4,
            ErrorCode::InvalidState => 5,
            ErrorCode::InvalidDomain => 6,
            ErrorCode::BadRequest => EXIT_USAGE,
            ErrorCode::PersistenceFailure | ErrorCode::Unauthorized | ErrorCode::InternalError => {
                EXIT_INTERNAL
            }
        }
    }

    /// Get the error code as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AlreadyRegistered => "ALREADY_REGISTERED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::PortExhausted => "PORT_EXHAUSTED",
            ErrorCode::InvalidDomain => "INVALID_DOMAIN",
            ErrorCode::PersistenceFailure => "PERSISTENCE_FAILURE",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

impl From<&RegistryError> for ErrorResponse {
    fn from(err: &RegistryError) -> Self {
        ErrorResponse::new(err.code(), err.to_string())
    }
}

/// Create a JSON error response with an X-Siteport-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("content-type", "application/json")
        .header("x-siteport-error", code.as_str())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            ErrorCode::NotFound,
            ErrorCode::AlreadyRegistered,
            ErrorCode::PortExhausted,
            ErrorCode::InvalidState,
            ErrorCode::InvalidDomain,
            ErrorCode::PersistenceFailure,
        ];
        let mut exits: Vec<i32> = codes.iter().map(|c| c.exit_code()).collect();
        exits.sort();
        exits.dedup();
        assert_eq!(exits.len(), codes.len());
        assert!(!exits.contains(&0));
    }

    #[test]
    fn test_registry_error_mapping() {
        let err = RegistryError::NotFound { domain: "a.com".into() };
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.exit_code(), 2);
        assert!(err.is_expected());

        let err = RegistryError::PortExhausted { floor: 5000, ceiling: 5001 };
        assert_eq!(err.code().status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.to_string(), "no free port left in range 5000-5001");

        let err = RegistryError::Persistence(rusqlite::Error::InvalidQuery);
        assert!(!err.is_expected());
        assert_eq!(err.exit_code(), EXIT_INTERNAL);
    }

    #[test]
    fn test_error_response_json() {
        let err = RegistryError::AlreadyRegistered { domain: "x.com".into(), port: 5000 };
        let json = ErrorResponse::from(&err).to_json();

        assert!(json.contains("\"code\":\"ALREADY_REGISTERED\""));
        assert!(json.contains("\"message\":\"domain x.com is already registered on port 5000\""));
        assert!(json.contains("\"status\":409"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ErrorCode::InvalidState, "nope");

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("x-siteport-error").unwrap(),
            "INVALID_STATE"
        );
    }
}
