//! Error types for directory operations.
//!
//! This module provides the error taxonomy of the directory access layer, the translation of
//! raw LDAP result codes into that taxonomy, and structured error responses for callers that
//! present failures to users.

use serde::Serialize;
use thiserror::Error;

/// Main error type for directory operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The directory server could not be reached or the transport failed
    #[error("Cannot connect to directory server: {0}")]
    ConnectError(String),

    /// The directory rejected the bind
    #[error("Bind failed: {0}")]
    BindError(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A search was truncated where a complete result is required
    #[error("limits exceeded for this query")]
    LimitsExceeded,

    /// Entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A lookup expected exactly one match
    #[error("The search criteria was not specific enough. Expected 1 and found {found}.")]
    SingleMatchExpected {
        /// Number of entries that matched
        found: usize,
    },

    /// The entry is already a member of the group
    #[error("This entry is already a member")]
    AlreadyGroupMember,

    /// The entry is not a member of the group
    #[error("This entry is not a member")]
    NotGroupMember,

    /// The entry is already enabled
    #[error("This entry is already enabled")]
    AlreadyActive,

    /// The entry is already disabled
    #[error("This entry is already disabled")]
    AlreadyInactive,

    /// A group cannot be a member of itself
    #[error("A group may not be added as a member of itself")]
    SameGroupError,

    /// The entry or value already exists
    #[error("This entry already exists: {0}")]
    DuplicateEntry(String),

    /// The value to change or remove was not present on the server
    #[error("change collided with another change: {0}")]
    MidairCollision(String),

    /// Insufficient access
    #[error("Insufficient access: {0}")]
    AclError(String),

    /// Invalid attribute syntax
    #[error("Invalid syntax: {0}")]
    InvalidSyntax(String),

    /// Object class violation
    #[error("Object class violation: {0}")]
    ObjectClassViolation(String),

    /// Modification not allowed on the RDN attribute
    #[error("Not allowed on RDN: {0}")]
    NotAllowedOnRdn(String),

    /// Operation not allowed on an entry with children
    #[error("Not allowed on non-leaf entry: {0}")]
    NotAllowedOnNonLeaf(String),

    /// Any other directory failure
    #[error("Database error ({code}): {message}")]
    DatabaseError {
        /// LDAP result code
        code: u32,
        /// Diagnostic message returned by the server
        message: String,
    },

    /// Invalid value for a named parameter
    #[error("invalid '{name}': {error}")]
    ValidationError {
        /// Parameter name
        name: String,
        /// Reason
        error: String,
    },

    /// Options that cannot be combined were given together
    #[error("Mutually exclusive options: {0}")]
    MutuallyExclusive(String),

    /// A value to remove was not present
    #[error("{attr} does not contain '{value}'")]
    AttrValueNotFound {
        /// Attribute name
        attr: String,
        /// Missing value
        value: String,
    },

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Specialized result type for directory operations.
pub type Result<T> = std::result::Result<T, Error>;

/// LDAP result codes the access layer interprets.
pub mod result_code {
    /// Operation completed
    pub const SUCCESS: u32 = 0;
    /// Time limit exceeded
    pub const TIME_LIMIT_EXCEEDED: u32 = 3;
    /// Size limit exceeded
    pub const SIZE_LIMIT_EXCEEDED: u32 = 4;
    /// Administrative limit exceeded
    pub const ADMIN_LIMIT_EXCEEDED: u32 = 11;
    /// Attribute or value to delete does not exist
    pub const NO_SUCH_ATTRIBUTE: u32 = 16;
    /// Attribute value already present
    pub const TYPE_OR_VALUE_EXISTS: u32 = 20;
    /// Invalid attribute syntax
    pub const INVALID_ATTRIBUTE_SYNTAX: u32 = 21;
    /// Entry does not exist
    pub const NO_SUCH_OBJECT: u32 = 32;
    /// Bad credentials
    pub const INVALID_CREDENTIALS: u32 = 49;
    /// Insufficient access rights
    pub const INSUFFICIENT_ACCESS_RIGHTS: u32 = 50;
    /// Object class violation
    pub const OBJECT_CLASS_VIOLATION: u32 = 65;
    /// Operation not allowed on an entry with children
    pub const NOT_ALLOWED_ON_NON_LEAF: u32 = 66;
    /// Operation not allowed on RDN
    pub const NOT_ALLOWED_ON_RDN: u32 = 67;
    /// Entry already exists
    pub const ENTRY_ALREADY_EXISTS: u32 = 68;
    /// Client side: server down
    pub const SERVER_DOWN: u32 = 81;
    /// Client side: connect error
    pub const CONNECT_ERROR: u32 = 91;

    /// Returns true for the codes signalling a truncated search.
    #[must_use]
    pub const fn is_limit_exceeded(rc: u32) -> bool {
        matches!(
            rc,
            TIME_LIMIT_EXCEEDED | SIZE_LIMIT_EXCEEDED | ADMIN_LIMIT_EXCEEDED
        )
    }
}

/// Structured error response for serialization.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
    /// Optional request ID for tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Error detail structure.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorDetail {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Error {
    /// Translates a non-success LDAP result code into the error taxonomy.
    ///
    /// Limit codes map to [`Error::LimitsExceeded`]; searches check for them before calling
    /// this so that a truncated search yields partial results instead.
    #[must_use]
    pub fn from_result_code(rc: u32, message: impl Into<String>) -> Self {
        use result_code::{
            CONNECT_ERROR, ENTRY_ALREADY_EXISTS, INSUFFICIENT_ACCESS_RIGHTS,
            INVALID_ATTRIBUTE_SYNTAX, INVALID_CREDENTIALS, NOT_ALLOWED_ON_NON_LEAF,
            NOT_ALLOWED_ON_RDN, NO_SUCH_ATTRIBUTE, NO_SUCH_OBJECT, OBJECT_CLASS_VIOLATION,
            SERVER_DOWN, TYPE_OR_VALUE_EXISTS,
        };

        let message = message.into();
        match rc {
            rc if result_code::is_limit_exceeded(rc) => Self::LimitsExceeded,
            NO_SUCH_ATTRIBUTE => Self::MidairCollision(message),
            TYPE_OR_VALUE_EXISTS | ENTRY_ALREADY_EXISTS => Self::DuplicateEntry(message),
            INVALID_ATTRIBUTE_SYNTAX => Self::InvalidSyntax(message),
            NO_SUCH_OBJECT => Self::NotFound(if message.is_empty() {
                "no such entry".to_string()
            } else {
                message
            }),
            INVALID_CREDENTIALS => Self::BindError(message),
            INSUFFICIENT_ACCESS_RIGHTS => Self::AclError(message),
            OBJECT_CLASS_VIOLATION => Self::ObjectClassViolation(message),
            NOT_ALLOWED_ON_NON_LEAF => Self::NotAllowedOnNonLeaf(message),
            NOT_ALLOWED_ON_RDN => Self::NotAllowedOnRdn(message),
            SERVER_DOWN | CONNECT_ERROR => Self::ConnectError(message),
            code => Self::DatabaseError { code, message },
        }
    }

    /// Returns the error code for this error type.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectError(_) => "CONNECT_ERROR",
            Self::BindError(_) => "BIND_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::LimitsExceeded => "LIMITS_EXCEEDED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::SingleMatchExpected { .. } => "SINGLE_MATCH_EXPECTED",
            Self::AlreadyGroupMember => "ALREADY_GROUP_MEMBER",
            Self::NotGroupMember => "NOT_GROUP_MEMBER",
            Self::AlreadyActive => "ALREADY_ACTIVE",
            Self::AlreadyInactive => "ALREADY_INACTIVE",
            Self::SameGroupError => "SAME_GROUP",
            Self::DuplicateEntry(_) => "DUPLICATE_ENTRY",
            Self::MidairCollision(_) => "MIDAIR_COLLISION",
            Self::AclError(_) => "ACI_ERROR",
            Self::InvalidSyntax(_) => "INVALID_SYNTAX",
            Self::ObjectClassViolation(_) => "OBJECTCLASS_VIOLATION",
            Self::NotAllowedOnRdn(_) => "NOT_ALLOWED_ON_RDN",
            Self::NotAllowedOnNonLeaf(_) => "NOT_ALLOWED_ON_NON_LEAF",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::MutuallyExclusive(_) => "MUTUALLY_EXCLUSIVE",
            Self::AttrValueNotFound { .. } => "ATTR_VALUE_NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Converts the error into an `ErrorResponse`.
    #[must_use]
    pub fn into_error_response(self) -> ErrorResponse {
        self.into_error_response_with_id(None)
    }

    /// Converts the error into an `ErrorResponse` with a request ID.
    #[must_use]
    pub fn into_error_response_with_id(self, request_id: Option<String>) -> ErrorResponse {
        let details = match &self {
            Self::DatabaseError { code, .. } => Some(serde_json::json!({ "result_code": code })),
            Self::SingleMatchExpected { found } => Some(serde_json::json!({ "found": found })),
            _ => None,
        };
        ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                details,
            },
            request_id,
        }
    }

    /// Returns true if this error should be logged as a serious error.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self,
            Self::InternalError(_)
                | Self::ConfigError(_)
                | Self::ConnectError(_)
                | Self::DatabaseError { .. }
        )
    }

    /// Returns true for failures of the transport or of authentication.
    ///
    /// These propagate to the request boundary unmodified.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectError(_) | Self::BindError(_) | Self::Timeout(_)
        )
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::ConfigError(format!("invalid URI: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::ConfigError(err.to_string())
    }
}
