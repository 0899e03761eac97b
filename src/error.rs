//! Error handling for lavaclient.
//!
//! Errors carry a category modelled on gRPC status codes plus the underlying
//! error. The category is what callers branch on: the connection state
//! machine, for example, only needs to know whether a failure is worth
//! retrying, while the details are for the logs.
//!
//! # Example
//!
//! ```rust
//! use lavaclient::error::{Error, ErrorKind, Result};
//!
//! fn resolve(path: &str) -> Result<()> {
//!     if path.is_empty() {
//!         return Err(Error::invalid_argument("empty path"));
//!     }
//!
//!     // Standard errors convert into their logical category.
//!     let _metadata = std::fs::metadata(path)?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// Returns `None` when the underlying error is of another type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

/// Standard result type for lavaclient operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories, numbered like gRPC status codes.
///
/// Each kind names the HTTP status a node answers with for it, where there
/// is one. [`ErrorKind::from_status`] maps in the other direction.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    /// Shutdown interrupted the operation. (499)
    #[error("cancelled")]
    Cancelled = 1,

    #[error("unknown error")]
    Unknown = 2,

    /// Malformed frames, configuration or tracks. (400)
    #[error("invalid argument")]
    InvalidArgument = 3,

    /// A handshake or readiness wait ran out of time. (504)
    #[error("deadline exceeded")]
    DeadlineExceeded = 4,

    /// (404)
    #[error("not found")]
    NotFound = 5,

    /// A node identifier was configured twice. (409)
    #[error("already exists")]
    AlreadyExists = 6,

    /// The node rejected the password. (403)
    #[error("permission denied")]
    PermissionDenied = 7,

    /// No password, or one the node does not know. (401)
    #[error("unauthenticated")]
    Unauthenticated = 16,

    /// The node is rate limiting. (429)
    #[error("resource exhausted")]
    ResourceExhausted = 8,

    #[error("failed precondition")]
    FailedPrecondition = 9,

    /// The socket went away mid-operation.
    #[error("aborted")]
    Aborted = 10,

    /// A value does not fit its wire representation.
    #[error("out of range")]
    OutOfRange = 11,

    /// Node versions, ops and event types this client does not speak. (501)
    #[error("unimplemented")]
    Unimplemented = 12,

    /// (500)
    #[error("internal error")]
    Internal = 13,

    /// The node cannot be reached. (503)
    #[error("unavailable")]
    Unavailable = 14,

    /// A track ended before its mandatory fields.
    #[error("data loss")]
    DataLoss = 15,
}

impl ErrorKind {
    /// Maps an HTTP status code returned by a node to an error kind.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => Self::InvalidArgument,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            409 => Self::AlreadyExists,
            429 => Self::ResourceExhausted,
            499 => Self::Cancelled,
            501 => Self::Unimplemented,
            503 => Self::Unavailable,
            504 => Self::DeadlineExceeded,
            500..=599 => Self::Internal,
            _ => Self::Unknown,
        }
    }
}

macro_rules! constructor {
    ($(#[$doc:meta])* $name:ident => $kind:ident) => {
        $(#[$doc])*
        pub fn $name<E>(error: E) -> Self
        where
            E: Into<Box<dyn std::error::Error + Send + Sync>>,
        {
            Self::new(ErrorKind::$kind, error)
        }
    };
}

impl Error {
    /// Creates a new error with specified kind and details.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::new(ErrorKind::NotFound, "node not registered");
    /// assert_eq!(err.kind, ErrorKind::NotFound);
    /// ```
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    constructor!(
        /// Creates an error for operations that were interrupted mid-execution,
        /// such as a connection reset while sending.
        aborted => Aborted
    );
    constructor!(
        /// Creates an error for duplicate registrations.
        already_exists => AlreadyExists
    );
    constructor!(
        /// Creates an error for operations cancelled by a shutdown request.
        cancelled => Cancelled
    );
    constructor!(
        /// Creates an error for truncated or corrupted data, like a track
        /// buffer that ends before its mandatory fields.
        data_loss => DataLoss
    );
    constructor!(
        /// Creates an error for operations that exceeded their deadline.
        deadline_exceeded => DeadlineExceeded
    );
    constructor!(
        /// Creates an error for operations that cannot proceed in the current
        /// state, for example sending on a closed socket.
        failed_precondition => FailedPrecondition
    );
    constructor!(
        /// Creates an error for internal failures such as a panicked worker.
        internal => Internal
    );
    constructor!(
        /// Creates an error for malformed input.
        invalid_argument => InvalidArgument
    );
    constructor!(
        /// Creates an error for things that do not exist, such as a local path.
        not_found => NotFound
    );
    constructor!(
        /// Creates an error for values that exceed their encodable range.
        out_of_range => OutOfRange
    );
    constructor!(
        /// Creates an error for rejected credentials (HTTP 403).
        permission_denied => PermissionDenied
    );
    constructor!(
        /// Creates an error for exhausted quotas or buffers.
        resource_exhausted => ResourceExhausted
    );
    constructor!(
        /// Creates an error for missing or invalid credentials (HTTP 401).
        unauthenticated => Unauthenticated
    );
    constructor!(
        /// Creates an error for nodes that cannot be reached.
        unavailable => Unavailable
    );
    constructor!(
        /// Creates an error for protocol features this client does not speak,
        /// like an unsupported node API version.
        unimplemented => Unimplemented
    );
    constructor!(
        /// Creates an error that fits no other category.
        unknown => Unknown
    );
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error as "{kind}: {details}".
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrInUse | AlreadyExists => Self::already_exists(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts HTTP client errors into error kinds.
///
/// Status errors map through [`ErrorKind::from_status`], so that a node
/// rejecting the password surfaces as `Unauthenticated`.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::new(ErrorKind::from_status(status.as_u16()), err);
        }

        if err.is_body() {
            return Self::data_loss(err);
        }

        if err.is_decode() {
            return Self::invalid_argument(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        if err.is_connect() {
            return Self::unavailable(err);
        }

        if err.is_redirect() {
            return Self::resource_exhausted(err);
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        Self::unknown(err)
    }
}

impl From<semver::Error> for Error {
    fn from(err: semver::Error) -> Self {
        Self::invalid_argument(err)
    }
}

/// Converts WebSocket errors into error kinds.
///
/// A closed connection is `Aborted` rather than `Cancelled`: only a manual
/// shutdown cancels.
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;
        match &err {
            ConnectionClosed | AlreadyClosed => Self::aborted(err),
            Io(_) => Self::unavailable(err),
            Capacity(_) => Self::out_of_range(err),
            Utf8 => Self::invalid_argument(err),
            WriteBufferFull(_) => Self::resource_exhausted(err.to_string()),
            AttackAttempt => Self::permission_denied(err),
            Http(response) => Self::new(ErrorKind::from_status(response.status().as_u16()), err),
            _ => Self::unknown(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_argument(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_argument(err)
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<http::uri::InvalidUri> for Error {
    fn from(e: http::uri::InvalidUri) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::cancelled(e)
        } else {
            Self::internal(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(ErrorKind::from_status(401), ErrorKind::Unauthenticated);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::PermissionDenied);
        assert_eq!(ErrorKind::from_status(502), ErrorKind::Internal);
        assert_eq!(ErrorKind::from_status(302), ErrorKind::Unknown);
    }

    #[test]
    fn display_includes_kind_and_details() {
        let err = Error::not_found("/music/rock does not exist");
        assert_eq!(err.to_string(), "not found: /music/rock does not exist");
    }

    #[test]
    fn io_errors_keep_their_category() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(err.downcast::<std::io::Error>().is_some());
    }
}
