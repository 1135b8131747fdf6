//! # Error Contract
//!
//! Every command outcome that is not a success reaches the caller as an
//! [`Error`] through the same callback/deferred channel as success values.
//!
//! ## Taxonomy
//! - **Param**: malformed caller input, detected while preparing a command.
//! - **Connection**: the client is not connected, is closed, or could not
//!   reach any node.
//! - **Io**: transient execution failures (pool exhausted, timeout).
//! - **Server**: a status returned by a node for a specific key.

use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use ckv_common::{CkvError, Status};
use thiserror::Error;

/// Result type for the driver.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad error class, derived from the status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Param,
    Connection,
    Io,
    Server,
}

impl ErrorKind {
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::InvalidParam => ErrorKind::Param,
            Status::Connection | Status::InvalidNode => ErrorKind::Connection,
            Status::Timeout => ErrorKind::Io,
            status if status.is_server() => ErrorKind::Server,
            _ => ErrorKind::Io,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Param => "parameter",
            ErrorKind::Connection => "connection",
            ErrorKind::Io => "io",
            ErrorKind::Server => "server",
        };
        f.write_str(name)
    }
}

/// Where a command was issued, captured when stack-trace capture is on.
#[derive(Debug)]
pub struct CallSite {
    location: &'static Location<'static>,
    backtrace: String,
}

impl CallSite {
    /// Captures the caller location and a full backtrace.
    pub(crate) fn capture(location: &'static Location<'static>) -> Self {
        CallSite {
            location,
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn backtrace(&self) -> &str {
        &self.backtrace
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location)
    }
}

/// Driver error delivered through callbacks and deferred values.
#[derive(Debug, Clone, Error)]
#[error("{kind} error {status}: {message}")]
pub struct Error {
    kind: ErrorKind,
    status: Status,
    message: String,
    call_site: Option<Arc<CallSite>>,
}

impl Error {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Error {
            kind: ErrorKind::from_status(status),
            status,
            message: message.into(),
            call_site: None,
        }
    }

    pub fn param(message: impl Into<String>) -> Self {
        Error::new(Status::InvalidParam, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Error::new(Status::Connection, message)
    }

    /// Attaches the call site unless one is already present.
    pub(crate) fn with_call_site(mut self, call_site: Option<Arc<CallSite>>) -> Self {
        if self.call_site.is_none() {
            self.call_site = call_site;
        }
        self
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Call site of the command that produced this error, when captured.
    pub fn call_site(&self) -> Option<&CallSite> {
        self.call_site.as_deref()
    }

    /// True for failures worth another attempt on a fresh connection.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self.status, Status::Connection | Status::NoResponse)
    }
}

impl From<CkvError> for Error {
    fn from(err: CkvError) -> Self {
        match err {
            CkvError::Decode(message) => Error::new(Status::ClientFailure, message),
            other => Error::param(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_status() {
        assert_eq!(Error::param("bad").kind(), ErrorKind::Param);
        assert_eq!(Error::connection("down").kind(), ErrorKind::Connection);
        assert_eq!(
            Error::new(Status::NoMoreConnections, "pool").kind(),
            ErrorKind::Io
        );
        assert_eq!(Error::new(Status::Timeout, "slow").kind(), ErrorKind::Io);
        assert_eq!(Error::new(Status::KeyNotFound, "gone").kind(), ErrorKind::Server);
    }

    #[test]
    fn display_includes_kind_status_and_message() {
        let err = Error::connection("failed to connect to cluster");
        assert_eq!(
            err.to_string(),
            "connection error CONNECTION(-10): failed to connect to cluster"
        );
    }

    #[test]
    fn call_site_is_attached_once() {
        let first = Arc::new(CallSite::capture(Location::caller()));
        let second = Arc::new(CallSite::capture(Location::caller()));
        let err = Error::param("bad")
            .with_call_site(Some(first.clone()))
            .with_call_site(Some(second));
        let site = err.call_site().unwrap();
        assert_eq!(site.location(), first.location());
        assert!(!site.backtrace().is_empty());
    }

    #[test]
    fn key_validation_maps_to_param() {
        let err: Error = CkvError::NamespaceEmpty.into();
        assert_eq!(err.kind(), ErrorKind::Param);
        assert_eq!(err.status(), Status::InvalidParam);
    }
}
