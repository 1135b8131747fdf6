//! # Status Codes
//!
//! Integer result codes shared by nodes and the driver. Non-negative codes
//! originate on a node; negative codes are produced client-side.

use std::fmt;

/// Result code attached to every command outcome and batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation succeeded.
    Ok,
    /// Generic node-side failure.
    ServerFailure,
    /// Record does not exist.
    KeyNotFound,
    /// Node rejected the request arguments.
    BadRequest,
    /// Operation exceeded its total timeout.
    Timeout,
    /// Record exists but did not satisfy the filter expression.
    FilteredOut,
    /// Generic client-side failure.
    ClientFailure,
    /// Caller supplied an invalid argument or policy.
    InvalidParam,
    /// No node is available for the request.
    InvalidNode,
    /// Connection pool for the node has no capacity.
    NoMoreConnections,
    /// Connection could not be established or is closed.
    Connection,
    /// Node did not answer for this item.
    NoResponse,
    /// Any code this build does not know about.
    Other(i32),
}

impl Status {
    /// Returns the integer code used on the wire.
    pub const fn code(&self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::ServerFailure => 1,
            Status::KeyNotFound => 2,
            Status::BadRequest => 4,
            Status::Timeout => 9,
            Status::FilteredOut => 27,
            Status::ClientFailure => -1,
            Status::InvalidParam => -2,
            Status::InvalidNode => -3,
            Status::NoMoreConnections => -7,
            Status::Connection => -10,
            Status::NoResponse => -15,
            Status::Other(code) => *code,
        }
    }

    /// Maps a wire code back to a status.
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Status::Ok,
            1 => Status::ServerFailure,
            2 => Status::KeyNotFound,
            4 => Status::BadRequest,
            9 => Status::Timeout,
            27 => Status::FilteredOut,
            -1 => Status::ClientFailure,
            -2 => Status::InvalidParam,
            -3 => Status::InvalidNode,
            -7 => Status::NoMoreConnections,
            -10 => Status::Connection,
            -15 => Status::NoResponse,
            other => Status::Other(other),
        }
    }

    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// True for codes a node returns (as opposed to client-side codes).
    #[inline]
    pub const fn is_server(&self) -> bool {
        self.code() > 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::ServerFailure => "SERVER_FAILURE",
            Status::KeyNotFound => "KEY_NOT_FOUND",
            Status::BadRequest => "BAD_REQUEST",
            Status::Timeout => "TIMEOUT",
            Status::FilteredOut => "FILTERED_OUT",
            Status::ClientFailure => "CLIENT_FAILURE",
            Status::InvalidParam => "INVALID_PARAM",
            Status::InvalidNode => "INVALID_NODE",
            Status::NoMoreConnections => "NO_MORE_CONNECTIONS",
            Status::Connection => "CONNECTION",
            Status::NoResponse => "NO_RESPONSE",
            Status::Other(_) => "UNKNOWN",
        };
        write!(f, "{}({})", name, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_back_to_status() {
        for status in [
            Status::Ok,
            Status::KeyNotFound,
            Status::FilteredOut,
            Status::NoMoreConnections,
            Status::Connection,
        ] {
            assert_eq!(Status::from_code(status.code()), status);
        }
        assert_eq!(Status::from_code(1234), Status::Other(1234));
    }

    #[test]
    fn server_codes_are_positive() {
        assert!(Status::KeyNotFound.is_server());
        assert!(!Status::Ok.is_server());
        assert!(Status::Timeout.is_server());
        assert!(!Status::InvalidParam.is_server());
    }
}
