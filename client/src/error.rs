use thiserror::Error;

use tether_shared::Oid;

/// A failure to establish a session. `still_in_progress` failures are
/// advisory: the logon attempt is continuing on a fallback strategy (for
/// example the next configured port) and the caller should keep waiting
/// rather than retry `logon()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to logon [code={code}, in_progress={still_in_progress}]")]
pub struct LogonError {
    pub code: String,
    pub still_in_progress: bool,
}

impl LogonError {
    pub fn terminal(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            still_in_progress: false,
        }
    }

    pub fn transient(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            still_in_progress: true,
        }
    }
}

/// A failure to access a distributed object, reported only to the
/// subscriber(s) that asked for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectAccessError {
    /// The oid was locally invalid; no request was made.
    #[error("invalid oid {oid}")]
    InvalidOid { oid: Oid },

    /// The server refused the subscription.
    #[error("cannot access object {oid}: {reason}")]
    AccessDenied { oid: Oid, reason: String },

    /// The session ended while the subscription was outstanding.
    #[error("connection closed with subscription to {oid} outstanding")]
    ConnectionClosed { oid: Oid },
}

/// Local misuse of the client API, rejected synchronously without touching
/// the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("already connecting or connected")]
    AlreadyConnected,

    #[error("no credentials configured")]
    MissingCredentials,

    #[error("no server configured")]
    MissingServer,
}
