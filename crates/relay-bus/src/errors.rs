//! # Error Types
//!
//! Correlation failures travel through the same callback as successful
//! responses. Dispatch-level failures (unknown receiver, closed broker) are
//! silent and never produce one of these.

use crate::handle::Handle;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by the broker and its request managers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// A request with the same correlation key is still in flight to this peer.
    #[error("Request {key} is still in processing")]
    HandleConflict { key: Handle },

    /// No terminal response arrived before the deadline.
    #[error("Request {key} timed out after {timeout:?}")]
    RequestTimeout { key: Handle, timeout: Duration },

    /// The requesting member was closed while the request was pending.
    #[error("Member {member} closed with request pending")]
    MemberClosed { member: Handle },

    /// Member handles need a non-zero sequence id.
    #[error("Invalid member handle {0}: sequence id must be non-zero")]
    InvalidMemberHandle(Handle),

    /// Another live member already owns this handle.
    #[error("Member {0} is already registered")]
    MemberExists(Handle),

    /// The broker no longer accepts members.
    #[error("Broker closed")]
    BrokerClosed,
}

impl BrokerError {
    /// True for [`BrokerError::RequestTimeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// True for [`BrokerError::HandleConflict`].
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::HandleConflict { .. })
    }
}
