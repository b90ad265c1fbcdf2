//! The unit of work: one client request tracked to its terminal result.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::request::{OperationKind, Request};
use crate::result::ResultCode;

/// Connection identifier assigned by the connection registry. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// LDAP message id, assigned by the client and unique per connection while in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One client request.
///
/// Everything except the cancel flag and the terminal result code is fixed at
/// construction. The result code moves from pending to terminal exactly once;
/// later attempts are refused.
#[derive(Debug)]
pub struct Operation {
    connection_id: ConnectionId,
    message_id: MessageId,
    request: Request,
    enqueued_at: Instant,
    cancelled: AtomicBool,
    result: OnceLock<ResultCode>,
}

impl Operation {
    #[must_use]
    pub fn new(connection_id: ConnectionId, message_id: MessageId, request: Request) -> Self {
        Self {
            connection_id,
            message_id,
            request,
            enqueued_at: Instant::now(),
            cancelled: AtomicBool::new(false),
            result: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.request.kind()
    }

    #[must_use]
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Time since the operation was received.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Flags the operation as cancelled. Returns true on the first call.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Backends check this at call boundaries and stop early when set.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Records the terminal result code. Returns false if one was already recorded.
    pub fn complete(&self, code: ResultCode) -> bool {
        self.result.set(code).is_ok()
    }

    /// `None` while pending.
    #[must_use]
    pub fn result_code(&self) -> Option<ResultCode> {
        self.result.get().copied()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.result.get().is_some()
    }
}
