//! Broker statistics.
//!
//! One `BrokerStats` is owned by the controller and shared with every member
//! and request manager it creates.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters.
#[derive(Debug, Default)]
pub struct BrokerStats {
    /// Envelopes accepted onto the queue
    pub messages_enqueued: AtomicU64,
    /// Envelopes pulled off the queue by the dispatch loop
    pub messages_dispatched: AtomicU64,
    /// Individual member deliveries spawned
    pub deliveries: AtomicU64,
    /// Envelopes that reached no member, or were refused after close
    pub messages_dropped: AtomicU64,
    /// Requests registered
    pub requests_started: AtomicU64,
    /// Requests completed by a terminal response
    pub requests_completed: AtomicU64,
    /// Requests that hit their deadline
    pub requests_timed_out: AtomicU64,
    /// Requests rejected because the key was in flight
    pub request_conflicts: AtomicU64,
    /// Requests failed because their member closed
    pub requests_cancelled: AtomicU64,
    /// Inbound messages handed to a member's message handler
    pub unsolicited_messages: AtomicU64,
}

impl BrokerStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_enqueued: self.messages_enqueued.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            requests_started: self.requests_started.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            request_conflicts: self.request_conflicts.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            unsolicited_messages: self.unsolicited_messages.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`BrokerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_enqueued: u64,
    pub messages_dispatched: u64,
    pub deliveries: u64,
    pub messages_dropped: u64,
    pub requests_started: u64,
    pub requests_completed: u64,
    pub requests_timed_out: u64,
    pub request_conflicts: u64,
    pub requests_cancelled: u64,
    pub unsolicited_messages: u64,
}

impl StatsSnapshot {
    /// Requests neither completed, timed out nor cancelled.
    #[must_use]
    pub fn requests_in_flight(&self) -> u64 {
        self.requests_started.saturating_sub(
            self.requests_completed + self.requests_timed_out + self.requests_cancelled,
        )
    }
}
