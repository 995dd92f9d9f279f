//! # Request Manager
//!
//! Correlation table for one (local member, peer) pair.
//!
//! ## Record Lifecycle
//!
//! ```text
//!  request_multiple()          accept(ref == key)
//! ─────────────────▶ Pending ───────────────────▶ Responding ──┐
//!        │              │                            │   ▲     │ handler
//!        │ key in use   │ deadline passed            │   └─────┘ returned false
//!        ▼              ▼                            ▼
//!    Conflict        TimedOut ◀──────────────── Completed (handler returned true)
//! ```
//!
//! ## Locking
//!
//! No lock is held while a callback runs, so callbacks may call back into the
//! manager or the owning member. A callback is taken out of its record for the
//! duration of a call; outcomes arriving meanwhile queue up on the record and
//! are handed to it in order by the invocation in progress.
//!
//! A record lock may be held while taking the table lock, never the reverse.
//! A single-shot request frees its key before its waiter is woken, so the
//! caller can immediately reuse it.

use crate::descriptor::CommandDescriptor;
use crate::errors::BrokerError;
use crate::handle::Handle;
use crate::stats::BrokerStats;
use futures::future::BoxFuture;
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

/// Completion callback of a request.
///
/// Receives every correlated response (or the terminal error) and returns
/// `true` once the request is fully satisfied.
pub type ResponseHandler<C> = Box<dyn FnMut(Result<C, BrokerError>) -> bool + Send>;

/// Injected function delivering an outbound request to the peer.
pub type SendFn<C> = Arc<dyn Fn(C) -> BoxFuture<'static, ()> + Send + Sync>;

/// Injected function receiving inbound messages that correlate to nothing.
pub type ReceiveFn<C> = Arc<dyn Fn(C) -> BoxFuture<'static, ()> + Send + Sync>;

enum Callback<C> {
    /// `request`: the first outcome is terminal.
    Once(oneshot::Sender<Result<C, BrokerError>>),
    /// `request_multiple`: runs until the handler returns `true`.
    Stream(ResponseHandler<C>),
}

impl<C> Callback<C> {
    fn fail(self, err: BrokerError) {
        match self {
            Self::Once(tx) => {
                let _ = tx.send(Err(err));
            }
            Self::Stream(mut handler) => {
                handler(Err(err));
            }
        }
    }
}

struct PendingRequest<C> {
    key: Handle,
    state: Mutex<RequestState<C>>,
}

struct RequestState<C> {
    deadline: Instant,
    /// `None` while the callback is being invoked.
    callback: Option<Callback<C>>,
    /// Outcomes that arrived while the callback was busy.
    backlog: VecDeque<Result<C, BrokerError>>,
    finished: bool,
}

struct ActiveTable<C> {
    requests: HashMap<Handle, Arc<PendingRequest<C>>>,
    /// Set by `cancel_all`; every later request fails with it.
    closed: Option<BrokerError>,
}

enum DeadlineCheck {
    Stale,
    Extended(Instant),
    Expired,
}

/// Per-peer request/response correlation.
pub struct RequestManager<C> {
    owner: Handle,
    peer: Handle,
    active: Mutex<ActiveTable<C>>,
    descriptor: CommandDescriptor<C>,
    sender: SendFn<C>,
    receiver: ReceiveFn<C>,
    timeout: Duration,
    stats: Arc<BrokerStats>,
}

impl<C> RequestManager<C>
where
    C: Send + 'static,
{
    /// Create a manager for requests from `owner` to `peer`.
    ///
    /// `sender` is awaited once per accepted request. `receiver` is awaited
    /// for every inbound message that does not answer an active request.
    pub fn new(
        owner: Handle,
        peer: Handle,
        descriptor: CommandDescriptor<C>,
        timeout: Duration,
        sender: SendFn<C>,
        receiver: ReceiveFn<C>,
    ) -> Self {
        Self {
            owner,
            peer,
            active: Mutex::new(ActiveTable {
                requests: HashMap::new(),
                closed: None,
            }),
            descriptor,
            sender,
            receiver,
            timeout,
            stats: Arc::new(BrokerStats::default()),
        }
    }

    /// Share counters with the owning broker.
    #[must_use]
    pub(crate) fn with_stats(mut self, stats: Arc<BrokerStats>) -> Self {
        self.stats = stats;
        self
    }

    #[must_use]
    pub fn peer(&self) -> Handle {
        self.peer
    }

    /// Number of requests currently awaiting a terminal response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.active.lock().requests.len()
    }

    /// Whether a request keyed `key` is in flight.
    #[must_use]
    pub fn is_pending(&self, key: Handle) -> bool {
        self.active.lock().requests.contains_key(&key)
    }

    /// Send `request` and wait for its first response or error.
    pub async fn request(self: &Arc<Self>, request: C) -> Result<C, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.start(request, Callback::Once(tx)).await;
        rx.await
            .unwrap_or(Err(BrokerError::MemberClosed { member: self.owner }))
    }

    /// Register `request` and send it to the peer.
    ///
    /// If its key is already in flight, `handler` is invoked immediately with
    /// [`BrokerError::HandleConflict`] and nothing is sent. The key is
    /// released once `handler` returns `true`.
    pub async fn request_multiple<H>(self: &Arc<Self>, request: C, handler: H)
    where
        H: FnMut(Result<C, BrokerError>) -> bool + Send + 'static,
    {
        self.start(request, Callback::Stream(Box::new(handler)))
            .await;
    }

    async fn start(self: &Arc<Self>, request: C, callback: Callback<C>) {
        let key = self.descriptor.id(&request);
        let record = Arc::new(PendingRequest {
            key,
            state: Mutex::new(RequestState {
                deadline: Instant::now() + self.timeout,
                callback: Some(callback),
                backlog: VecDeque::new(),
                finished: false,
            }),
        });

        let rejection = {
            let mut table = self.active.lock();
            match (table.closed.clone(), table.requests.entry(key)) {
                (Some(err), _) => Some(err),
                (None, Entry::Occupied(_)) => Some(BrokerError::HandleConflict { key }),
                (None, Entry::Vacant(slot)) => {
                    slot.insert(Arc::clone(&record));
                    None
                }
            }
        };

        if let Some(err) = rejection {
            if err.is_conflict() {
                BrokerStats::incr(&self.stats.request_conflicts);
                warn!(
                    owner = %self.owner,
                    peer = %self.peer,
                    key = %key,
                    "Rejected request with correlation key already in flight"
                );
            }
            let callback = {
                let mut state = record.state.lock();
                state.finished = true;
                state.callback.take()
            };
            if let Some(callback) = callback {
                callback.fail(err);
            }
            return;
        }

        BrokerStats::incr(&self.stats.requests_started);
        debug!(owner = %self.owner, peer = %self.peer, key = %key, "Request registered");

        tokio::spawn(Arc::clone(self).watch_deadline(record));
        (self.sender)(request).await;
    }

    /// Route an inbound message from the peer.
    ///
    /// Responses to an active request go to that request's callback; anything
    /// else goes to the receiver function.
    pub async fn accept(&self, msg: C) {
        let reference = self.descriptor.reference(&msg);
        let unmatched = if reference.is_any() {
            vec![msg]
        } else {
            self.try_complete(reference, msg)
        };

        for msg in unmatched {
            BrokerStats::incr(&self.stats.unsolicited_messages);
            trace!(owner = %self.owner, peer = %self.peer, "Unsolicited message");
            (self.receiver)(msg).await;
        }
    }

    /// Fail every active request with `err`, and every later one as well.
    /// Returns how many were failed.
    pub fn cancel_all(&self, err: &BrokerError) -> usize {
        let drained: Vec<_> = {
            let mut table = self.active.lock();
            table.closed = Some(err.clone());
            table.requests.drain().map(|(_, r)| r).collect()
        };

        let mut cancelled = 0;
        for record in &drained {
            let state = record.state.lock();
            if state.finished {
                continue;
            }
            cancelled += 1;
            BrokerStats::incr(&self.stats.requests_cancelled);
            Self::terminate(state, err.clone());
        }

        if cancelled > 0 {
            debug!(
                owner = %self.owner,
                peer = %self.peer,
                cancelled,
                "Cancelled pending requests"
            );
        }
        cancelled
    }

    /// Returns the messages that turned out not to belong to an active request.
    fn try_complete(&self, key: Handle, msg: C) -> Vec<C> {
        let record = self.active.lock().requests.get(&key).cloned();
        let Some(record) = record else {
            return vec![msg];
        };

        let mut state = record.state.lock();
        if state.finished {
            return vec![msg];
        }
        let handler = match state.callback.take() {
            None => {
                state.backlog.push_back(Ok(msg));
                return Vec::new();
            }
            Some(Callback::Once(tx)) => {
                state.finished = true;
                self.release(&record);
                drop(state);
                self.record_completed(key);
                let _ = tx.send(Ok(msg));
                return Vec::new();
            }
            Some(Callback::Stream(handler)) => handler,
        };
        drop(state);

        self.run_handler(&record, handler, Ok(msg))
    }

    /// Invoke `handler` with `first`, then with anything queued meanwhile.
    fn run_handler(
        &self,
        record: &Arc<PendingRequest<C>>,
        mut handler: ResponseHandler<C>,
        first: Result<C, BrokerError>,
    ) -> Vec<C> {
        let mut outcome = first;
        loop {
            let terminal = outcome.is_err();
            let done = handler(outcome) || terminal;

            let mut state = record.state.lock();
            if done {
                let ended_elsewhere = std::mem::replace(&mut state.finished, true);
                if !ended_elsewhere {
                    self.release(record);
                }
                let leftovers: Vec<C> = state.backlog.drain(..).filter_map(Result::ok).collect();
                drop(state);
                if !ended_elsewhere {
                    self.record_completed(record.key);
                }
                return leftovers;
            }

            if !state.finished {
                state.deadline = Instant::now() + self.timeout;
                trace!(owner = %self.owner, peer = %self.peer, key = %record.key, "Partial response");
            }
            match state.backlog.pop_front() {
                Some(next) => outcome = next,
                None => {
                    state.callback = Some(Callback::Stream(handler));
                    return Vec::new();
                }
            }
        }
    }

    /// Mark the record finished and hand `err` to its callback, either now or
    /// through the invocation currently in progress.
    fn terminate(mut state: MutexGuard<'_, RequestState<C>>, err: BrokerError) {
        state.finished = true;
        match state.callback.take() {
            None => state.backlog.push_back(Err(err)),
            Some(callback) => {
                drop(state);
                callback.fail(err);
            }
        }
    }

    /// Drop `record` from the table unless its key already belongs to a newer one.
    fn release(&self, record: &Arc<PendingRequest<C>>) {
        let mut table = self.active.lock();
        let is_current = table
            .requests
            .get(&record.key)
            .is_some_and(|current| Arc::ptr_eq(current, record));
        if is_current {
            table.requests.remove(&record.key);
        }
    }

    fn record_completed(&self, key: Handle) {
        BrokerStats::incr(&self.stats.requests_completed);
        debug!(owner = %self.owner, peer = %self.peer, key = %key, "Request completed");
    }

    async fn watch_deadline(self: Arc<Self>, record: Arc<PendingRequest<C>>) {
        let mut wake_at = record.state.lock().deadline;
        loop {
            sleep_until(wake_at).await;
            match self.check_deadline(&record) {
                DeadlineCheck::Stale | DeadlineCheck::Expired => return,
                DeadlineCheck::Extended(deadline) => wake_at = deadline,
            }
        }
    }

    fn check_deadline(&self, record: &Arc<PendingRequest<C>>) -> DeadlineCheck {
        let state = record.state.lock();
        if state.finished {
            return DeadlineCheck::Stale;
        }
        if Instant::now() < state.deadline {
            return DeadlineCheck::Extended(state.deadline);
        }

        self.release(record);
        BrokerStats::incr(&self.stats.requests_timed_out);
        warn!(
            owner = %self.owner,
            peer = %self.peer,
            key = %record.key,
            timeout_ms = self.timeout.as_millis(),
            "Request timed out"
        );
        Self::terminate(
            state,
            BrokerError::RequestTimeout {
                key: record.key,
                timeout: self.timeout,
            },
        );
        DeadlineCheck::Expired
    }
}
