//! # Member Façade
//!
//! The per-member API handed to application code. Every inbound message goes
//! through the request manager of the peer that sent it; the manager decides
//! whether it answers a pending request or is unsolicited traffic for the
//! member's [`MessageHandler`].

use crate::controller::{Envelope, Shared};
use crate::descriptor::CommandDescriptor;
use crate::errors::BrokerError;
use crate::handle::Handle;
use crate::request_manager::{ReceiveFn, RequestManager, SendFn};
use crate::stats::BrokerStats;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Receives unsolicited messages addressed to a member.
#[async_trait]
pub trait MessageHandler<C>: Send + Sync {
    /// `sender` is the handle of the peer the message came from.
    async fn handle(&self, member: &Member<C>, sender: Handle, cmd: C);
}

#[async_trait]
impl<C, F, Fut> MessageHandler<C> for F
where
    C: Clone + Send + Sync + 'static,
    F: Fn(Member<C>, Handle, C) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, member: &Member<C>, sender: Handle, cmd: C) {
        (self)(member.clone(), sender, cmd).await;
    }
}

struct MemberInner<C> {
    handle: Handle,
    handler: Arc<dyn MessageHandler<C>>,
    controller: Weak<Shared<C>>,
    descriptor: CommandDescriptor<C>,
    request_timeout: Duration,
    stats: Arc<BrokerStats>,
    /// Lazily created, one per peer.
    managers: Mutex<HashMap<Handle, Arc<RequestManager<C>>>>,
    closed: AtomicBool,
}

/// Handle-addressed participant of a [`Broker`](crate::Broker).
///
/// Cheap to clone; all clones refer to the same registration.
pub struct Member<C> {
    inner: Arc<MemberInner<C>>,
}

impl<C> Clone for Member<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> Member<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        handle: Handle,
        handler: Arc<dyn MessageHandler<C>>,
        controller: &Arc<Shared<C>>,
    ) -> Self {
        Self {
            inner: Arc::new(MemberInner {
                handle,
                handler,
                controller: Arc::downgrade(controller),
                descriptor: controller.descriptor().clone(),
                request_timeout: controller.request_timeout(),
                stats: Arc::clone(controller.stats()),
                managers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Requests this member is still waiting on, across all peers.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        let managers: Vec<_> = self.inner.managers.lock().values().cloned().collect();
        managers.iter().map(|m| m.pending_count()).sum()
    }

    /// Enqueue `cmd` for `receiver`. Waits only for queue space; there is no
    /// delivery confirmation.
    pub async fn send(&self, receiver: Handle, cmd: C) {
        if self.is_closed() {
            trace!(member = %self.handle(), "Send from closed member dropped");
            return;
        }
        let Some(controller) = self.inner.controller.upgrade() else {
            return;
        };
        controller
            .enqueue(Envelope {
                command: cmd,
                sender: self.handle(),
                receiver,
            })
            .await;
    }

    /// Receive broadcasts of the given command types; `0` means every type.
    pub fn subscribe(&self, types: &[u32]) {
        if self.is_closed() {
            return;
        }
        if let Some(controller) = self.inner.controller.upgrade() {
            controller.subscribe(self.handle(), types);
        }
    }

    pub fn unsubscribe(&self, types: &[u32]) {
        if let Some(controller) = self.inner.controller.upgrade() {
            controller.unsubscribe(self.handle(), types);
        }
    }

    /// Send `cmd` to `receiver` and wait for the first response.
    ///
    /// # Panics
    ///
    /// If `receiver` is [`Handle::ANY`]; a request needs a destination.
    pub async fn request(&self, receiver: Handle, cmd: C) -> Result<C, BrokerError> {
        assert!(!receiver.is_any(), "request must have a receiver");
        self.manager(receiver)?.request(cmd).await
    }

    /// Send `cmd` to `receiver` and feed every correlated response to
    /// `handler` until it returns `true`, the request times out, or this
    /// member closes.
    ///
    /// # Panics
    ///
    /// Under the same condition as [`Member::request`].
    pub async fn request_multiple<H>(&self, receiver: Handle, cmd: C, mut handler: H)
    where
        H: FnMut(Result<C, BrokerError>) -> bool + Send + 'static,
    {
        assert!(!receiver.is_any(), "request must have a receiver");
        match self.manager(receiver) {
            Ok(manager) => manager.request_multiple(cmd, handler).await,
            Err(err) => {
                handler(Err(err));
            }
        }
    }

    /// Deregister from the broker and fail every outstanding request with
    /// [`BrokerError::MemberClosed`]. The handle may then be reused.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(controller) = self.inner.controller.upgrade() {
            controller.remove_member(self);
        }

        // Managers created after this drain see `closed` and are refused.
        let managers: Vec<_> = self.inner.managers.lock().drain().map(|(_, m)| m).collect();
        let err = self.closed_error();
        let cancelled: usize = managers.iter().map(|m| m.cancel_all(&err)).sum();
        debug!(member = %self.handle(), cancelled, "Member closed");
    }

    pub(crate) fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Entry point used by the dispatch loop.
    pub(crate) async fn deliver(&self, sender: Handle, cmd: C) {
        if self.is_closed() {
            trace!(member = %self.handle(), sender = %sender, "Delivery to closed member ignored");
            return;
        }
        match self.route(sender, &cmd) {
            Ok(manager) => manager.accept(cmd).await,
            Err(_) => {
                trace!(member = %self.handle(), sender = %sender, "Delivery raced with close");
            }
        }
    }

    /// Pick the manager an inbound message belongs to.
    ///
    /// A response to a request addressed to a type group comes back from a
    /// concrete instance, so the group's manager is consulted when the exact
    /// sender's manager is not waiting on the reference.
    fn route(&self, sender: Handle, cmd: &C) -> Result<Arc<RequestManager<C>>, BrokerError> {
        let group = Handle::of_type(sender.type_id());
        let reference = self.inner.descriptor.reference(cmd);

        if !reference.is_any() && !sender.is_type_wildcard() && !group.is_any() {
            // Clone out first: is_pending takes the manager's own lock.
            let (exact, grouped) = {
                let managers = self.inner.managers.lock();
                (managers.get(&sender).cloned(), managers.get(&group).cloned())
            };
            let exact_pending = exact.as_ref().is_some_and(|m| m.is_pending(reference));
            if !exact_pending {
                if let Some(grouped) = grouped.filter(|m| m.is_pending(reference)) {
                    return Ok(grouped);
                }
            }
        }

        self.manager(sender)
    }

    /// The manager for `peer`, created on first use.
    ///
    /// Fails once the member is closed. The flag is read under the managers
    /// lock, so a manager is either refused here or drained by `close`.
    fn manager(&self, peer: Handle) -> Result<Arc<RequestManager<C>>, BrokerError> {
        let mut managers = self.inner.managers.lock();
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if let Some(manager) = managers.get(&peer) {
            return Ok(Arc::clone(manager));
        }
        let manager = Arc::new(self.new_manager(peer));
        managers.insert(peer, Arc::clone(&manager));
        Ok(manager)
    }

    fn new_manager(&self, peer: Handle) -> RequestManager<C> {
        let weak_sender = Arc::downgrade(&self.inner);
        let sender: SendFn<C> = Arc::new(move |cmd: C| {
            let member = weak_sender.upgrade().map(|inner| Member { inner });
            async move {
                if let Some(member) = member {
                    member.send(peer, cmd).await;
                }
            }
            .boxed()
        });

        let weak_receiver = Arc::downgrade(&self.inner);
        let receiver: ReceiveFn<C> = Arc::new(move |cmd: C| {
            let member = weak_receiver.upgrade().map(|inner| Member { inner });
            async move {
                if let Some(member) = member {
                    let handler = Arc::clone(&member.inner.handler);
                    handler.handle(&member, peer, cmd).await;
                }
            }
            .boxed()
        });

        RequestManager::new(
            self.handle(),
            peer,
            self.inner.descriptor.clone(),
            self.inner.request_timeout,
            sender,
            receiver,
        )
        .with_stats(Arc::clone(&self.inner.stats))
    }

    fn closed_error(&self) -> BrokerError {
        BrokerError::MemberClosed {
            member: self.handle(),
        }
    }
}

impl<C> std::fmt::Debug for Member<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("handle", &self.inner.handle)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
