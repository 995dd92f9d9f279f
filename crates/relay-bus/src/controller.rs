//! # Controller
//!
//! Owns the member registry, the subscription index and the dispatch queue.
//!
//! ## Routing
//!
//! ```text
//! receiver.seq_id != 0 ──▶ that member only (dropped if unknown)
//!
//! receiver.seq_id == 0 ──▶ subscribers of cmd type ∪ subscribers of type 0
//!                          (each member at most once)
//!                     └──▶ receiver.type_id != 0 and no member of that type
//!                          reached: one random registered member of that type
//! ```
//!
//! Envelopes leave the queue in order, but every delivery runs as its own
//! task. Two messages to the same member may therefore be handled out of order.

use crate::config::BrokerConfig;
use crate::descriptor::CommandDescriptor;
use crate::errors::BrokerError;
use crate::handle::Handle;
use crate::member::{Member, MessageHandler};
use crate::stats::{BrokerStats, StatsSnapshot};
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, Instrument};

/// A command in transit. Consumed exactly once by the dispatch loop.
#[derive(Debug, Clone)]
pub struct Envelope<C> {
    pub command: C,
    pub sender: Handle,
    pub receiver: Handle,
}

struct Registry<C> {
    members: HashMap<Handle, Member<C>>,
    /// Command type id (0 = every type) to subscribed member handles.
    subscriptions: HashMap<u32, HashSet<Handle>>,
}

impl<C: Clone + Send + Sync + 'static> Registry<C> {
    fn route(&self, descriptor: &CommandDescriptor<C>, envelope: &Envelope<C>) -> Vec<Member<C>> {
        let receiver = envelope.receiver;
        if !receiver.is_type_wildcard() {
            return self.members.get(&receiver).cloned().into_iter().collect();
        }

        let mut targets = Vec::new();
        let mut reached = HashSet::new();
        let mut reached_types = HashSet::new();

        for topic in [descriptor.type_id(&envelope.command), 0] {
            let Some(subscribers) = self.subscriptions.get(&topic) else {
                continue;
            };
            for handle in subscribers {
                if !reached.insert(*handle) {
                    continue;
                }
                if let Some(member) = self.members.get(handle) {
                    reached_types.insert(handle.type_id());
                    targets.push(member.clone());
                }
            }
        }

        let group = receiver.type_id();
        if group != 0 && !reached_types.contains(&group) {
            let fallback = self
                .members
                .values()
                .filter(|member| member.handle().type_id() == group)
                .choose(&mut rand::thread_rng());
            if let Some(member) = fallback {
                targets.push(member.clone());
            }
        }

        targets
    }
}

pub(crate) struct Shared<C> {
    descriptor: CommandDescriptor<C>,
    config: BrokerConfig,
    registry: RwLock<Registry<C>>,
    queue: Mutex<Option<mpsc::Sender<Envelope<C>>>>,
    closed: AtomicBool,
    stats: Arc<BrokerStats>,
}

impl<C> Shared<C> {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the last sender lets the loop drain what is queued, then stop.
        self.queue.lock().take();
        info!("Broker closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<C: Clone + Send + Sync + 'static> Shared<C> {
    pub(crate) fn descriptor(&self) -> &CommandDescriptor<C> {
        &self.descriptor
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    pub(crate) fn stats(&self) -> &Arc<BrokerStats> {
        &self.stats
    }

    /// Waits for queue space. Silently drops the envelope once closed.
    pub(crate) async fn enqueue(&self, envelope: Envelope<C>) {
        let queue = self.queue.lock().clone();
        let Some(queue) = queue else {
            BrokerStats::incr(&self.stats.messages_dropped);
            trace!(sender = %envelope.sender, receiver = %envelope.receiver, "Send after close dropped");
            return;
        };

        match queue.send(envelope).await {
            Ok(()) => BrokerStats::incr(&self.stats.messages_enqueued),
            Err(_) => BrokerStats::incr(&self.stats.messages_dropped),
        }
    }

    pub(crate) fn subscribe(&self, member: Handle, types: &[u32]) {
        if self.is_closed() {
            return;
        }
        let mut registry = self.registry.write();
        for type_id in types {
            registry
                .subscriptions
                .entry(*type_id)
                .or_default()
                .insert(member);
        }
        debug!(member = %member, types = ?types, "Subscribed");
    }

    pub(crate) fn unsubscribe(&self, member: Handle, types: &[u32]) {
        let mut registry = self.registry.write();
        for type_id in types {
            if let Some(set) = registry.subscriptions.get_mut(type_id) {
                set.remove(&member);
                if set.is_empty() {
                    registry.subscriptions.remove(type_id);
                }
            }
        }
        debug!(member = %member, types = ?types, "Unsubscribed");
    }

    /// Deregister `member` if it is still the registered instance for its handle.
    pub(crate) fn remove_member(&self, member: &Member<C>) {
        let handle = member.handle();
        let mut registry = self.registry.write();
        let is_current = registry
            .members
            .get(&handle)
            .is_some_and(|current| current.same_instance(member));
        if !is_current {
            return;
        }

        registry.members.remove(&handle);
        registry.subscriptions.retain(|_, set| {
            set.remove(&handle);
            !set.is_empty()
        });
        debug!(member = %handle, "Member removed");
    }

    fn dispatch(&self, envelope: Envelope<C>) {
        BrokerStats::incr(&self.stats.messages_dispatched);

        let targets = self.registry.read().route(&self.descriptor, &envelope);
        if targets.is_empty() {
            BrokerStats::incr(&self.stats.messages_dropped);
            debug!(
                sender = %envelope.sender,
                receiver = %envelope.receiver,
                "No member matched, message dropped"
            );
            return;
        }

        let sender = envelope.sender;
        for member in targets {
            BrokerStats::incr(&self.stats.deliveries);
            trace!(sender = %sender, member = %member.handle(), "Delivering");
            let command = envelope.command.clone();
            tokio::spawn(async move { member.deliver(sender, command).await });
        }
    }
}

async fn run_dispatcher<C>(shared: Arc<Shared<C>>, mut queue: mpsc::Receiver<Envelope<C>>)
where
    C: Clone + Send + Sync + 'static,
{
    debug!("Dispatch loop started");
    while let Some(envelope) = queue.recv().await {
        shared.dispatch(envelope);
    }
    debug!("Dispatch loop drained and stopped");
}

/// In-process message broker.
///
/// Must be created inside a tokio runtime: construction spawns the dispatch
/// loop. Dropping the broker closes it.
pub struct Broker<C> {
    shared: Arc<Shared<C>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<C> Broker<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Create a broker with the given fixed request timeout.
    pub fn new(descriptor: CommandDescriptor<C>, request_timeout: Duration) -> Self {
        Self::with_config(
            descriptor,
            BrokerConfig::default().with_request_timeout(request_timeout),
        )
    }

    pub fn with_config(descriptor: CommandDescriptor<C>, config: BrokerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        info!(
            request_timeout_ms = config.request_timeout.as_millis(),
            queue_capacity = config.queue_capacity,
            "Starting broker"
        );

        let shared = Arc::new(Shared {
            descriptor,
            config,
            registry: RwLock::new(Registry {
                members: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
            queue: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            stats: Arc::new(BrokerStats::default()),
        });

        let dispatcher = tokio::spawn(
            run_dispatcher(Arc::clone(&shared), rx).instrument(info_span!("relay_dispatch")),
        );

        Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Register a member. Visible to the very next dispatch.
    ///
    /// # Errors
    ///
    /// - `InvalidMemberHandle` - `handle.seq_id()` is zero
    /// - `MemberExists` - a live member already uses `handle`
    /// - `BrokerClosed` - the broker was closed
    pub fn add_member<H>(&self, handle: Handle, handler: H) -> Result<Member<C>, BrokerError>
    where
        H: MessageHandler<C> + 'static,
    {
        if handle.is_type_wildcard() {
            return Err(BrokerError::InvalidMemberHandle(handle));
        }
        if self.shared.is_closed() {
            return Err(BrokerError::BrokerClosed);
        }

        let mut registry = self.shared.registry.write();
        if registry.members.contains_key(&handle) {
            return Err(BrokerError::MemberExists(handle));
        }

        let member = Member::new(handle, Arc::new(handler), &self.shared);
        registry.members.insert(handle, member.clone());
        debug!(member = %handle, "Member added");
        Ok(member)
    }

    /// Stop accepting work. Already queued envelopes are still dispatched.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Close and wait until the dispatch loop has drained the queue.
    pub async fn shutdown(&self) {
        self.close();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.shared.registry.read().members.len()
    }

    #[must_use]
    pub fn is_registered(&self, handle: Handle) -> bool {
        self.shared.registry.read().members.contains_key(&handle)
    }

    /// Members subscribed to `type_id`, sorted.
    #[must_use]
    pub fn subscribers(&self, type_id: u32) -> Vec<Handle> {
        let registry = self.shared.registry.read();
        let mut handles: Vec<_> = registry
            .subscriptions
            .get(&type_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        handles.sort();
        handles
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl<C> Drop for Broker<C> {
    fn drop(&mut self) {
        self.shared.close();
    }
}
