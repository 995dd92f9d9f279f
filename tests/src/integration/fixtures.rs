//! Shared test fixtures: a correlated command type and canned members.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{ready, Ready};
use relay_bus::{Broker, CommandDescriptor, Correlated, Handle, Member};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// Type id of command ids minted by the service fixtures.
pub const REPLY_TYPE: u32 = 99;

/// Minimal command: identity, optional reference and a numeric body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: Handle,
    pub reference: Handle,
    pub body: u64,
}

impl Correlated for Command {
    fn id(&self) -> Handle {
        self.id
    }

    fn reference(&self) -> Handle {
        self.reference
    }
}

impl Command {
    /// A fresh command that answers nothing.
    pub fn new(id: Handle, body: u64) -> Self {
        Self {
            id,
            reference: Handle::ANY,
            body,
        }
    }

    /// A response to `self`.
    pub fn reply(&self, id: Handle, body: u64) -> Self {
        Self {
            id,
            reference: self.id,
            body,
        }
    }
}

/// Hands out reply ids of [`REPLY_TYPE`].
#[derive(Clone, Default)]
pub struct ReplyIds(Arc<AtomicU32>);

impl ReplyIds {
    pub fn next(&self) -> Handle {
        Handle::new(REPLY_TYPE, self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

pub fn broker(request_timeout: Duration) -> Broker<Command> {
    Broker::new(CommandDescriptor::from_trait(), request_timeout)
}

/// Message handler that drops everything.
pub fn silent(_: Member<Command>, _: Handle, _: Command) -> Ready<()> {
    ready(())
}

/// Member whose every unsolicited delivery lands in the returned channel.
pub fn add_recorder(
    broker: &Broker<Command>,
    handle: Handle,
) -> (Member<Command>, UnboundedReceiver<(Handle, Command)>) {
    let (tx, rx) = unbounded_channel();
    let member = broker
        .add_member(
            handle,
            move |_member: Member<Command>, sender: Handle, cmd: Command| {
                let _ = tx.send((sender, cmd));
                ready(())
            },
        )
        .unwrap_or_else(|e| panic!("recorder {handle}: {e}"));
    (member, rx)
}

/// Service answering each command once with `body + 1`.
pub fn add_incrementer(broker: &Broker<Command>, handle: Handle) -> Member<Command> {
    let ids = ReplyIds::default();
    broker
        .add_member(
            handle,
            move |member: Member<Command>, sender: Handle, cmd: Command| {
                let reply = cmd.reply(ids.next(), cmd.body + 1);
                async move { member.send(sender, reply).await }
            },
        )
        .unwrap_or_else(|e| panic!("incrementer {handle}: {e}"))
}

/// Service answering each command with `parts` responses spaced `interval`
/// apart. Bodies count down so the final response carries `0`.
pub fn add_streamer(
    broker: &Broker<Command>,
    handle: Handle,
    parts: u64,
    interval: Duration,
) -> Member<Command> {
    let ids = ReplyIds::default();
    broker
        .add_member(
            handle,
            move |member: Member<Command>, sender: Handle, cmd: Command| {
                let ids = ids.clone();
                async move {
                    for remaining in (0..parts).rev() {
                        tokio::time::sleep(interval).await;
                        member.send(sender, cmd.reply(ids.next(), remaining)).await;
                    }
                }
            },
        )
        .unwrap_or_else(|e| panic!("streamer {handle}: {e}"))
}

/// Poll `condition` until it holds or roughly a second has passed.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// True if nothing arrives on `rx` within a short grace period.
pub async fn stays_quiet<T>(rx: &mut UnboundedReceiver<T>) -> bool {
    !matches!(
        tokio::time::timeout(Duration::from_millis(50), rx.recv()).await,
        Ok(Some(_))
    )
}
