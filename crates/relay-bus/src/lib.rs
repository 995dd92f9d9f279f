//! # Relay Bus - In-Process Message Broker
//!
//! Addressed delivery, type-based publish/subscribe and correlated
//! request/response between members identified by a [`Handle`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  send()/request()   ┌─────────────────────────────┐
//! │ Member A │ ──────────────────▶ │ Broker                      │
//! └──────────┘                     │  bounded queue              │
//!      ▲                           │    │                        │
//!      │  RequestManager(B)        │    ▼ dispatch loop          │
//!      │  correlates by ref        │  registry + subscriptions   │
//!      │                           └────┬────────────────────────┘
//!      │                                │ one task per delivery
//! ┌──────────┐ ◀────────────────────────┘
//! │ Member B │
//! └──────────┘
//! ```
//!
//! Payloads are opaque. The broker learns a command's identity and the
//! request it answers only through the [`CommandDescriptor`] supplied at
//! construction.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let broker = Broker::new(CommandDescriptor::from_trait(), Duration::from_secs(5));
//! let client = broker.add_member(Handle::new(1, 1), |_m, _from, _cmd| async {})?;
//! let reply = client.request(Handle::of_type(2), cmd).await?;
//! ```

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
pub mod controller;
pub mod descriptor;
pub mod errors;
pub mod handle;
pub mod member;
pub mod request_manager;
pub mod stats;

// Re-export main types
pub use config::BrokerConfig;
pub use controller::{Broker, Envelope};
pub use descriptor::{CommandDescriptor, Correlated};
pub use errors::BrokerError;
pub use handle::Handle;
pub use member::{Member, MessageHandler};
pub use request_manager::{ReceiveFn, RequestManager, ResponseHandler, SendFn};
pub use stats::{BrokerStats, StatsSnapshot};
