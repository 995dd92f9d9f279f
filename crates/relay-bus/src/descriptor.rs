//! # Command Descriptor
//!
//! The broker never inspects payloads. Everything it needs to know about a
//! command is obtained through two accessors supplied once per broker:
//!
//! - `id(cmd)` - the handle identifying this command; the correlation key of a request
//! - `reference(cmd)` - the handle of the request this command answers, or [`Handle::ANY`]

use crate::handle::Handle;
use std::fmt;
use std::sync::Arc;

/// Payloads that carry their own identity and reference.
pub trait Correlated {
    /// Handle identifying this command.
    fn id(&self) -> Handle;

    /// Handle of the request this command answers, [`Handle::ANY`] otherwise.
    fn reference(&self) -> Handle;
}

type Accessor<C> = Arc<dyn Fn(&C) -> Handle + Send + Sync>;

/// Pair of pure accessor functions over an opaque command type.
///
/// Both functions must be deterministic and safe to call from any thread.
pub struct CommandDescriptor<C> {
    get_id: Accessor<C>,
    get_ref: Accessor<C>,
}

impl<C> CommandDescriptor<C> {
    /// Create a descriptor from two closures.
    pub fn new<I, R>(get_id: I, get_ref: R) -> Self
    where
        I: Fn(&C) -> Handle + Send + Sync + 'static,
        R: Fn(&C) -> Handle + Send + Sync + 'static,
    {
        Self {
            get_id: Arc::new(get_id),
            get_ref: Arc::new(get_ref),
        }
    }

    /// Identity handle of `cmd`.
    #[must_use]
    pub fn id(&self, cmd: &C) -> Handle {
        (self.get_id)(cmd)
    }

    /// Reference handle of `cmd`.
    #[must_use]
    pub fn reference(&self, cmd: &C) -> Handle {
        (self.get_ref)(cmd)
    }

    /// Type component of the command's identity, used for subscription routing.
    #[must_use]
    pub fn type_id(&self, cmd: &C) -> u32 {
        self.id(cmd).type_id()
    }
}

impl<C: Correlated + 'static> CommandDescriptor<C> {
    /// Descriptor delegating to the payload's [`Correlated`] impl.
    #[must_use]
    pub fn from_trait() -> Self {
        Self::new(Correlated::id, Correlated::reference)
    }
}

impl<C> Clone for CommandDescriptor<C> {
    fn clone(&self) -> Self {
        Self {
            get_id: Arc::clone(&self.get_id),
            get_ref: Arc::clone(&self.get_ref),
        }
    }
}

impl<C> fmt::Debug for CommandDescriptor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor").finish_non_exhaustive()
    }
}
