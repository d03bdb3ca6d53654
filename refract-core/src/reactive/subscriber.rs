//! Subscriber types for the reactive system.
//!
//! A Subscriber represents any computation that depends on reactive values:
//! a derived computation or an effect.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::graph::{NodeId, NodeKind};

/// Unique identifier for a subscriber. Subscribers are graph nodes, so this
/// is the node's ID.
pub type SubscriberId = NodeId;

/// The two kinds of subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberKind {
    /// A derived computation; settled before effects in every flush.
    Derived,
    /// An effect.
    Effect,
}

impl SubscriberKind {
    /// The subscriber kind for a graph node kind. Sources are not subscribers.
    pub fn from_node_kind(kind: NodeKind) -> Option<Self> {
        match kind {
            NodeKind::Source => None,
            NodeKind::Derived => Some(Self::Derived),
            NodeKind::Effect => Some(Self::Effect),
        }
    }
}

impl fmt::Display for SubscriberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Derived => f.write_str("derived"),
            Self::Effect => f.write_str("effect"),
        }
    }
}

/// A subscriber descriptor: identity, kind and liveness.
///
/// Obtained from [`Derived::subscriber`](crate::Derived::subscriber) or
/// [`Effect::subscriber`](crate::Effect::subscriber) and passed to
/// [`Cell::subscribe`](crate::Cell::subscribe). Clones share the liveness
/// flag, which flips to dead exactly once when the subscriber is torn down.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    kind: SubscriberKind,
    alive: Arc<AtomicBool>,
}

impl Subscriber {
    pub(crate) fn new(id: SubscriberId, kind: SubscriberKind) -> Self {
        Self {
            id,
            kind,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Get the subscriber's kind.
    pub fn kind(&self) -> SubscriberKind {
        self.kind
    }

    /// Whether the subscriber can still be notified.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark the subscriber dead. Returns true only for the call that
    /// actually flipped the flag.
    pub(crate) fn kill(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }
}
