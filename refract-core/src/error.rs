//! Error types for the reactive engine.
//!
//! Failures local to one subscriber (`CyclicDependency`,
//! `SubscriberException`) are isolated and reported through the runtime's
//! error channel. `ReentrancyLimitExceeded` aborts the whole flush and is
//! handed back to the host.

use std::any::Any;

use thiserror::Error;

use crate::graph::NodeId;
use crate::reactive::{SubscriberId, SubscriberKind};

/// Errors produced by the reactive engine.
///
/// The type is `Clone` because a cycle error raised deep inside nested
/// computations travels outward as a panic payload, and every enclosing
/// computation hands its own copy back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A derived computation re-entered its own evaluation.
    #[error("cyclic dependency between {}", format_members(.members))]
    CyclicDependency {
        /// Nodes on the cycle, outermost evaluation first.
        members: Vec<NodeId>,
    },

    /// A compute function, effect body or cleanup panicked or returned an error.
    #[error("{kind} {id} failed: {message}")]
    SubscriberException {
        /// Which kind of subscriber failed.
        kind: SubscriberKind,
        /// The failing subscriber.
        id: SubscriberId,
        /// Panic message or error text.
        message: String,
    },

    /// Writes made while flushing kept scheduling new rounds.
    #[error("flush exceeded {limit} rounds; an effect is probably feeding its own dependencies")]
    ReentrancyLimitExceeded {
        /// The configured round limit.
        limit: usize,
    },

    /// A global key was requested with a different value type than it was
    /// registered with.
    #[error("global `{key}` is registered with a different type")]
    GlobalTypeMismatch {
        /// The registry key.
        key: String,
    },

    /// The runtime configuration was rejected.
    #[error("invalid runtime config: {0}")]
    InvalidConfig(String),
}

impl ReactiveError {
    /// True for errors that abort a flush instead of being isolated.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ReentrancyLimitExceeded { .. })
    }

    /// The subscriber an isolated failure belongs to, if any.
    pub fn subscriber(&self) -> Option<(SubscriberKind, SubscriberId)> {
        match self {
            Self::SubscriberException { kind, id, .. } => Some((*kind, *id)),
            Self::CyclicDependency { members } => {
                members.first().map(|id| (SubscriberKind::Derived, *id))
            }
            _ => None,
        }
    }

    /// Convert a caught panic into an error attributed to `id`.
    ///
    /// A payload that already is a `ReactiveError` (raised by a nested
    /// `read`) is passed through unchanged.
    pub(crate) fn from_panic(
        payload: Box<dyn Any + Send>,
        kind: SubscriberKind,
        id: SubscriberId,
    ) -> Self {
        match payload.downcast::<ReactiveError>() {
            Ok(error) => *error,
            Err(payload) => Self::SubscriberException {
                kind,
                id,
                message: panic_message(payload.as_ref()),
            },
        }
    }
}

fn format_members(members: &[NodeId]) -> String {
    members
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;
