//! Client identity and cancellation
//!
//! A client is an opaque token compared by identity to authorize releases
//! and to find its reservations on teardown. It also carries the pending
//! cancellation signal that blocked calls observe.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client{}", self.0)
    }
}

/// An open handle on the broker
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    interrupted: AtomicBool,
}

impl Client {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Whether a cancellation is pending
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Mark a cancellation pending; see [`crate::Context::interrupt`]
    pub(crate) fn raise_interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Consume a pending cancellation
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }
}
