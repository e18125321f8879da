//! Canonical identifier types used across the coordinator, storage, and transaction layers.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Session identifier handed out by the external transaction coordinator.
pub type SessionId = u32;

/// Configuration identifier handed out by the external transaction coordinator.
pub type ConfigId = u32;

/// Controller name, the scope key of every audit and import operation.
pub type ControllerName = String;

/// Monotonic source of process-local thread numbers.
static NEXT_THREAD_SEQ: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_SEQ: Cell<u32> = const { Cell::new(0) };
}

/// Returns a small stable number for the calling OS thread.
///
/// `std::thread::ThreadId` has no stable integer form, so each thread draws one number from a
/// process-wide counter on first use and keeps it for its lifetime.
#[must_use]
pub fn current_thread_seq() -> u32 {
    THREAD_SEQ.with(|slot| {
        let current = slot.get();
        if current != 0 {
            return current;
        }
        let assigned = NEXT_THREAD_SEQ.fetch_add(1, Ordering::Relaxed);
        slot.set(assigned);
        assigned
    })
}

/// Connection owner tag: `(session id, thread number)` packed into 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerTag(u64);

impl OwnerTag {
    /// Packs one session id and one thread number.
    #[must_use]
    pub const fn new(session_id: SessionId, thread_seq: u32) -> Self {
        Self(((session_id as u64) << 32) | thread_seq as u64)
    }

    /// Builds the tag for the calling thread.
    #[must_use]
    pub fn for_current_thread(session_id: SessionId) -> Self {
        Self::new(session_id, current_thread_seq())
    }

    /// Session half of the tag.
    #[must_use]
    pub const fn session_id(self) -> SessionId {
        (self.0 >> 32) as SessionId
    }

    /// Thread half of the tag.
    #[must_use]
    pub const fn thread_seq(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Raw packed value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Strongly typed non-zero bound for pooled read connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionLimit(u16);

impl ConnectionLimit {
    /// Creates a validated connection limit.
    ///
    /// Returns `None` for zero because the read path always needs at least one connection.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner limit.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}
