//! Depth-1 hand-off slot between one producer and one consumer.
//!
//! The producer never waits for the consumer: a deposit into a full slot
//! replaces the unread item. The consumer parks on a condition variable until
//! a fresh item arrives or the mailbox is closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of [`Mailbox::deposit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deposit {
    /// The slot was empty.
    Stored,
    /// An unread item was discarded in favour of the new one.
    Replaced,
    /// The mailbox is closed; the item was dropped.
    Closed,
}

/// Returned by [`Mailbox::take_timeout`] when nothing arrived in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

enum Slot<T> {
    Empty,
    Full(T),
    Closed,
}

pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    dropped: AtomicU64,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
            ready: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Stores `item`, overwriting any item the consumer has not taken yet,
    /// and wakes the waiting consumer.
    pub fn deposit(&self, item: T) -> Deposit {
        let outcome = {
            let mut slot = self.slot.lock();
            let replaced = match &*slot {
                Slot::Closed => return Deposit::Closed,
                Slot::Full(_) => true,
                Slot::Empty => false,
            };
            *slot = Slot::Full(item);
            if replaced {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Deposit::Replaced
            } else {
                Deposit::Stored
            }
        };
        self.ready.notify_one();
        outcome
    }

    /// Waits until an item has been deposited since the last take. Returns
    /// `None` once the mailbox is closed.
    pub fn take_blocking(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Full(item) => return Some(item),
                Slot::Closed => {
                    *slot = Slot::Closed;
                    return None;
                }
                Slot::Empty => self.ready.wait(&mut slot),
            }
        }
    }

    /// Like [`Mailbox::take_blocking`] but gives up after `timeout`.
    ///
    /// `Ok(None)` means the mailbox is closed. A timeout too large to
    /// represent as a deadline waits without one.
    pub fn take_timeout(&self, timeout: Duration) -> Result<Option<T>, TimedOut> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Ok(self.take_blocking());
        };
        let mut slot = self.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Full(item) => return Ok(Some(item)),
                Slot::Closed => {
                    *slot = Slot::Closed;
                    return Ok(None);
                }
                Slot::Empty => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out() {
                        return match std::mem::replace(&mut *slot, Slot::Empty) {
                            Slot::Full(item) => Ok(Some(item)),
                            Slot::Closed => {
                                *slot = Slot::Closed;
                                Ok(None)
                            }
                            Slot::Empty => Err(TimedOut),
                        };
                    }
                }
            }
        }
    }

    pub fn try_take(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Full(item) => Some(item),
            Slot::Closed => {
                *slot = Slot::Closed;
                None
            }
            Slot::Empty => None,
        }
    }

    /// Discards the pending item, if any. Returns whether one was discarded.
    pub fn clear(&self) -> bool {
        let mut slot = self.slot.lock();
        let pending = matches!(&*slot, Slot::Full(_));
        if pending {
            *slot = Slot::Empty;
            self.dropped.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Closes the mailbox, dropping any pending item and waking the consumer.
    pub fn close(&self) {
        {
            let mut slot = self.slot.lock();
            *slot = Slot::Closed;
        }
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.slot.lock(), Slot::Closed)
    }

    pub fn has_pending(&self) -> bool {
        matches!(&*self.slot.lock(), Slot::Full(_))
    }

    /// Number of items that were overwritten or cleared before being taken.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("pending", &self.has_pending())
            .field("dropped", &self.dropped())
            .finish()
    }
}
