//! Ordered, thread-safe collection of byte handlers.
//!
//! Entries live in a slot arena and are chained in both directions, so an
//! entry can be unlinked by identity without shifting its neighbours. Every
//! traversal and every mutation of the chain happens under a single lock.
//!
//! Handlers run with that lock held. A handler must return promptly and must
//! not call [`CallbackRegistry::register`] or [`CallbackRegistry::unregister`]
//! on the registry that is invoking it; doing so deadlocks.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::TryReserveError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::RegistrationError;

pub type Handler = Box<dyn FnMut(u8) + Send>;

// Shared by every registry in the process, so an id never matches an entry
// of a registry that did not issue it.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a registered handler.
///
/// An id stays valid until its entry is removed and never matches any other
/// entry: not a later one reusing the same slot, and not one in a different
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    slot: usize,
    generation: u64,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

struct Entry {
    handler: Handler,
    prev: Option<usize>,
    next: Option<usize>,
}

enum Slot {
    Occupied { generation: u64, entry: Entry },
    Vacant { next_free: Option<usize> },
}

#[derive(Default)]
struct Chain {
    slots: Vec<Slot>,
    head: Option<usize>,
    tail: Option<usize>,
    free: Option<usize>,
    len: usize,
}

impl Chain {
    fn entry_mut(&mut self, slot: usize) -> Option<&mut Entry> {
        match self.slots.get_mut(slot) {
            Some(Slot::Occupied { entry, .. }) => Some(entry),
            _ => None,
        }
    }

    fn push_back(&mut self, handler: Handler) -> Result<EntryId, TryReserveError> {
        if self.free.is_none() {
            self.slots.try_reserve(1)?;
        }

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            handler,
            prev: self.tail,
            next: None,
        };

        let slot = match self.free {
            Some(slot) => {
                self.free = match self.slots[slot] {
                    Slot::Vacant { next_free } => next_free,
                    Slot::Occupied { .. } => None,
                };
                self.slots[slot] = Slot::Occupied { generation, entry };
                slot
            }
            None => {
                self.slots.push(Slot::Occupied { generation, entry });
                self.slots.len() - 1
            }
        };

        match self.tail.and_then(|tail| self.entry_mut(tail)) {
            Some(tail) => tail.next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;

        Ok(EntryId { slot, generation })
    }

    fn remove(&mut self, id: EntryId) -> Option<Handler> {
        match self.slots.get(id.slot) {
            Some(Slot::Occupied { generation, .. }) if *generation == id.generation => {}
            _ => return None,
        }

        let vacant = Slot::Vacant {
            next_free: self.free,
        };
        let Slot::Occupied { entry, .. } = std::mem::replace(&mut self.slots[id.slot], vacant)
        else {
            return None;
        };
        self.free = Some(id.slot);

        match entry.prev.and_then(|prev| self.entry_mut(prev)) {
            Some(prev) => prev.next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next.and_then(|next| self.entry_mut(next)) {
            Some(next) => next.prev = entry.prev,
            None => self.tail = entry.prev,
        }
        self.len -= 1;

        Some(entry.handler)
    }

    fn ids(&self) -> Vec<EntryId> {
        let mut ids = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            if ids.len() == self.len {
                break;
            }
            let Some(Slot::Occupied { generation, entry }) = self.slots.get(slot) else {
                break;
            };
            ids.push(EntryId {
                slot,
                generation: *generation,
            });
            cursor = entry.next;
        }
        ids
    }

    /// Walks the chain both ways and checks that the two walks agree.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let forward = self.ids();
        let mut backward = Vec::with_capacity(self.len);
        let mut cursor = self.tail;
        while let Some(slot) = cursor {
            if backward.len() > self.len {
                return false;
            }
            backward.push(slot);
            cursor = match self.slots.get(slot) {
                Some(Slot::Occupied { entry, .. }) => entry.prev,
                _ => return false,
            };
        }
        backward.reverse();
        forward.len() == self.len
            && forward.iter().map(|id| id.slot).eq(backward.into_iter())
    }
}

#[derive(Default)]
pub struct CallbackRegistry {
    chain: Mutex<Chain>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` after every handler registered so far.
    pub fn register<F>(&self, handler: F) -> Result<EntryId, RegistrationError>
    where
        F: FnMut(u8) + Send + 'static,
    {
        let handler: Handler = Box::new(handler);
        let id = self.chain.lock().push_back(handler)?;
        log::debug!("registered serial handler {id}");
        Ok(id)
    }

    /// Removes the handler behind `id`.
    ///
    /// Returns `false` when `id` was already removed or never belonged to
    /// this registry; nothing changes in that case.
    pub fn unregister(&self, id: EntryId) -> bool {
        let removed = self.chain.lock().remove(id);
        match removed {
            Some(handler) => {
                // dropped outside the lock
                drop(handler);
                log::debug!("unregistered serial handler {id}");
                true
            }
            None => {
                log::warn!("unregister: no serial handler {id}");
                false
            }
        }
    }

    /// Delivers `byte` to every handler, head to tail, and returns how many
    /// handlers completed normally.
    ///
    /// A panicking handler is logged and skipped; the rest of the chain still
    /// receives the byte and the handler stays registered.
    pub fn for_each(&self, byte: u8) -> usize {
        let mut chain = self.chain.lock();
        let mut delivered = 0;
        let mut cursor = chain.head;

        while let Some(slot) = cursor {
            let Some(Slot::Occupied { generation, entry }) = chain.slots.get_mut(slot) else {
                break;
            };
            let id = EntryId {
                slot,
                generation: *generation,
            };
            cursor = entry.next;

            let handler = &mut entry.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(byte))) {
                Ok(()) => delivered += 1,
                Err(payload) => log::error!(
                    "serial handler {id} panicked on byte {byte:#04x}: {}",
                    panic_message(payload.as_ref())
                ),
            }
        }

        log::trace!("dispatched {byte:#04x} to {delivered} handler(s)");
        delivered
    }

    pub fn len(&self) -> usize {
        self.chain.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: EntryId) -> bool {
        matches!(
            self.chain.lock().slots.get(id.slot),
            Some(Slot::Occupied { generation, .. }) if *generation == id.generation
        )
    }

    /// Identities of all registered handlers in dispatch order.
    pub fn ids(&self) -> Vec<EntryId> {
        self.chain.lock().ids()
    }

    /// Removes every handler.
    pub fn clear(&self) {
        let old = std::mem::take(&mut *self.chain.lock());
        log::debug!("cleared {} serial handler(s)", old.len);
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
