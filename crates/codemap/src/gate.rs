//! The invalidation gate shared by the code and depth maps.
//!
//! The writer brackets every structural mutation with [`Gate::set_invalid`]
//! and [`Gate::clear_invalid`]. Readers never wait on the gate; they check it
//! after a lookup and drop the result if a mutation overlapped their read
//! window. It does not prevent races, it only makes them detectable.
//!
//! Writers are serialized by a mutex that readers never touch. Every map
//! sharing a gate takes [`Gate::write`] for the whole of a registration or
//! removal, so two threads registering code at once never interleave their
//! set/clear pairs.
//!
//! Internally the gate is a sequence counter in the style of a seqlock: an
//! odd value means a mutation is in progress and every `set`/`clear` pair
//! advances it by two. Comparing the value seen when a read started with the
//! value seen after it also catches a full mutation that started and finished
//! between two checks of a plain flag.
//!
//! The gate also counts readers currently inside a lookup. The writer only
//! recycles index nodes and frees frame chains when it observes that count at
//! zero, so whatever a reader reached through a (possibly stale) link is still
//! mapped memory holding a value that was once registered.
//!
//! Everything on the reader side is a handful of atomic operations: no locks,
//! no allocation, no syscalls. That is what makes it usable from a profiling
//! signal handler.

use std::sync::atomic::{AtomicUsize, Ordering, fence};
use std::sync::{Mutex, MutexGuard};

/// Advisory flag, plus reader accounting, guarding one or more indexes.
#[derive(Debug, Default)]
pub struct Gate {
    seq: AtomicUsize,
    readers: AtomicUsize,
    writer: Mutex<()>,
}

impl Gate {
    /// Creates a gate in the valid state with no active readers.
    pub const fn new() -> Gate {
        Gate {
            seq: AtomicUsize::new(0),
            readers: AtomicUsize::new(0),
            writer: Mutex::new(()),
        }
    }

    /// Becomes the writer of the guarded indexes, blocking until any other
    /// writer is done.
    ///
    /// Never call this from a signal handler.
    pub fn write(&self) -> WriteGuard<'_> {
        WriteGuard {
            gate: self,
            _lock: self.writer.lock().unwrap(),
        }
    }

    /// Marks the guarded indexes as being mid-mutation.
    ///
    /// Must be paired with [`Gate::clear_invalid`]; calls do not nest. This
    /// does not exclude other writers, see [`Gate::write`].
    pub fn set_invalid(&self) {
        let prev = self.seq.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev % 2 == 0, "gate set twice without being cleared");
        // Keep the mutation's stores from becoming visible before the gate.
        fence(Ordering::Release);
    }

    /// Marks the guarded indexes as consistent again.
    pub fn clear_invalid(&self) {
        let prev = self.seq.fetch_add(1, Ordering::Release);
        debug_assert!(prev % 2 == 1, "gate cleared without being set");
    }

    /// Returns whether a mutation is currently in progress.
    pub fn is_invalid(&self) -> bool {
        self.seq.load(Ordering::Acquire) % 2 == 1
    }

    /// Runs `f` between [`Gate::set_invalid`] and [`Gate::clear_invalid`],
    /// as the only writer.
    pub fn mutate<R>(&self, f: impl FnOnce() -> R) -> R {
        self.write().mutate(f)
    }

    /// Registers the calling context as a reader.
    ///
    /// The returned guard remembers the gate's sequence number so the read
    /// can be validated afterwards, and keeps retired index memory alive
    /// until it is dropped. Safe to call from a signal handler, including one
    /// that interrupted another reader.
    pub fn read(&self) -> ReadGuard<'_> {
        self.readers.fetch_add(1, Ordering::Relaxed);
        // Pairs with the fence in `is_quiescent`: either the writer sees
        // this reader, or this reader sees everything the writer unlinked
        // before checking.
        fence(Ordering::SeqCst);
        let seq = self.seq.load(Ordering::Acquire);
        ReadGuard { gate: self, seq }
    }

    #[cfg(test)]
    pub(crate) fn sequence(&self) -> usize {
        self.seq.load(Ordering::Relaxed)
    }

    /// Returns whether no reader is registered right now.
    ///
    /// Only meaningful on the writer side, after the memory in question has
    /// been made unreachable.
    pub(crate) fn is_quiescent(&self) -> bool {
        fence(Ordering::SeqCst);
        self.readers.load(Ordering::Acquire) == 0
    }
}

/// Exclusive writer access to a [`Gate`].
///
/// Obtained from [`Gate::write`].
#[derive(Debug)]
pub struct WriteGuard<'a> {
    gate: &'a Gate,
    _lock: MutexGuard<'a, ()>,
}

impl WriteGuard<'_> {
    /// Runs `f` between [`Gate::set_invalid`] and [`Gate::clear_invalid`].
    ///
    /// May be called any number of times while the guard is held.
    pub fn mutate<R>(&self, f: impl FnOnce() -> R) -> R {
        self.gate.set_invalid();
        let ret = f();
        self.gate.clear_invalid();
        ret
    }
}

/// A registered reader of a [`Gate`].
///
/// Obtained from [`Gate::read`].
#[derive(Debug)]
pub struct ReadGuard<'a> {
    gate: &'a Gate,
    seq: usize,
}

impl ReadGuard<'_> {
    /// Returns whether everything read since this guard was created is free
    /// of interference from the writer.
    ///
    /// This is false if a mutation was in progress when the guard was
    /// created, or if any mutation started since. Results obtained while this
    /// returns false must be discarded.
    pub fn validate(&self) -> bool {
        // Order the reads of the index before the re-check of the sequence.
        fence(Ordering::Acquire);
        self.seq % 2 == 0 && self.gate.seq.load(Ordering::Relaxed) == self.seq
    }

    /// The gate this guard is registered with.
    pub fn gate(&self) -> &Gate {
        self.gate
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.gate.readers.fetch_sub(1, Ordering::Release);
    }
}
