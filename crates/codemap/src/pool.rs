//! Node pool backing the address index.
//!
//! Nodes are allocated out of a fixed table of chunks, where chunk `c` holds
//! `chunk_size << c` nodes. Chunks are published once and never moved or
//! freed until the pool itself is dropped, so a `NodeRef` read by a reader
//! from any link always resolves to mapped memory.
//!
//! The pool only hands out slots. Keeping track of which slots are live,
//! retired or free is the job of the writer-owned [`Allocator`].

use crate::error::OutOfMemory;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Enough chunks to address every `u32` node reference even with a chunk
/// size of one.
const MAX_CHUNKS: usize = 32;

/// Reserved packed value for "no node".
pub(crate) const NIL: u32 = u32::MAX;

/// A reference to a node in a [`NodePool`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct NodeRef(u32);

impl NodeRef {
    /// Unpacks a link value.
    pub(crate) fn unpack(raw: u32) -> Option<NodeRef> {
        if raw == NIL { None } else { Some(NodeRef(raw)) }
    }

    pub(crate) fn index(self) -> u32 {
        self.0
    }
}

pub(crate) struct NodePool<T> {
    chunks: [AtomicPtr<T>; MAX_CHUNKS],
    chunk_size: usize,
    _marker: PhantomData<T>,
}

impl<T: Default> NodePool<T> {
    /// Creates an empty pool. `chunk_size` must be a power of two.
    pub(crate) fn new(chunk_size: usize) -> Self {
        debug_assert!(chunk_size.is_power_of_two());
        NodePool {
            chunks: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            chunk_size,
            _marker: PhantomData,
        }
    }

    /// Maps a node index to `(chunk, offset within chunk)`.
    fn locate(&self, index: u32) -> (usize, usize) {
        let index = index as usize;
        let scaled = index / self.chunk_size + 1;
        let chunk = (usize::BITS - 1 - scaled.leading_zeros()) as usize;
        let offset = index - self.chunk_size * ((1 << chunk) - 1);
        (chunk, offset)
    }

    fn chunk_len(&self, chunk: usize) -> usize {
        self.chunk_size << chunk
    }

    /// Resolves a node reference.
    ///
    /// Returns `None` only if the chunk holding `r` was never allocated,
    /// which a well-formed link never points into.
    pub(crate) fn get(&self, r: NodeRef) -> Option<&T> {
        let (chunk, offset) = self.locate(r.0);
        let base = self.chunks.get(chunk)?.load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        debug_assert!(offset < self.chunk_len(chunk));
        // SAFETY: `base` points to a published chunk of `chunk_len(chunk)`
        // initialized nodes, `offset` is in bounds by construction of
        // `locate`, and chunks live as long as `self`.
        Some(unsafe { &*base.add(offset) })
    }

    /// Makes sure the chunk holding `index` exists.
    fn ensure(&self, index: u32) -> Result<(), OutOfMemory> {
        let (chunk, _) = self.locate(index);
        if chunk >= MAX_CHUNKS {
            return Err(OutOfMemory::new(0));
        }
        if !self.chunks[chunk].load(Ordering::Relaxed).is_null() {
            return Ok(());
        }

        let len = self.chunk_len(chunk);
        let bytes = len.saturating_mul(mem::size_of::<T>());
        let mut nodes = Vec::new();
        nodes
            .try_reserve_exact(len)
            .map_err(|_| OutOfMemory::new(bytes))?;
        nodes.resize_with(len, T::default);
        let base = Box::into_raw(nodes.into_boxed_slice()).cast::<T>();
        log::debug!("address index pool grew to {} chunks ({bytes} bytes)", chunk + 1);

        // Publish the initialized chunk before any link can point into it.
        self.chunks[chunk].store(base, Ordering::Release);
        Ok(())
    }
}

impl<T> Drop for NodePool<T> {
    fn drop(&mut self) {
        for (chunk, slot) in self.chunks.iter_mut().enumerate() {
            let base = *slot.get_mut();
            if base.is_null() {
                continue;
            }
            let len = self.chunk_size << chunk;
            // SAFETY: `base` came from `Box::into_raw` on a boxed slice of
            // exactly `len` nodes in `ensure`, and `&mut self` means no reader
            // can still hold a reference into it.
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base, len)) });
        }
    }
}

/// Writer-side bookkeeping of pool slots.
///
/// Every slot below `next` is exactly one of live (linked into the index),
/// retired (unlinked, possibly still visible to a reader) or free. Both lists
/// keep enough capacity for every slot ever handed out, so retiring and
/// reclaiming never allocate.
pub(crate) struct Allocator {
    next: u32,
    limit: u32,
    free: Vec<NodeRef>,
    retired: Vec<NodeRef>,
}

impl Default for Allocator {
    fn default() -> Self {
        Allocator::with_limit(NIL)
    }
}

impl Allocator {
    /// Creates an allocator that hands out at most `limit` distinct slots.
    pub(crate) fn with_limit(limit: u32) -> Self {
        Allocator {
            next: 0,
            limit: limit.min(NIL),
            free: Vec::new(),
            retired: Vec::new(),
        }
    }

    /// Takes a free slot, growing the pool if none is left.
    pub(crate) fn alloc<T: Default>(&mut self, pool: &NodePool<T>) -> Result<NodeRef, OutOfMemory> {
        if let Some(r) = self.free.pop() {
            return Ok(r);
        }

        let index = self.next;
        if index >= self.limit {
            return Err(OutOfMemory::new(mem::size_of::<T>()));
        }
        pool.ensure(index)?;
        let total = index as usize + 1;
        self.free.try_reserve(total - self.free.len())?;
        self.retired.try_reserve(total - self.retired.len())?;
        self.next += 1;
        Ok(NodeRef(index))
    }

    /// Records that `r` was unlinked and must not be reused yet.
    pub(crate) fn retire(&mut self, r: NodeRef) {
        debug_assert!(self.retired.len() < self.retired.capacity());
        self.retired.push(r);
    }

    pub(crate) fn retired(&self) -> usize {
        self.retired.len()
    }

    /// Makes every retired slot available again.
    ///
    /// Only call this once no reader can still reach a retired slot.
    pub(crate) fn reclaim(&mut self) {
        self.free.append(&mut self.retired);
    }

    /// Number of slots handed out by the pool so far.
    #[cfg(test)]
    pub(crate) fn high_water(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn locate_spans_doubling_chunks() {
        let pool = NodePool::<AtomicUsize>::new(4);
        assert_eq!(pool.locate(0), (0, 0));
        assert_eq!(pool.locate(3), (0, 3));
        assert_eq!(pool.locate(4), (1, 0));
        assert_eq!(pool.locate(11), (1, 7));
        assert_eq!(pool.locate(12), (2, 0));
        assert_eq!(pool.locate(27), (2, 15));
        assert_eq!(pool.locate(28), (3, 0));

        let pool = NodePool::<AtomicUsize>::new(1);
        assert_eq!(pool.locate(NIL - 1).0, 31);
    }

    #[test]
    fn slots_survive_growth() {
        let pool = NodePool::<AtomicUsize>::new(2);
        let mut alloc = Allocator::default();
        let mut refs = Vec::new();
        for i in 0..100 {
            let r = alloc.alloc(&pool).unwrap();
            pool.get(r).unwrap().store(i, Ordering::Relaxed);
            refs.push(r);
        }
        for (i, r) in refs.iter().enumerate() {
            assert_eq!(pool.get(*r).unwrap().load(Ordering::Relaxed), i);
        }
        assert_eq!(alloc.high_water(), 100);
    }

    #[test]
    fn retired_slots_wait_for_reclaim() {
        let pool = NodePool::<AtomicUsize>::new(4);
        let mut alloc = Allocator::default();
        let a = alloc.alloc(&pool).unwrap();
        let b = alloc.alloc(&pool).unwrap();
        alloc.retire(a);
        assert_eq!(alloc.retired(), 1);

        // Not handed out again before a reclaim.
        let c = alloc.alloc(&pool).unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);

        alloc.reclaim();
        assert_eq!(alloc.retired(), 0);
        assert_eq!(alloc.alloc(&pool).unwrap(), a);
        assert_eq!(alloc.high_water(), 3);
    }

    #[test]
    fn limit_caps_distinct_slots() {
        let pool = NodePool::<AtomicUsize>::new(4);
        let mut alloc = Allocator::with_limit(2);
        let a = alloc.alloc(&pool).unwrap();
        alloc.alloc(&pool).unwrap();
        let err = alloc.alloc(&pool).unwrap_err();
        assert_eq!(err.requested_bytes(), mem::size_of::<AtomicUsize>());

        // Recycled slots don't count against the limit.
        alloc.retire(a);
        alloc.reclaim();
        assert_eq!(alloc.alloc(&pool).unwrap(), a);
        assert!(alloc.alloc(&pool).is_err());
        assert_eq!(alloc.high_water(), 2);

        let mut alloc = Allocator::with_limit(0);
        assert!(alloc.alloc(&pool).is_err());
    }

    #[test]
    fn unallocated_chunk_resolves_to_none() {
        let pool = NodePool::<AtomicUsize>::new(4);
        assert!(pool.get(NodeRef(0)).is_none());
        assert!(NodeRef::unpack(NIL).is_none());
        assert_eq!(NodeRef::unpack(7).map(NodeRef::index), Some(7));
    }
}
