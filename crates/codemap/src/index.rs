//! The ordered address index shared by the code and depth maps.
//!
//! This is a skip list whose nodes live in a [`NodePool`] and whose links are
//! 32-bit node references stored in atomics. It maps a start address to a
//! small `Copy` payload and supports floor search: find the entry with the
//! greatest key not above a query address.
//!
//! There is a single writer (serialized by an internal mutex that readers
//! never touch) and any number of concurrent readers. A reader may observe a
//! half-linked or half-unlinked node, or a payload being written, but every
//! access it makes is an atomic load of pool memory that stays mapped, and
//! keys strictly increase along every link it can follow, so it always
//! terminates and never faults. Whether its result can be trusted is decided
//! by the [`Gate`] the caller read under.
//!
//! Unlinked nodes are retired rather than freed. They are only recycled by
//! [`AddressIndex::collect`] once the gate reports no active reader, so a
//! reader that is standing on a removed node keeps following that node's
//! (still increasing) links.

use crate::config::Config;
use crate::error::OutOfMemory;
use crate::gate::{Gate, ReadGuard};
use crate::pool::{Allocator, NIL, NodePool, NodeRef};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// The maximum number of levels of any index.
pub const MAX_HEIGHT: usize = 16;

/// A value stored in an [`AddressIndex`].
///
/// Values are written by the writer while readers may be loading them, so
/// they are stored in a `Slot` made of atomics. A reader may see a torn
/// value (fields from two different writes); that is only possible while the
/// gate is set, so such a read never validates.
pub trait Payload: Copy {
    /// Atomic storage for one value.
    type Slot: Default + Send + Sync;

    /// Writes `value` into `slot`.
    fn store(slot: &Self::Slot, value: Self);

    /// Reads the value in `slot`.
    fn load(slot: &Self::Slot) -> Self;
}

struct Node<V: Payload> {
    key: AtomicUsize,
    next: [AtomicU32; MAX_HEIGHT],
    value: V::Slot,
}

impl<V: Payload> Default for Node<V> {
    fn default() -> Self {
        Node {
            key: AtomicUsize::new(0),
            next: nil_links(),
            value: V::Slot::default(),
        }
    }
}

fn nil_links() -> [AtomicU32; MAX_HEIGHT] {
    std::array::from_fn(|_| AtomicU32::new(NIL))
}

struct Writer {
    alloc: Allocator,
    rng: SmallRng,
    len: usize,
}

impl Writer {
    /// Picks a level count with a 1/2 chance of growing at each level.
    fn random_height(&mut self, max: usize) -> usize {
        let bits = self.rng.next_u32();
        (bits.trailing_zeros() as usize + 1).min(max)
    }
}

/// Ordered map from start addresses to payloads, readable without locking.
pub struct AddressIndex<V: Payload> {
    head: [AtomicU32; MAX_HEIGHT],
    pool: NodePool<Node<V>>,
    max_height: usize,
    writer: Mutex<Writer>,
}

impl<V: Payload> AddressIndex<V> {
    /// Creates an empty index.
    pub fn new(config: &Config) -> Self {
        AddressIndex {
            head: nil_links(),
            pool: NodePool::new(config.chunk_size),
            max_height: config.max_height,
            writer: Mutex::new(Writer {
                alloc: Allocator::with_limit(config.max_nodes),
                rng: SmallRng::seed_from_u64(config.seed),
                len: 0,
            }),
        }
    }

    fn links<'a>(&'a self, at: Option<&'a Node<V>>) -> &'a [AtomicU32; MAX_HEIGHT] {
        match at {
            Some(node) => &node.next,
            None => &self.head,
        }
    }

    /// Resolves a reference the writer knows to be live or retired.
    fn node(&self, r: NodeRef) -> &Node<V> {
        self.pool
            .get(r)
            .expect("index link points outside of the node pool")
    }

    /// Shared floor search used by both readers and the writer.
    fn floor(&self, key: usize) -> Option<(usize, V)> {
        let mut at: Option<&Node<V>> = None;
        for level in (0..self.max_height).rev() {
            loop {
                let Some(next) = NodeRef::unpack(self.links(at)[level].load(Ordering::Acquire))
                else {
                    break;
                };
                let Some(node) = self.pool.get(next) else {
                    break;
                };
                if node.key.load(Ordering::Relaxed) > key {
                    break;
                }
                at = Some(node);
            }
        }
        let node = at?;
        Some((node.key.load(Ordering::Relaxed), V::load(&node.value)))
    }

    /// Returns the entry with the greatest key `<= key`, or `None` if every
    /// key is greater.
    ///
    /// This never blocks or allocates and may run concurrently with the
    /// writer. The result is only meaningful if `guard` (taken on the gate
    /// the writer brackets its mutations with) still validates afterwards.
    pub fn floor_search(&self, key: usize, guard: &ReadGuard<'_>) -> Option<(usize, V)> {
        let _ = guard;
        self.floor(key)
    }

    /// For each level, the last node whose key is strictly below `key`.
    fn predecessors(&self, key: usize) -> [Option<NodeRef>; MAX_HEIGHT] {
        let mut preds = [None; MAX_HEIGHT];
        let mut at: Option<NodeRef> = None;
        for level in (0..MAX_HEIGHT).rev() {
            loop {
                let links = self.links(at.map(|r| self.node(r)));
                match NodeRef::unpack(links[level].load(Ordering::Relaxed)) {
                    Some(next) if self.node(next).key.load(Ordering::Relaxed) < key => {
                        at = Some(next);
                    }
                    _ => break,
                }
            }
            preds[level] = at;
        }
        preds
    }

    /// Inserts a new entry.
    ///
    /// `key` must not already be present; this is only checked in debug
    /// builds. Only the writer allocates, and a failed pool growth leaves the
    /// index untouched.
    pub fn insert(&self, key: usize, value: V) -> Result<(), OutOfMemory> {
        let mut writer = self.writer.lock().unwrap();
        let preds = self.predecessors(key);
        debug_assert!(
            NodeRef::unpack(self.links(preds[0].map(|r| self.node(r)))[0].load(Ordering::Relaxed))
                .map_or(true, |r| self.node(r).key.load(Ordering::Relaxed) != key),
            "duplicate key {key:#x} inserted into address index"
        );

        let r = writer.alloc.alloc(&self.pool)?;
        let height = writer.random_height(self.max_height);
        let node = self.node(r);
        node.key.store(key, Ordering::Relaxed);
        V::store(&node.value, value);
        for level in 0..MAX_HEIGHT {
            let next = if level < height {
                self.links(preds[level].map(|p| self.node(p)))[level].load(Ordering::Relaxed)
            } else {
                NIL
            };
            node.next[level].store(next, Ordering::Relaxed);
        }

        // Bottom-up, so the node is reachable at level 0 before it's used as
        // an express lane; each store publishes the fields written above.
        for level in 0..height {
            self.links(preds[level].map(|p| self.node(p)))[level]
                .store(r.index(), Ordering::Release);
        }
        writer.len += 1;
        Ok(())
    }

    /// Removes the entry keyed exactly at `key` and returns its value.
    ///
    /// The key must be present. Violating that is a caller bug: debug builds
    /// panic, release builds leave the index untouched and return `None`.
    pub fn remove(&self, key: usize) -> Option<V> {
        let mut writer = self.writer.lock().unwrap();
        self.remove_locked(&mut writer, key)
    }

    fn remove_locked(&self, writer: &mut Writer, key: usize) -> Option<V> {
        let preds = self.predecessors(key);
        let target = NodeRef::unpack(
            self.links(preds[0].map(|r| self.node(r)))[0].load(Ordering::Relaxed),
        )
        .filter(|r| self.node(*r).key.load(Ordering::Relaxed) == key);
        let Some(target) = target else {
            debug_assert!(false, "removing {key:#x} which is not in the address index");
            return None;
        };

        let node = self.node(target);
        for level in (0..MAX_HEIGHT).rev() {
            let link = &self.links(preds[level].map(|p| self.node(p)))[level];
            if link.load(Ordering::Relaxed) == target.index() {
                // `node.next` stays intact for readers standing on `node`.
                link.store(node.next[level].load(Ordering::Relaxed), Ordering::Release);
            }
        }
        writer.alloc.retire(target);
        writer.len -= 1;
        Some(V::load(&node.value))
    }

    /// Removes every entry whose key lies in `[start, start + len)`, passing
    /// each removed entry to `f`.
    ///
    /// Works by repeatedly floor-searching from the top of the range and
    /// removing what it finds until the floor drops below `start`. Does
    /// nothing if `len` is zero.
    pub fn remove_range(&self, start: usize, len: usize, mut f: impl FnMut(usize, V)) {
        if len == 0 {
            return;
        }
        let top = start.saturating_add(len - 1);
        let mut writer = self.writer.lock().unwrap();
        while let Some((key, _)) = self.floor(top) {
            if key < start {
                break;
            }
            if let Some(value) = self.remove_locked(&mut writer, key) {
                f(key, value);
            }
        }
    }

    /// Recycles retired nodes if no reader registered with `gate` can still
    /// be looking at them.
    ///
    /// Call after the gated section of a mutation has ended.
    pub fn collect(&self, gate: &Gate) {
        let mut writer = self.writer.lock().unwrap();
        let retired = writer.alloc.retired();
        if retired == 0 {
            return;
        }
        if gate.is_quiescent() {
            writer.alloc.reclaim();
            log::trace!("address index recycled {retired} nodes");
        } else {
            log::debug!("address index deferring reuse of {retired} nodes, readers active");
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.writer.lock().unwrap().len
    }

    /// Whether the index has no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every live entry in key order.
    ///
    /// Writer-side only.
    pub fn for_each(&self, mut f: impl FnMut(usize, V)) {
        let _writer = self.writer.lock().unwrap();
        let mut at = NodeRef::unpack(self.head[0].load(Ordering::Relaxed));
        while let Some(r) = at {
            let node = self.node(r);
            f(node.key.load(Ordering::Relaxed), V::load(&node.value));
            at = NodeRef::unpack(node.next[0].load(Ordering::Relaxed));
        }
    }
}
