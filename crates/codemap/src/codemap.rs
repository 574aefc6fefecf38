//! Map from JIT-compiled code regions to their frame chains.
//!
//! The compiler registers each region it emits together with the
//! [`FrameChain`] describing which logical frames are active where in it. A
//! profiler interrupting the program can then find the region containing a
//! sampled program counter with [`CodeMap::find_region`] and walk the frames
//! inlined at that address with [`RegionHandle::decode_frames_from`].
//!
//! Chains are owned by the map. Removing a region unlinks it immediately, but
//! its chain is only freed once no reader registered with the gate can still
//! be decoding it.

use crate::chain::{FrameChain, Frames, next_frame};
use crate::config::Config;
use crate::error::OutOfMemory;
use crate::gate::{Gate, ReadGuard};
use crate::index::{AddressIndex, Payload};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// What the index stores for one region.
#[derive(Clone, Copy)]
struct Region {
    size: u32,
    chain: *mut u32,
    chain_len: usize,
}

#[derive(Default)]
struct RegionSlot {
    size: AtomicU32,
    chain: AtomicPtr<u32>,
    chain_len: AtomicUsize,
}

impl Payload for Region {
    type Slot = RegionSlot;

    fn store(slot: &RegionSlot, value: Region) {
        slot.size.store(value.size, Ordering::Relaxed);
        slot.chain.store(value.chain, Ordering::Relaxed);
        slot.chain_len.store(value.chain_len, Ordering::Relaxed);
    }

    fn load(slot: &RegionSlot) -> Region {
        Region {
            size: slot.size.load(Ordering::Relaxed),
            chain: slot.chain.load(Ordering::Relaxed),
            chain_len: slot.chain_len.load(Ordering::Relaxed),
        }
    }
}

/// A chain whose box has been turned into raw parts so the index can point
/// at it.
struct RawChain {
    ptr: *mut u32,
    len: usize,
}

// SAFETY: a `RawChain` is the unique owner of its allocation, like the
// `Box<[u32]>` it came from.
unsafe impl Send for RawChain {}

impl RawChain {
    fn new(chain: FrameChain) -> RawChain {
        let words = chain.into_boxed_slice();
        let len = words.len();
        RawChain {
            ptr: Box::into_raw(words).cast::<u32>(),
            len,
        }
    }

    fn of(region: Region) -> RawChain {
        RawChain {
            ptr: region.chain,
            len: region.chain_len,
        }
    }

    /// Frees the chain.
    ///
    /// # Safety
    ///
    /// No reader may still hold a pointer to this chain.
    unsafe fn free(self) {
        // SAFETY: the parts come from `Box::into_raw` in `RawChain::new` and
        // the caller guarantees nothing else refers to them anymore.
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr, self.len)) });
    }
}

/// Map from region start addresses to region sizes and frame chains.
pub struct CodeMap {
    gate: Arc<Gate>,
    index: AddressIndex<Region>,
    retired: Mutex<Vec<RawChain>>,
}

impl CodeMap {
    /// Creates an empty map whose mutations are bracketed by `gate`.
    pub fn new(config: &Config, gate: Arc<Gate>) -> CodeMap {
        CodeMap {
            gate,
            index: AddressIndex::new(config),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// The gate this map's mutations are bracketed by.
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// Registers a region of `region_size` bytes starting at `address`.
    ///
    /// The region must not overlap any region currently registered; this is
    /// not checked. On failure nothing is registered and the chain is
    /// dropped.
    pub fn add(&self, address: usize, region_size: u32, chain: FrameChain) -> Result<(), OutOfMemory> {
        log::trace!(
            "codemap: add {address:#x}..{:#x} ({} records)",
            address.wrapping_add(region_size as usize),
            chain.len() / crate::chain::RECORD_WORDS,
        );

        let writer = self.gate.write();

        // Make sure retiring this region later never has to allocate.
        let live = self.index.len();
        self.retired.lock().unwrap().try_reserve(live + 1)?;

        let raw = RawChain::new(chain);
        let region = Region {
            size: region_size,
            chain: raw.ptr,
            chain_len: raw.len,
        };
        let result = writer.mutate(|| self.index.insert(address, region));
        if let Err(oom) = result {
            // SAFETY: the insert failed, so the index never pointed at it.
            unsafe { raw.free() };
            return Err(oom);
        }
        self.collect();
        Ok(())
    }

    /// Retires the region registered exactly at `address`.
    ///
    /// Such a region must exist. Removing an address that was never added is
    /// a caller bug, only caught in debug builds.
    pub fn remove(&self, address: usize) {
        log::trace!("codemap: remove {address:#x}");
        let writer = self.gate.write();
        let removed = writer.mutate(|| self.index.remove(address));
        if let Some(region) = removed {
            self.retire(region);
        }
        self.collect();
    }

    /// Retires every region starting in `[address, address + size)`, as a
    /// single gated mutation.
    pub fn clear_range(&self, address: usize, size: usize) {
        if size == 0 {
            return;
        }
        log::trace!("codemap: clear {address:#x}..{:#x}", address.wrapping_add(size));
        let writer = self.gate.write();
        writer.mutate(|| {
            self.index
                .remove_range(address, size, |_, region| self.retire(region))
        });
        self.collect();
    }

    fn retire(&self, region: Region) {
        let mut retired = self.retired.lock().unwrap();
        debug_assert!(retired.len() < retired.capacity());
        retired.push(RawChain::of(region));
    }

    /// Frees what readers can no longer reach.
    fn collect(&self) {
        self.index.collect(&self.gate);
        let mut retired = self.retired.lock().unwrap();
        if retired.is_empty() {
            return;
        }
        if self.gate.is_quiescent() {
            log::trace!("codemap: freeing {} retired chains", retired.len());
            for chain in retired.drain(..) {
                // SAFETY: the chain was unlinked before the gate reported no
                // active readers.
                unsafe { chain.free() };
            }
        } else {
            log::debug!("codemap: deferring {} retired chains, readers active", retired.len());
        }
    }

    /// Finds the region containing `address`.
    ///
    /// Returns `None` if no registered region contains it, or if the writer
    /// mutated the map during the lookup, in which case the sample should be
    /// dropped. Never blocks or allocates, so it may be called from a signal
    /// handler.
    pub fn find_region(&self, address: usize) -> Option<RegionHandle<'_>> {
        let guard = self.gate.read();
        let (start, region) = self.index.floor_search(address, &guard)?;
        if address.wrapping_sub(start) >= region.size as usize {
            return None;
        }
        // A torn read could pair one region's chain pointer with another's
        // length; only trust them if nothing changed in between.
        if !guard.validate() {
            return None;
        }
        Some(RegionHandle {
            start,
            size: region.size,
            chain: region.chain,
            chain_len: region.chain_len,
            guard,
        })
    }

    /// Decodes the next frame active at `address` in `region`; see
    /// [`RegionHandle::decode_frames_from`].
    pub fn decode_frames_from(
        region: &RegionHandle<'_>,
        address: usize,
        cursor: usize,
    ) -> (Option<u32>, usize) {
        region.decode_frames_from(address, cursor)
    }

    /// Number of registered regions.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no region is registered.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl Drop for CodeMap {
    fn drop(&mut self) {
        self.index.for_each(|_, region| {
            // SAFETY: `&mut self` rules out readers.
            unsafe { RawChain::of(region).free() }
        });
        for chain in self.retired.get_mut().unwrap().drain(..) {
            // SAFETY: as above.
            unsafe { chain.free() };
        }
    }
}

/// A region found by [`CodeMap::find_region`].
///
/// The handle keeps its reader registered with the gate, which keeps the
/// region's frame chain alive even if the writer retires the region
/// meanwhile. Drop it as soon as the sample has been decoded.
pub struct RegionHandle<'a> {
    start: usize,
    size: u32,
    chain: *mut u32,
    chain_len: usize,
    guard: ReadGuard<'a>,
}

impl RegionHandle<'_> {
    /// Start address of the region.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The region's encoded frame chain.
    pub fn chain(&self) -> &[u32] {
        if self.chain.is_null() {
            return &[];
        }
        // SAFETY: the pointer and length were validated together in
        // `find_region` and the chain is not freed while `self.guard` is
        // registered.
        unsafe { slice::from_raw_parts(self.chain, self.chain_len) }
    }

    /// Replays the chain from `cursor` (0 to start) and returns the next
    /// frame active at `address`, along with the cursor to resume from.
    ///
    /// Calling this repeatedly with the returned cursor until it yields
    /// `None` enumerates every frame active at `address`, each one inlined
    /// into the one before it.
    pub fn decode_frames_from(&self, address: usize, cursor: usize) -> (Option<u32>, usize) {
        next_frame(self.chain(), address.wrapping_sub(self.start), cursor)
    }

    /// Iterates over every frame active at `address`, enclosing-first.
    pub fn frames(&self, address: usize) -> Frames<'_> {
        Frames::new(self.chain(), address.wrapping_sub(self.start))
    }

    /// Whether the writer has left the map alone since this handle's lookup
    /// began.
    ///
    /// The handle itself is always safe to use; this tells the profiler
    /// whether the region may have been retired in the meantime.
    pub fn is_consistent(&self) -> bool {
        self.guard.validate()
    }
}
