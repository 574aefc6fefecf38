//! Map from blocks of machine code to the native stack depth in effect there.
//!
//! Stack walkers use this to unwind through JIT frames without frame
//! pointers. A block's depth is constant over the whole block, and blocks
//! never overlap. A region is usually registered as several blocks, one per
//! frame-size change, and cleared as a whole when the region is freed.

use crate::config::Config;
use crate::error::OutOfMemory;
use crate::gate::Gate;
use crate::index::{AddressIndex, Payload};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Block size and depth, packed into one word so a reader can never see one
/// without the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Block {
    size: u32,
    depth: u32,
}

impl Payload for Block {
    type Slot = AtomicU64;

    fn store(slot: &AtomicU64, value: Block) {
        slot.store(
            (u64::from(value.size) << 32) | u64::from(value.depth),
            Ordering::Relaxed,
        );
    }

    fn load(slot: &AtomicU64) -> Block {
        let bits = slot.load(Ordering::Relaxed);
        Block {
            size: (bits >> 32) as u32,
            depth: bits as u32,
        }
    }
}

/// Map from block start addresses to block sizes and stack depths.
pub struct DepthMap {
    gate: Arc<Gate>,
    index: AddressIndex<Block>,
}

impl DepthMap {
    /// Creates an empty map whose mutations are bracketed by `gate`.
    pub fn new(config: &Config, gate: Arc<Gate>) -> DepthMap {
        DepthMap {
            gate,
            index: AddressIndex::new(config),
        }
    }

    /// The gate this map's mutations are bracketed by.
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// Records that code in `[address, address + size)` runs at
    /// `stack_depth`.
    ///
    /// The block must not overlap a registered block; clear the range first
    /// when re-registering a region in smaller pieces.
    pub fn add(&self, address: usize, size: u32, stack_depth: u32) -> Result<(), OutOfMemory> {
        log::trace!(
            "depthmap: add {address:#x}..{:#x} depth={stack_depth}",
            address.wrapping_add(size as usize)
        );
        let block = Block {
            size,
            depth: stack_depth,
        };
        let writer = self.gate.write();
        writer.mutate(|| self.index.insert(address, block))?;
        self.index.collect(&self.gate);
        Ok(())
    }

    /// Removes every block starting in `[address, address + size)`.
    ///
    /// The whole clear is one gated mutation, so a reader either sees all of
    /// the range or none of it. Does nothing if `size` is zero.
    pub fn clear_range(&self, address: usize, size: usize) {
        if size == 0 {
            return;
        }
        log::trace!("depthmap: clear {address:#x}..{:#x}", address.wrapping_add(size));
        let writer = self.gate.write();
        writer.mutate(|| self.index.remove_range(address, size, |_, _| {}));
        self.index.collect(&self.gate);
    }

    /// Returns the stack depth in effect at `address`.
    ///
    /// `None` if no block contains `address` or if the writer was mutating
    /// the map during the lookup. Never blocks or allocates, so it may be
    /// called from a signal handler.
    pub fn stack_depth_at(&self, address: usize) -> Option<u32> {
        let guard = self.gate.read();
        let (start, block) = self.index.floor_search(address, &guard)?;
        if address.wrapping_sub(start) >= block.size as usize {
            return None;
        }
        if !guard.validate() {
            return None;
        }
        Some(block.depth)
    }

    /// Number of registered blocks.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no block is registered.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> DepthMap {
        DepthMap::new(&Config::new(), Arc::new(Gate::new()))
    }

    #[test]
    fn add_lookup_clear() {
        let map = map();
        map.add(0x2000, 16, 3).unwrap();
        assert_eq!(map.stack_depth_at(0x2000), Some(3));
        assert_eq!(map.stack_depth_at(0x200f), Some(3));
        assert_eq!(map.stack_depth_at(0x2010), None);
        assert_eq!(map.stack_depth_at(0x1fff), None);

        map.clear_range(0x2000, 16);
        assert_eq!(map.stack_depth_at(0x2000), None);
        assert!(map.is_empty());
    }

    #[test]
    fn clear_leaves_neighbours_alone() {
        let map = map();
        map.add(0x100, 0x10, 1).unwrap();
        map.add(0x110, 0x10, 2).unwrap();
        map.add(0x120, 0x10, 3).unwrap();
        map.add(0x130, 0x10, 4).unwrap();

        map.clear_range(0x110, 0x20);
        assert_eq!(map.stack_depth_at(0x105), Some(1));
        assert_eq!(map.stack_depth_at(0x115), None);
        assert_eq!(map.stack_depth_at(0x125), None);
        assert_eq!(map.stack_depth_at(0x135), Some(4));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn clear_of_empty_range_is_a_no_op() {
        let map = map();
        map.add(0x100, 0x10, 1).unwrap();
        map.clear_range(0x100, 0);
        assert_eq!(map.stack_depth_at(0x100), Some(1));
    }

    #[test]
    fn reregister_in_smaller_pieces() {
        let map = map();
        map.add(0x4000, 0x100, 8).unwrap();
        map.clear_range(0x4000, 0x100);
        map.add(0x4000, 0x40, 8).unwrap();
        map.add(0x4040, 0xc0, 24).unwrap();
        assert_eq!(map.stack_depth_at(0x403f), Some(8));
        assert_eq!(map.stack_depth_at(0x4040), Some(24));
        assert_eq!(map.stack_depth_at(0x4100), None);
    }

    #[test]
    fn gate_is_set_once_for_a_whole_clear() {
        let map = map();
        for i in 0..4 {
            map.add(0x100 + i * 0x10, 0x10, i as u32).unwrap();
        }
        let guard = map.gate().read();
        let before = map.gate().sequence();
        map.clear_range(0x100, 0x40);
        assert_eq!(map.gate().sequence() - before, 2);
        assert!(!guard.validate());
        assert!(map.is_empty());
    }

    #[test]
    fn packed_block_round_trips_extremes() {
        let slot = AtomicU64::new(0);
        let block = Block {
            size: u32::MAX,
            depth: u32::MAX - 1,
        };
        Block::store(&slot, block);
        assert_eq!(Block::load(&slot), block);
    }
}
