//! A code map and a depth map sharing one gate.
//!
//! This is what a JIT backend holds on to: one place to register a freshly
//! emitted region (its frame chain and its stack-depth blocks) and one place
//! to drop it all again when the machine code is freed. A profiler reads both
//! maps through the same gate, so one validation covers a whole sample.

use crate::chain::FrameChain;
use crate::codemap::{CodeMap, RegionHandle};
use crate::config::Config;
use crate::depthmap::DepthMap;
use crate::error::OutOfMemory;
use crate::gate::Gate;
use std::sync::Arc;

/// The code and depth maps of one JIT, behind one gate.
pub struct CodeRegistry {
    gate: Arc<Gate>,
    code: CodeMap,
    depth: DepthMap,
}

impl CodeRegistry {
    /// Creates an empty registry.
    pub fn new(config: &Config) -> CodeRegistry {
        let gate = Arc::new(Gate::new());
        CodeRegistry {
            code: CodeMap::new(config, gate.clone()),
            depth: DepthMap::new(config, gate.clone()),
            gate,
        }
    }

    /// The gate shared by both maps.
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// The code map.
    pub fn code(&self) -> &CodeMap {
        &self.code
    }

    /// The depth map.
    pub fn depth(&self) -> &DepthMap {
        &self.depth
    }

    /// Registers the frame chain of the region `[address, address + size)`.
    pub fn register_code(&self, address: usize, size: u32, chain: FrameChain) -> Result<(), OutOfMemory> {
        self.code.add(address, size, chain).inspect_err(|e| {
            log::warn!("registry: no frame information for {address:#x}: {e}");
        })
    }

    /// Unregisters the region registered at `address`.
    pub fn unregister_code(&self, address: usize) {
        self.code.remove(address);
    }

    /// Registers the stack depths of the region `[start, stop)`.
    ///
    /// `positions` are ascending offsets from `start` at which the depth
    /// changes to the matching entry of `depths`. Each depth holds until the
    /// next position, or until `stop` for the last one. Pieces that would be
    /// empty are skipped.
    ///
    /// If an allocation fails, the blocks already registered for this region
    /// are cleared again before the error is returned.
    pub fn register_frame_depth_map(
        &self,
        start: usize,
        stop: usize,
        positions: &[u32],
        depths: &[u32],
    ) -> Result<(), OutOfMemory> {
        debug_assert_eq!(positions.len(), depths.len());
        log::trace!(
            "registry: {} depth blocks for {start:#x}..{stop:#x}",
            positions.len()
        );
        let region_len = stop.wrapping_sub(start);
        for (i, (&pos, &depth)) in positions.iter().zip(depths).enumerate() {
            let pos = pos as usize;
            let next = positions
                .get(i + 1)
                .map_or(region_len, |&next| next as usize);
            if next <= pos {
                continue;
            }
            let size = u32::try_from(next - pos).unwrap_or(u32::MAX);
            if let Err(e) = self.depth.add(start + pos, size, depth) {
                log::warn!("registry: no stack depths for {start:#x}..{stop:#x}: {e}");
                self.depth.clear_range(start, region_len);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drops everything registered for the machine code in `[start, stop)`.
    pub fn free_code_block(&self, start: usize, stop: usize) {
        log::debug!("registry: freeing code block {start:#x}..{stop:#x}");
        let len = stop.saturating_sub(start);
        self.depth.clear_range(start, len);
        self.code.clear_range(start, len);
    }

    /// Finds the region containing `address`; see [`CodeMap::find_region`].
    pub fn find_region(&self, address: usize) -> Option<RegionHandle<'_>> {
        self.code.find_region(address)
    }

    /// The stack depth at `address`; see [`DepthMap::stack_depth_at`].
    pub fn stack_depth_at(&self, address: usize) -> Option<u32> {
        self.depth.stack_depth_at(address)
    }

    /// Returns every frame active at `address`, enclosing-first.
    ///
    /// Empty if `address` is not in a registered region or the lookup raced
    /// with the writer. This allocates; from a signal handler use
    /// [`CodeRegistry::unpack_traceback_into`] instead.
    pub fn unpack_traceback(&self, address: usize) -> Vec<u32> {
        let Some(region) = self.find_region(address) else {
            return Vec::new();
        };
        let frames: Vec<u32> = region.frames(address).collect();
        if !region.is_consistent() {
            return Vec::new();
        }
        frames
    }

    /// Writes the frames active at `address` into `out`, enclosing-first,
    /// and returns how many were written.
    ///
    /// Stops once `out` is full, keeping the outermost frames. Returns `None`
    /// if `address` is not in a registered region or if the writer mutated
    /// the maps before the walk finished. Never blocks or allocates.
    pub fn unpack_traceback_into(&self, address: usize, out: &mut [u32]) -> Option<usize> {
        let region = self.find_region(address)?;
        let mut n = 0;
        for (slot, frame) in out.iter_mut().zip(region.frames(address)) {
            *slot = frame;
            n += 1;
        }
        if !region.is_consistent() {
            return None;
        }
        Some(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainBuilder;

    fn registry() -> CodeRegistry {
        let _ = env_logger::try_init();
        CodeRegistry::new(&Config::new())
    }

    /// A loop in frame 4 with frame 2 inlined over `[100, 300)`.
    fn recursive_trace() -> FrameChain {
        let mut builder = ChainBuilder::new();
        builder.enter_frame(4, 0).unwrap();
        builder.enter_frame(2, 100).unwrap();
        assert_eq!(builder.leave_frame(300), Some(2));
        builder.finish(600).unwrap()
    }

    #[test]
    fn inlined_traceback() {
        let reg = registry();
        reg.register_code(0x10000, 600, recursive_trace()).unwrap();

        assert_eq!(reg.unpack_traceback(0x10000 + 200), [4, 2]);
        assert_eq!(reg.unpack_traceback(0x10000 + 400), [4]);
        assert_eq!(reg.unpack_traceback(0x10000 + 600), Vec::<u32>::new());

        let mut buf = [0; 8];
        assert_eq!(reg.unpack_traceback_into(0x10000 + 250, &mut buf), Some(2));
        assert_eq!(buf[..2], [4, 2]);
        assert_eq!(reg.unpack_traceback_into(0x20000, &mut buf), None);
    }

    #[test]
    fn traceback_into_small_buffer_keeps_outermost() {
        let reg = registry();
        reg.register_code(0x10000, 600, recursive_trace()).unwrap();
        let mut buf = [0; 1];
        assert_eq!(reg.unpack_traceback_into(0x10000 + 200, &mut buf), Some(1));
        assert_eq!(buf, [4]);
        assert_eq!(reg.unpack_traceback_into(0x10000 + 200, &mut []), Some(0));
    }

    #[test]
    fn bridge_inherits_frames() {
        let reg = registry();
        reg.register_code(0x10000, 600, recursive_trace()).unwrap();

        let mut bridge = ChainBuilder::new();
        bridge
            .inherit_frames(&reg.unpack_traceback(0x10000 + 200))
            .unwrap();
        bridge.enter_frame(9, 16).unwrap();
        bridge.leave_frame(32);
        reg.register_code(0x20000, 64, bridge.finish(64).unwrap())
            .unwrap();

        assert_eq!(reg.unpack_traceback(0x20000 + 20), [4, 2, 9]);
        assert_eq!(reg.unpack_traceback(0x20000 + 40), [4, 2]);
    }

    #[test]
    fn frame_depth_map() {
        let reg = registry();
        reg.register_frame_depth_map(0x1000, 0x1100, &[0, 0x10, 0x10, 0x80], &[8, 24, 32, 16])
            .unwrap();
        assert_eq!(reg.stack_depth_at(0x1000), Some(8));
        assert_eq!(reg.stack_depth_at(0x100f), Some(8));
        // The empty piece at 0x10 is skipped, the later position wins.
        assert_eq!(reg.stack_depth_at(0x1010), Some(32));
        assert_eq!(reg.stack_depth_at(0x107f), Some(32));
        assert_eq!(reg.stack_depth_at(0x10ff), Some(16));
        assert_eq!(reg.stack_depth_at(0x1100), None);
        assert_eq!(reg.depth().len(), 3);
    }

    #[test]
    fn free_code_block_only_touches_the_block() {
        let reg = registry();
        reg.register_code(0x1000, 0x100, FrameChain::try_from_slice(&[1, 0, 0x100, 4]).unwrap())
            .unwrap();
        reg.register_code(0x2000, 0x100, FrameChain::try_from_slice(&[2, 0, 0x100, 4]).unwrap())
            .unwrap();
        reg.register_frame_depth_map(0x1000, 0x1100, &[0], &[8]).unwrap();
        reg.register_frame_depth_map(0x2000, 0x2100, &[0], &[16]).unwrap();

        reg.free_code_block(0x1000, 0x1100);
        assert!(reg.find_region(0x1050).is_none());
        assert_eq!(reg.stack_depth_at(0x1050), None);
        assert_eq!(reg.unpack_traceback(0x2050), [2]);
        assert_eq!(reg.stack_depth_at(0x2050), Some(16));
        assert_eq!(reg.code().len(), 1);
        assert_eq!(reg.depth().len(), 1);
    }

    #[test]
    fn unregister_then_reregister() {
        let reg = registry();
        reg.register_code(0x1000, 0x10, FrameChain::try_from_slice(&[1, 0, 0x10, 4]).unwrap())
            .unwrap();
        reg.unregister_code(0x1000);
        assert!(reg.unpack_traceback(0x1000).is_empty());
        reg.register_code(0x1000, 0x20, FrameChain::try_from_slice(&[3, 0, 0x20, 4]).unwrap())
            .unwrap();
        assert_eq!(reg.unpack_traceback(0x101f), [3]);
    }

    #[test]
    fn depth_map_is_rolled_back_when_out_of_memory() {
        let _ = env_logger::try_init();
        let reg = CodeRegistry::new(Config::new().max_nodes(2));
        let err = reg
            .register_frame_depth_map(0x1000, 0x1100, &[0, 0x40, 0x80], &[8, 16, 24])
            .unwrap_err();
        assert!(err.requested_bytes() > 0);
        assert!(reg.depth().is_empty());
        for pc in [0x1000, 0x1040, 0x1080] {
            assert_eq!(reg.stack_depth_at(pc), None);
        }
        assert!(!reg.gate().is_invalid());

        // The nodes of the rolled back blocks are available again.
        reg.register_frame_depth_map(0x1000, 0x1100, &[0, 0x80], &[8, 24])
            .unwrap();
        assert_eq!(reg.stack_depth_at(0x1040), Some(8));
        assert_eq!(reg.stack_depth_at(0x1090), Some(24));
    }

    #[test]
    fn register_code_out_of_memory_registers_nothing() {
        let _ = env_logger::try_init();
        let reg = CodeRegistry::new(Config::new().max_nodes(1));
        let chain = |id| FrameChain::try_from_slice(&[id, 0, 0x10, 4]).unwrap();
        reg.register_code(0x1000, 0x10, chain(1)).unwrap();

        assert!(reg.register_code(0x2000, 0x10, chain(2)).is_err());
        assert!(reg.find_region(0x2008).is_none());
        assert_eq!(reg.code().len(), 1);
        assert_eq!(reg.unpack_traceback(0x1008), [1]);

        reg.unregister_code(0x1000);
        reg.register_code(0x2000, 0x10, chain(2)).unwrap();
        assert_eq!(reg.unpack_traceback(0x2008), [2]);
    }

    #[test]
    fn readers_see_one_gate() {
        let reg = registry();
        reg.register_frame_depth_map(0x1000, 0x1010, &[0], &[8]).unwrap();
        reg.gate().set_invalid();
        assert!(reg.code().gate().is_invalid());
        assert!(reg.depth().gate().is_invalid());
        assert_eq!(reg.stack_depth_at(0x1000), None);
        reg.gate().clear_invalid();
        assert_eq!(reg.stack_depth_at(0x1000), Some(8));
    }
}
