//! Address-to-debug-information index for a tracing JIT.
//!
//! A JIT registers every region of machine code it emits, together with a
//! frame chain describing which logical frames are inlined where in that
//! region, and the native stack depth in effect over each part of it. A
//! sampling profiler running in a signal handler can then map an
//! interrupted program counter back to its frames and unwind through the
//! JIT frame, all without locking or allocating.
//!
//! The building blocks are:
//!
//! * [`AddressIndex`], a single-writer, lock-free-reader ordered map from
//!   start addresses to small payloads, with floor search.
//! * [`Gate`], the invalidation flag the writer raises around every mutation
//!   and the reader checks to discard results that raced with one.
//! * [`CodeMap`] and [`DepthMap`], the two indexes a JIT needs.
//! * [`ChainBuilder`] and [`next_frame`], which encode and decode frame
//!   chains.
//! * [`CodeRegistry`], bundling both maps behind one gate, and a
//!   process-wide instance of it reachable through free functions such as
//!   [`code_map_add`] and [`code_map_find_region`].
//!
//! ```
//! use jitmap_codemap::{ChainBuilder, CodeRegistry, Config};
//!
//! let registry = CodeRegistry::new(&Config::new());
//!
//! let mut chain = ChainBuilder::new();
//! chain.enter_frame(4, 0)?;
//! chain.enter_frame(2, 100)?;
//! chain.leave_frame(300);
//! registry.register_code(0x10000, 600, chain.finish(600)?)?;
//!
//! assert_eq!(registry.unpack_traceback(0x10000 + 200), [4, 2]);
//! # Ok::<(), jitmap_codemap::OutOfMemory>(())
//! ```

#![deny(missing_docs)]

mod chain;
mod codemap;
mod config;
mod depthmap;
mod error;
mod gate;
mod global;
mod index;
mod pool;
mod registry;

pub use crate::chain::{ChainBuilder, FrameChain, Frames, RECORD_WORDS, next_frame};
pub use crate::codemap::{CodeMap, RegionHandle};
pub use crate::config::Config;
pub use crate::depthmap::DepthMap;
pub use crate::error::{AlreadyInitialized, MalformedChain, OutOfMemory};
pub use crate::gate::{Gate, ReadGuard, WriteGuard};
pub use crate::global::{
    code_map_add, code_map_decode_frames_from, code_map_find_region, code_map_remove,
    depth_map_add, depth_map_clear_range, depth_map_stack_depth_at, free_code_block,
    gate_is_invalid, initialize, registry,
};
pub use crate::index::{AddressIndex, MAX_HEIGHT, Payload};
pub use crate::registry::CodeRegistry;
