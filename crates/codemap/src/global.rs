//! The process-wide registry.
//!
//! A JIT usually has exactly one code registry and the profiler's signal
//! handler has no way to be handed a reference to it, so both sides can go
//! through these free functions instead. The registry is created on the
//! first writer call, or earlier and with a custom [`Config`] through
//! [`initialize`]. It is never torn down.
//!
//! Reader functions never create the registry: before anything was
//! registered they simply find nothing.

use crate::chain::FrameChain;
use crate::codemap::RegionHandle;
use crate::config::Config;
use crate::error::{AlreadyInitialized, OutOfMemory};
use crate::registry::CodeRegistry;
use std::sync::OnceLock;

static REGISTRY: OnceLock<CodeRegistry> = OnceLock::new();

/// Creates the process-wide registry with `config`.
///
/// Fails if the registry already exists, including when a writer function
/// created it implicitly with the default configuration.
pub fn initialize(config: &Config) -> Result<(), AlreadyInitialized> {
    let mut created = false;
    REGISTRY.get_or_init(|| {
        created = true;
        log::debug!("global registry: initializing with {config:?}");
        CodeRegistry::new(config)
    });
    if created { Ok(()) } else { Err(AlreadyInitialized) }
}

/// The process-wide registry, if it has been created.
pub fn registry() -> Option<&'static CodeRegistry> {
    REGISTRY.get()
}

fn writer() -> &'static CodeRegistry {
    REGISTRY.get_or_init(|| CodeRegistry::new(&Config::default()))
}

/// Registers a code region; see [`CodeRegistry::register_code`].
pub fn code_map_add(address: usize, size: u32, chain: FrameChain) -> Result<(), OutOfMemory> {
    writer().register_code(address, size, chain)
}

/// Unregisters the region at `address`; see [`CodeRegistry::unregister_code`].
pub fn code_map_remove(address: usize) {
    writer().unregister_code(address);
}

/// Registers a stack-depth block; see [`DepthMap::add`](crate::DepthMap::add).
pub fn depth_map_add(address: usize, size: u32, stack_depth: u32) -> Result<(), OutOfMemory> {
    writer().depth().add(address, size, stack_depth)
}

/// Clears stack-depth blocks; see
/// [`DepthMap::clear_range`](crate::DepthMap::clear_range).
pub fn depth_map_clear_range(address: usize, size: usize) {
    writer().depth().clear_range(address, size);
}

/// Drops all code and depth information in `[start, stop)`; see
/// [`CodeRegistry::free_code_block`].
pub fn free_code_block(start: usize, stop: usize) {
    writer().free_code_block(start, stop);
}

/// Finds the region containing `address`. Signal-safe.
pub fn code_map_find_region(address: usize) -> Option<RegionHandle<'static>> {
    REGISTRY.get()?.find_region(address)
}

/// Decodes the next frame active at `address`. Signal-safe.
///
/// See [`RegionHandle::decode_frames_from`].
pub fn code_map_decode_frames_from(
    region: &RegionHandle<'_>,
    address: usize,
    cursor: usize,
) -> (Option<u32>, usize) {
    region.decode_frames_from(address, cursor)
}

/// The stack depth at `address`. Signal-safe.
pub fn depth_map_stack_depth_at(address: usize) -> Option<u32> {
    REGISTRY.get()?.stack_depth_at(address)
}

/// Whether the writer is in the middle of a mutation. Signal-safe.
///
/// False before the registry exists.
pub fn gate_is_invalid() -> bool {
    REGISTRY.get().is_some_and(|r| r.gate().is_invalid())
}
